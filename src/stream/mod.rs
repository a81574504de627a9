//! Frame transport: per-camera ring buffer and MJPEG preview fan-out

pub mod bus;
pub mod frame;
pub mod mjpeg;

pub use bus::{BusInfo, FrameBus};
pub use frame::{Frame, FrameFormat, Resolution};
pub use mjpeg::PreviewPublisher;
