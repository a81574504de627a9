//! Camera fleet management: specs, registry, per-camera pipelines,
//! reconnect state machine and the stall watchdog.

pub mod pipeline;
pub mod reconnect;
pub mod registry;
pub mod spec;
pub mod watchdog;

pub use pipeline::CameraPipeline;
pub use reconnect::{Phase, ReconnectController};
pub use registry::{CameraRegistry, CameraStats, GetLatest};
pub use spec::{CameraSpec, ResolvedCameraSpec, ResolutionSpec, SourceMode, Transport};
