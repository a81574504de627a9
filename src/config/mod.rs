//! Configuration schema and store

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, CaptureSettings, ReconnectSettings, StreamSettings, WebConfig,
};
pub use store::ConfigStore;
