//! HTTP layer: axum routes and handlers over the camera registry

pub mod handlers;
pub mod routes;

pub use routes::create_router;
