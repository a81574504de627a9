use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // Camera lifecycle
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras", post(handlers::create_camera))
        .route("/cameras/:id", get(handlers::camera_stats))
        .route("/cameras/:id", delete(handlers::delete_camera))
        .route("/cameras/:id/start", post(handlers::start_camera))
        .route("/cameras/:id/stop", post(handlers::stop_camera))
        .route("/cameras/:id/reload", post(handlers::reload_camera))
        .route("/cameras/:id/show", post(handlers::show_camera))
        .route("/cameras/:id/hide", post(handlers::hide_camera))
        .route("/cameras/:id/stats", get(handlers::camera_stats))
        .route("/cameras/:id/debug", get(handlers::camera_debug))
        // Streaming
        .route("/cameras/:id/mjpeg", get(handlers::mjpeg_stream))
        .route("/cameras/:id/snapshot", get(handlers::snapshot))
        .route("/cameras/:id/latest", get(handlers::latest_frame))
        // Probing
        .route("/probe", post(handlers::probe));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
