//! REST handlers
//!
//! Thin adapters between HTTP and the registry. The core writes multipart
//! bodies and JSON records; status codes and headers are decided here.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::camera::registry::{CameraStats, CameraSummary, GetLatest};
use crate::camera::spec::CameraSpec;
use crate::capture::ProbeReport;
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Unified mutation response
#[derive(Serialize)]
pub struct OkResponse {
    pub success: bool,
}

const OK: Json<OkResponse> = Json(OkResponse { success: true });

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// List all cameras with live phase and fps numbers
pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<Vec<CameraSummary>> {
    Json(state.registry.enumerate().await)
}

/// Register a new camera
pub async fn create_camera(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<CameraSpec>,
) -> Result<Json<OkResponse>> {
    state.registry.create(spec).await?;
    Ok(OK)
}

/// Full stats for one camera
pub async fn camera_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CameraStats>> {
    Ok(Json(state.registry.stats(&id).await?))
}

/// Remove a camera; subscribers receive a terminal frame
pub async fn delete_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.registry.remove(&id).await?;
    Ok(OK)
}

pub async fn start_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.registry.start(&id).await?;
    Ok(OK)
}

pub async fn stop_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.registry.stop(&id).await?;
    Ok(OK)
}

/// Optional body carrying a replacement spec
#[derive(Deserialize, Default)]
pub struct ReloadRequest {
    pub spec: Option<CameraSpec>,
}

pub async fn reload_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ReloadRequest>>,
) -> Result<Json<OkResponse>> {
    let spec = body.and_then(|Json(req)| req.spec);
    state.registry.reload(&id, spec).await?;
    Ok(OK)
}

pub async fn show_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.registry.show(&id).await?;
    Ok(OK)
}

pub async fn hide_camera(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>> {
    state.registry.hide(&id).await?;
    Ok(OK)
}

/// Most recent failure record for one camera
pub async fn camera_debug(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state
        .status
        .get(&format!("camera_debug:{id}"))
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no debug record for camera {id}")))
}

/// MJPEG stream endpoint
///
/// The publisher paces, encodes and frames the parts; this handler only
/// owns the HTTP response envelope and forwards framed chunks.
pub async fn mjpeg_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    let mut subscription = state.registry.subscribe_preview(&id).await?;

    let body_stream = async_stream::stream! {
        while let Some(part) = subscription.rx.recv().await {
            yield Ok::<bytes::Bytes, std::io::Error>(part);
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::Internal(e.to_string()))?)
}

/// Single JPEG snapshot of the latest frame
pub async fn snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    match state.registry.snapshot(&id).await? {
        Some(jpeg) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(jpeg))
            .map_err(|e| AppError::Internal(e.to_string()))?),
        None => Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("No frame available"))
            .map_err(|e| AppError::Internal(e.to_string()))?),
    }
}

/// Probe request body
#[derive(Deserialize)]
pub struct ProbeRequest {
    pub uri: String,
    pub transport: Option<String>,
    /// Run short trial decodes across transport/hwaccel combinations
    #[serde(default)]
    pub sample: bool,
}

/// One-shot stream probe
pub async fn probe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProbeRequest>,
) -> Result<Json<ProbeReport>> {
    let report = state
        .registry
        .probe(&req.uri, req.transport.as_deref(), req.sample)
        .await?;
    Ok(Json(report))
}

/// Query parameters for the frame poll endpoint
#[derive(Deserialize)]
pub struct LatestQuery {
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

/// Frame metadata poll for analytics consumers.
///
/// Returns the newest frame's metadata past `last_seen`, or a marker for
/// timeout / missing source. Payload bytes stay in-process; analytics
/// consumers run in the same address space and use the library API.
pub async fn latest_frame(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<serde_json::Value>> {
    let timeout = Duration::from_millis(query.timeout_ms.min(30_000));
    match state
        .registry
        .get_latest(&id, query.last_seen, timeout)
        .await?
    {
        GetLatest::Frame(frame) => Ok(Json(serde_json::json!({
            "result": "frame",
            "sequence": frame.sequence,
            "width": frame.width(),
            "height": frame.height(),
            "format": frame.format,
            "size": frame.len(),
        }))),
        GetLatest::Timeout => Ok(Json(serde_json::json!({ "result": "timeout" }))),
        GetLatest::NoSource => Ok(Json(serde_json::json!({ "result": "no_source" }))),
    }
}
