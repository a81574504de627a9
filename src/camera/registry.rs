//! Camera registry
//!
//! Process-wide owner of live pipelines. The outer map lock guards only the
//! map; every lifecycle transition (start, stop, reload, remove) runs under
//! the target camera's own lock, so transitions for one camera are totally
//! ordered while different cameras never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::capture::{CaptureMetrics, ProbeReport, StreamProber};
use crate::camera::pipeline::CameraPipeline;
use crate::camera::reconnect::Phase;
use crate::camera::spec::CameraSpec;
use crate::config::ConfigStore;
use crate::error::{AppError, ErrorCode, Result};
use crate::status::StatusStore;
use crate::stream::frame::Frame;
use crate::stream::mjpeg::PreviewSubscription;

/// One row of `enumerate()`
#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub id: String,
    pub phase: Phase,
    pub last_error: Option<ErrorCode>,
    pub fps_in: f64,
    pub fps_out: f64,
    pub width: u32,
    pub height: u32,
}

/// Full stats record for one camera
#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    pub id: String,
    pub phase: Phase,
    pub fps_in: f64,
    pub fps_out: f64,
    pub width: u32,
    pub height: u32,
    pub last_error: Option<ErrorCode>,
    pub consecutive_failures: u32,
    pub next_attempt_in_ms: Option<u64>,
    pub restarts: u64,
    pub preview_clients: usize,
    pub capture: CaptureMetrics,
}

/// Outcome of a `get_latest` poll
pub enum GetLatest {
    Frame(Frame),
    Timeout,
    NoSource,
}

/// Process-wide map from camera id to live pipeline
pub struct CameraRegistry {
    config: ConfigStore,
    status: Arc<StatusStore>,
    prober: Arc<StreamProber>,
    cameras: RwLock<HashMap<String, Arc<CameraPipeline>>>,
}

impl CameraRegistry {
    pub fn new(config: ConfigStore, status: Arc<StatusStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            status,
            prober: Arc::new(StreamProber::new()),
            cameras: RwLock::new(HashMap::new()),
        })
    }

    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.status
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub fn config_snapshot(&self) -> Arc<crate::config::AppConfig> {
        self.config.get()
    }

    /// Build pipelines for every camera in the loaded configuration and
    /// start the enabled ones. Called once at startup.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let config = self.config.get();
        for spec in &config.cameras {
            if let Err(e) = self.create_internal(spec.clone(), false).await {
                tracing::error!(camera_id = %spec.id, error = %e, "Skipping invalid camera");
                continue;
            }
            if spec.enabled {
                if let Err(e) = self.start(&spec.id).await {
                    tracing::warn!(camera_id = %spec.id, error = %e, "Autostart failed");
                }
            }
        }
        Ok(())
    }

    /// Register a new camera.
    ///
    /// Fails with `ALREADY_EXISTS` when the id is taken and `INVALID_SPEC`
    /// on a bad uri, resolution or mode. The spec is persisted before the
    /// pipeline starts.
    pub async fn create(self: &Arc<Self>, spec: CameraSpec) -> Result<()> {
        self.create_internal(spec.clone(), true).await?;
        if spec.enabled {
            self.start(&spec.id).await?;
        }
        Ok(())
    }

    async fn create_internal(self: &Arc<Self>, spec: CameraSpec, persist: bool) -> Result<()> {
        let config = self.config.get();
        let resolved = spec.resolve(&config.overrides, &config.profiles)?;

        {
            let mut cameras = self.cameras.write().await;
            if cameras.contains_key(&resolved.id) {
                return Err(AppError::camera(
                    ErrorCode::AlreadyExists,
                    format!("camera {} already exists", resolved.id),
                ));
            }
            let pipeline = CameraPipeline::new(
                resolved,
                self.config.clone(),
                self.status.clone(),
                self.prober.clone(),
            );
            cameras.insert(spec.id.clone(), pipeline);
        }

        if persist {
            self.config
                .update(|c| {
                    c.cameras.retain(|cam| cam.id != spec.id);
                    c.cameras.push(spec.clone());
                })
                .await?;
        }
        tracing::info!(camera_id = %spec.id, "Camera created");
        Ok(())
    }

    async fn pipeline(&self, id: &str) -> Result<Arc<CameraPipeline>> {
        self.cameras
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("camera {id}")))
    }

    /// Start capture. Idempotent; refused synchronously while the breaker
    /// is open.
    pub async fn start(&self, id: &str) -> Result<()> {
        let pipeline = self.pipeline(id).await?;
        let _guard = pipeline.lifecycle.lock().await;
        pipeline.start()
    }

    /// Stop capture. The preview publisher keeps serving heartbeats.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let pipeline = self.pipeline(id).await?;
        let _guard = pipeline.lifecycle.lock().await;
        pipeline.stop().await;
        Ok(())
    }

    /// Stop, replace the spec (or re-resolve the existing one), rebuild the
    /// pipeline and start again. The bus is rebuilt, so sequence numbers
    /// reset; subscribers detect the decrease and resynchronize.
    pub async fn reload(self: &Arc<Self>, id: &str, new_spec: Option<CameraSpec>) -> Result<()> {
        let old = self.pipeline(id).await?;
        let _guard = old.lifecycle.lock().await;

        let spec = match new_spec {
            Some(spec) => {
                if spec.id != id {
                    return Err(AppError::camera(
                        ErrorCode::InvalidSpec,
                        format!("spec id {} does not match camera {id}", spec.id),
                    ));
                }
                spec
            }
            None => {
                let config = self.config.get();
                config
                    .cameras
                    .iter()
                    .find(|c| c.id == id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("camera {id}")))?
            }
        };
        let config = self.config.get();
        let resolved = spec.resolve(&config.overrides, &config.profiles)?;

        old.shutdown().await;

        let pipeline = CameraPipeline::new(
            resolved,
            self.config.clone(),
            self.status.clone(),
            self.prober.clone(),
        );
        self.cameras
            .write()
            .await
            .insert(id.to_string(), pipeline.clone());

        self.config
            .update(|c| {
                c.cameras.retain(|cam| cam.id != id);
                c.cameras.push(spec.clone());
            })
            .await?;

        if spec.enabled {
            pipeline.start()?;
        }
        tracing::info!(camera_id = %id, "Camera reloaded");
        Ok(())
    }

    /// Stop and delete. Preview subscribers receive a terminal frame and
    /// disconnect.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let pipeline = self.pipeline(id).await?;
        {
            let _guard = pipeline.lifecycle.lock().await;
            pipeline.shutdown().await;
        }
        self.cameras.write().await.remove(id);
        self.config
            .update(|c| c.cameras.retain(|cam| cam.id != id))
            .await?;
        tracing::info!(camera_id = %id, "Camera removed");
        Ok(())
    }

    /// Enable preview for a camera.
    pub async fn show(&self, id: &str) -> Result<()> {
        self.set_show(id, true).await
    }

    /// Disable preview. Capture continues regardless.
    pub async fn hide(&self, id: &str) -> Result<()> {
        self.set_show(id, false).await
    }

    async fn set_show(&self, id: &str, show: bool) -> Result<()> {
        let pipeline = self.pipeline(id).await?;
        pipeline.publisher().set_enabled(show);
        self.config
            .update(|c| {
                if let Some(cam) = c.cameras.iter_mut().find(|cam| cam.id == id) {
                    cam.show = show;
                }
            })
            .await?;
        Ok(())
    }

    /// Open an MJPEG subscription for the HTTP handler.
    pub async fn subscribe_preview(&self, id: &str) -> Result<PreviewSubscription> {
        let pipeline = self.pipeline(id).await?;
        pipeline.publisher().subscribe()
    }

    /// Latest JPEG for the snapshot endpoint.
    pub async fn snapshot(&self, id: &str) -> Result<Option<bytes::Bytes>> {
        let pipeline = self.pipeline(id).await?;
        Ok(pipeline.publisher().snapshot_jpeg())
    }

    /// Frame poll for analytics consumers.
    pub async fn get_latest(
        &self,
        id: &str,
        last_seen: u64,
        timeout: Duration,
    ) -> Result<GetLatest> {
        let pipeline = self.pipeline(id).await?;
        if matches!(pipeline.phase(), Phase::Idle | Phase::Stopped) {
            return Ok(GetLatest::NoSource);
        }
        match pipeline.bus().get_latest(last_seen, timeout).await {
            Some(frame) => Ok(GetLatest::Frame(frame)),
            None => Ok(GetLatest::Timeout),
        }
    }

    /// One-shot probe of an arbitrary URI.
    pub async fn probe(
        &self,
        uri: &str,
        transport: Option<&str>,
        sample: bool,
    ) -> Result<ProbeReport> {
        let config = self.config.get();
        self.prober
            .probe(uri, transport, sample, &config.capture)
            .await
    }

    /// Summary of all cameras.
    pub async fn enumerate(&self) -> Vec<CameraSummary> {
        let cameras = self.cameras.read().await;
        let mut rows: Vec<CameraSummary> = cameras
            .values()
            .map(|pipeline| {
                let info = pipeline.bus().info();
                let snap = pipeline.controller().snapshot();
                CameraSummary {
                    id: pipeline.id(),
                    phase: snap.phase,
                    last_error: snap.last_error,
                    fps_in: info.fps,
                    fps_out: pipeline.publisher().fps_out(),
                    width: info.width,
                    height: info.height,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Full stats for one camera.
    pub async fn stats(&self, id: &str) -> Result<CameraStats> {
        let pipeline = self.pipeline(id).await?;
        let info = pipeline.bus().info();
        let snap = pipeline.controller().snapshot();
        Ok(CameraStats {
            id: pipeline.id(),
            phase: snap.phase,
            fps_in: info.fps,
            fps_out: pipeline.publisher().fps_out(),
            width: info.width,
            height: info.height,
            last_error: snap.last_error,
            consecutive_failures: snap.consecutive_failures,
            next_attempt_in_ms: snap.next_attempt_in.map(|d| d.as_millis() as u64),
            restarts: pipeline.restarts(),
            preview_clients: pipeline.publisher().client_count(),
            capture: pipeline.metrics(),
        })
    }

    /// All live pipelines (watchdog sweep).
    pub async fn pipelines(&self) -> Vec<Arc<CameraPipeline>> {
        self.cameras.read().await.values().cloned().collect()
    }

    /// Stop every pipeline (process shutdown).
    pub async fn shutdown_all(&self) {
        let pipelines = self.pipelines().await;
        for pipeline in pipelines {
            pipeline.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::spec::{BackendKind, Transport};
    use tempfile::tempdir;

    fn spec(id: &str) -> CameraSpec {
        CameraSpec {
            id: id.to_string(),
            mode: None,
            uri: format!("rtsp://u:p@10.0.0.5/{id}"),
            transport_preference: Transport::Tcp,
            resolution: "1280x720".parse().unwrap(),
            ready_frames: 1,
            ready_duration_ms: 0,
            ready_timeout_ms: 15_000,
            backend_priority: vec![BackendKind::Ffmpeg],
            extra_decoder_flags: String::new(),
            profile_name: None,
            show: false,
            // Disabled so tests never spawn a decoder process
            enabled: false,
        }
    }

    async fn registry() -> (Arc<CameraRegistry>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = ConfigStore::open(&dir.path().join("c.json")).await.unwrap();
        let registry = CameraRegistry::new(config, Arc::new(StatusStore::new()));
        (registry, dir)
    }

    #[tokio::test]
    async fn test_create_and_enumerate() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        registry.create(spec("dock")).await.unwrap();

        let rows = registry.enumerate().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "dock");
        assert_eq!(rows[1].id, "lobby");
        assert_eq!(rows[0].phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        let err = registry.create(spec("lobby")).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AlreadyExists));
    }

    #[tokio::test]
    async fn test_create_invalid_spec_rejected() {
        let (registry, _dir) = registry().await;
        let mut bad = spec("x");
        bad.uri = String::new();
        let err = registry.create(bad).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidSpec));
    }

    #[tokio::test]
    async fn test_create_persists_to_config() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        let config = registry.config.get();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].id, "lobby");
    }

    #[tokio::test]
    async fn test_remove_clears_camera() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        registry.remove("lobby").await.unwrap();
        assert!(registry.enumerate().await.is_empty());
        assert_eq!(registry.config.get().cameras.len(), 0);
        assert!(matches!(
            registry.stats("lobby").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_show_hide_toggle_publisher() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();

        assert!(registry.subscribe_preview("lobby").await.is_err());
        registry.show("lobby").await.unwrap();
        assert!(registry.subscribe_preview("lobby").await.is_ok());
        registry.hide("lobby").await.unwrap();
        let err = registry.subscribe_preview("lobby").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PreviewDisabled));
        // Persisted
        assert!(!registry.config.get().cameras[0].show);
    }

    #[tokio::test]
    async fn test_get_latest_no_source_when_idle() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        match registry
            .get_latest("lobby", 0, Duration::from_millis(10))
            .await
            .unwrap()
        {
            GetLatest::NoSource => {}
            _ => panic!("expected NoSource for idle camera"),
        }
    }

    #[tokio::test]
    async fn test_reload_resets_sequence() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();

        // Simulate frames on the old pipeline's bus
        let old = registry.pipeline("lobby").await.unwrap();
        old.bus().put(
            bytes::Bytes::from(vec![0u8; 16 * 16 * 3]),
            crate::stream::frame::Resolution::new(16, 16),
            crate::stream::frame::FrameFormat::Bgr24,
        );
        assert_eq!(old.bus().sequence(), 1);

        registry.reload("lobby", None).await.unwrap();
        let rebuilt = registry.pipeline("lobby").await.unwrap();
        assert_eq!(rebuilt.bus().sequence(), 0);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let (registry, _dir) = registry().await;
        registry.create(spec("lobby")).await.unwrap();
        let stats = registry.stats("lobby").await.unwrap();
        assert_eq!(stats.id, "lobby");
        assert_eq!(stats.phase, Phase::Idle);
        assert_eq!(stats.preview_clients, 0);
        assert_eq!(stats.consecutive_failures, 0);
    }
}
