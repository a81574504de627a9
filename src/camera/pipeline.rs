//! Per-camera pipeline
//!
//! Owns the frame bus, the preview publisher and the reconnect controller
//! for one camera, and runs the supervisor task that keeps a decoder
//! attached: backend selection, transport auto-retry, readiness tracking,
//! failure classification and backoff-paced reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::capture::{CaptureSource, StreamProber};
use crate::camera::reconnect::{AttemptDecision, Phase, ReconnectController};
use crate::camera::spec::{BackendKind, ResolvedCameraSpec, SourceMode, Transport};
use crate::config::ConfigStore;
use crate::error::{AppError, ErrorCode, Result};
use crate::status::{DebugRecord, StatusStore};
use crate::stream::bus::FrameBus;
use crate::stream::mjpeg::{PreviewPublisher, PublisherSettings};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Supervisor poll granularity while waiting out backoff or the breaker;
/// bounds shutdown latency well under the 1 s target.
const WAIT_TICK: Duration = Duration::from_millis(250);

/// A live camera pipeline: bus + publisher + reconnect supervisor
pub struct CameraPipeline {
    spec: ArcSwap<ResolvedCameraSpec>,
    bus: Arc<FrameBus>,
    publisher: Arc<PreviewPublisher>,
    controller: Arc<ReconnectController>,
    status: Arc<StatusStore>,
    config: ConfigStore,
    prober: Arc<StreamProber>,
    stop: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes lifecycle transitions for this camera
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    throttler: LogThrottler,
    // Accumulated capture metrics across decoder restarts
    frames_total: AtomicU64,
    partial_reads: AtomicU64,
    restarts: AtomicU64,
    first_frame_ms: Mutex<Option<u64>>,
}

impl CameraPipeline {
    pub fn new(
        spec: ResolvedCameraSpec,
        config: ConfigStore,
        status: Arc<StatusStore>,
        prober: Arc<StreamProber>,
    ) -> Arc<Self> {
        let settings = config.get();
        let bus = Arc::new(FrameBus::new(settings.stream.queue_max));
        let publisher = PreviewPublisher::new(
            &spec.id,
            bus.clone(),
            PublisherSettings {
                target_fps: settings.stream.target_fps,
                jpeg_quality: settings.stream.jpeg_quality,
                heartbeat_interval: Duration::from_millis(settings.stream.heartbeat_interval_ms),
            },
            spec.show,
        );
        let controller = Arc::new(ReconnectController::new(
            &spec.id,
            settings.reconnect.clone(),
            status.clone(),
        ));

        Arc::new(Self {
            spec: ArcSwap::from_pointee(spec),
            bus,
            publisher,
            controller,
            status,
            config,
            prober,
            stop: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            throttler: LogThrottler::default(),
            frames_total: AtomicU64::new(0),
            partial_reads: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            first_frame_ms: Mutex::new(None),
        })
    }

    pub fn id(&self) -> String {
        self.spec.load().id.clone()
    }

    pub fn spec(&self) -> Arc<ResolvedCameraSpec> {
        self.spec.load_full()
    }

    pub fn bus(&self) -> &Arc<FrameBus> {
        &self.bus
    }

    pub fn publisher(&self) -> &Arc<PreviewPublisher> {
        &self.publisher
    }

    pub fn controller(&self) -> &Arc<ReconnectController> {
        &self.controller
    }

    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    pub fn metrics(&self) -> crate::capture::CaptureMetrics {
        crate::capture::CaptureMetrics {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            partial_reads: self.partial_reads.load(Ordering::Relaxed),
            first_frame_ms: *self.first_frame_ms.lock(),
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Start the capture supervisor. Idempotent: a no-op while the phase is
    /// CONNECTING, READY or STALLED. Refused while the breaker is open.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        match self.phase() {
            Phase::Connecting | Phase::Ready | Phase::Stalled => return Ok(()),
            Phase::OpenBreaker => {
                if self.controller.check_attempt() == AttemptDecision::Refused {
                    return Err(AppError::camera(
                        ErrorCode::BreakerOpen,
                        format!("camera {}: circuit breaker open", self.id()),
                    ));
                }
            }
            Phase::Stopped => self.controller.reset(),
            Phase::Idle | Phase::Cooldown => {}
        }

        self.stop.store(false, Ordering::SeqCst);
        let mut guard = self.supervisor.lock();
        let stale = guard.as_ref().map(|h| h.is_finished()).unwrap_or(true);
        if stale {
            let pipeline = self.clone();
            *guard = Some(tokio::spawn(async move { pipeline.supervise().await }));
        }
        Ok(())
    }

    /// Tear down the capture side. The publisher stays up and serves
    /// heartbeats; `get_latest` on the bus just times out.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.controller.mark_stopped();
        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            // Reader honors the stop flag within a read timeout; 1 s is the
            // shutdown budget, abort past it.
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(camera_id = %self.id(), "Supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Terminal teardown (registry remove): stop capture and close the
    /// publisher so subscribers receive a final frame and disconnect.
    pub async fn shutdown(&self) {
        self.publisher.close();
        self.stop().await;
        self.status.clear_camera(&self.id());
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Reconnect-paced capture loop.
    async fn supervise(self: Arc<Self>) {
        let camera_id = self.id();
        tracing::debug!(camera_id = %camera_id, "Supervisor started");
        loop {
            if self.stopping() {
                break;
            }
            match self.controller.check_attempt() {
                AttemptDecision::Proceed => {}
                AttemptDecision::Wait(remaining) => {
                    tokio::time::sleep(remaining.min(WAIT_TICK)).await;
                    continue;
                }
                AttemptDecision::Refused => {
                    if self.controller.phase() == Phase::Stopped {
                        break;
                    }
                    tokio::time::sleep(WAIT_TICK).await;
                    continue;
                }
            }

            self.controller.mark_connecting();
            match self.connect().await {
                Ok(source) => {
                    self.run_source(source).await;
                }
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    let code = e.code().unwrap_or(ErrorCode::ConnectFailed);
                    warn_throttled!(
                        self.throttler,
                        &format!("{camera_id}:connect"),
                        camera_id = %camera_id,
                        code = %code,
                        error = %e,
                        "Capture connect failed"
                    );
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    self.controller.record_failure(code);
                }
            }
        }
        tracing::debug!(camera_id = %camera_id, "Supervisor exited");
    }

    /// One CaptureSource lifecycle: backend priority × transport auto-retry,
    /// then readiness. Returns a READY source, publishing every frame it
    /// reads along the way.
    async fn connect(&self) -> Result<CaptureSource> {
        let spec = self.spec.load_full();
        let settings = self.config.get();
        let for_display = self.publisher.is_enabled();
        let mut last_err: Option<AppError> = None;

        for backend in &spec.backend_priority {
            if *backend == BackendKind::Local && !for_display {
                continue;
            }
            let transports: Vec<&str> = if settings.capture.force_tcp
                || spec.mode != SourceMode::Rtsp
            {
                // Transport preference only applies to RTSP
                vec!["tcp"]
            } else if spec.transport_preference == Transport::Auto {
                // tcp first, unless a sampled probe saw udp decode more frames
                match self.prober.preferred_transport(&spec.uri).as_deref() {
                    Some("udp") => vec!["udp", "tcp"],
                    _ => vec!["tcp", "udp"],
                }
            } else {
                spec.transport_preference.attempt_order().to_vec()
            };

            for transport in transports.iter().copied() {
                if self.stopping() {
                    return Err(AppError::camera(ErrorCode::ConnectFailed, "stopping"));
                }
                match self.attempt(&spec, *backend, transport).await {
                    Ok(source) => return Ok(source),
                    Err(e) => {
                        let code = e.code();
                        tracing::debug!(
                            camera_id = %spec.id,
                            backend = %backend,
                            transport,
                            code = ?code,
                            "Backend attempt failed"
                        );
                        let missing = code == Some(ErrorCode::DecoderMissing);
                        last_err = Some(e);
                        if missing {
                            // Tool not installed: no point trying transports
                            break;
                        }
                        // NO_VIDEO_STREAM (and other failures) fall through
                        // to the next transport before the backend is
                        // declared failed.
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::camera(
                ErrorCode::DecoderMissing,
                format!("camera {}: no usable capture backend", spec.id),
            )
        }))
    }

    /// Spawn one backend/transport combination and wait for readiness.
    async fn attempt(
        &self,
        spec: &ResolvedCameraSpec,
        backend: BackendKind,
        transport: &str,
    ) -> Result<CaptureSource> {
        let settings = self.config.get();

        let dims = match spec.resolution.fixed() {
            Some(res) => Some(res),
            None if spec.mode == SourceMode::Http => None,
            None => {
                self.prober
                    .dimensions(&spec.uri, transport, &settings.capture)
                    .await
            }
        };

        let mut source = CaptureSource::spawn(backend, spec, &settings.capture, transport, dims)?;

        // Readiness: ready_frames consecutive frames OR ready_duration_ms of
        // contiguous delivery, whichever first, within ready_timeout_ms.
        let deadline = Instant::now() + Duration::from_millis(spec.ready_timeout_ms.max(1));
        let read_timeout = Duration::from_millis(settings.stream.no_frame_timeout_ms);
        let mut frames_seen: u32 = 0;
        let mut first_frame_at: Option<Instant> = None;

        loop {
            if self.stopping() {
                source.shutdown().await;
                return Err(AppError::camera(ErrorCode::ConnectFailed, "stopping"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let err = AppError::camera(
                    ErrorCode::ReadTimeout,
                    format!(
                        "camera {}: not ready within {}ms",
                        spec.id, spec.ready_timeout_ms
                    ),
                );
                self.record_debug(&mut source, ErrorCode::ReadTimeout);
                source.shutdown().await;
                return Err(err);
            }

            match source.read_frame(read_timeout.min(remaining)).await {
                Ok(payload) => {
                    self.bus
                        .put(payload, source.resolution(), source.format());
                    frames_seen += 1;
                    let first = *first_frame_at.get_or_insert_with(Instant::now);

                    let by_count = frames_seen >= spec.ready_frames.max(1);
                    let by_duration = spec.ready_duration_ms > 0
                        && first.elapsed() >= Duration::from_millis(spec.ready_duration_ms);
                    if by_count || by_duration {
                        self.controller.mark_ready();
                        return Ok(source);
                    }
                }
                Err(e) => {
                    let code = e.code().unwrap_or(ErrorCode::ConnectFailed);
                    self.record_debug(&mut source, code);
                    self.absorb_metrics(&source);
                    source.shutdown().await;
                    return Err(e);
                }
            }
        }
    }

    /// Pump a READY source into the bus until it fails or we stop.
    async fn run_source(&self, mut source: CaptureSource) {
        let settings = self.config.get();
        let read_timeout = Duration::from_millis(settings.stream.no_frame_timeout_ms);
        // One frame slot: how long STALLED is held before cooldown commits
        let grace = Duration::from_secs_f64(1.0 / settings.stream.target_fps.max(1) as f64);
        let camera_id = self.id();

        loop {
            if self.stopping() {
                self.absorb_metrics(&source);
                source.shutdown().await;
                return;
            }

            match source.read_frame(read_timeout).await {
                Ok(payload) => {
                    self.bus
                        .put(payload, source.resolution(), source.format());
                    // The watchdog may have marked us STALLED while this read
                    // was blocked; a frame means the stall did not hold.
                    if self.controller.phase() == Phase::Stalled {
                        self.controller.mark_ready();
                    }
                    self.controller.note_frame();
                }
                Err(e) => {
                    let code = e.code().unwrap_or(ErrorCode::ReadTimeout);
                    // READY exits through STALLED, held for one frame slot: a
                    // hung-but-live decoder gets one grace read to recover
                    // before the stall is confirmed.
                    self.controller.mark_stalled();
                    if self.controller.phase() == Phase::Stalled && !self.stopping() {
                        if let Ok(payload) = source.read_frame(grace).await {
                            self.bus
                                .put(payload, source.resolution(), source.format());
                            self.controller.mark_ready();
                            continue;
                        }
                    }
                    warn_throttled!(
                        self.throttler,
                        &format!("{camera_id}:capture"),
                        camera_id = %camera_id,
                        code = %code,
                        "Capture failed, reconnecting"
                    );
                    self.record_debug(&mut source, code);
                    self.absorb_metrics(&source);
                    source.shutdown().await;
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    self.controller.record_failure(code);
                    return;
                }
            }
        }
    }

    fn record_debug(&self, source: &mut CaptureSource, code: ErrorCode) {
        let record = DebugRecord {
            backend: source.backend().to_string(),
            command: source.command().to_string(),
            exit_code: source.exit_code(),
            stderr_tail: source.stderr_tail(),
            error: code,
            at: Utc::now(),
        };
        self.status.set_debug(&self.id(), &record);
    }

    fn absorb_metrics(&self, source: &CaptureSource) {
        let m = source.metrics();
        self.frames_total.fetch_add(m.frames_total, Ordering::Relaxed);
        self.partial_reads
            .fetch_add(m.partial_reads, Ordering::Relaxed);
        if let Some(ms) = m.first_frame_ms {
            let mut slot = self.first_frame_ms.lock();
            if slot.is_none() {
                *slot = Some(ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::spec::{CameraSpec, Transport};
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn test_pipeline() -> Arc<CameraPipeline> {
        let dir = tempdir().unwrap();
        let config = ConfigStore::open(&dir.path().join("c.json")).await.unwrap();
        let spec = CameraSpec {
            id: "lobby".to_string(),
            mode: None,
            uri: "rtsp://u:p@10.0.0.5/stream".to_string(),
            transport_preference: Transport::Tcp,
            resolution: "1280x720".parse().unwrap(),
            ready_frames: 1,
            ready_duration_ms: 0,
            ready_timeout_ms: 15_000,
            backend_priority: vec![BackendKind::Ffmpeg],
            extra_decoder_flags: String::new(),
            profile_name: None,
            show: true,
            enabled: true,
        }
        .resolve(&HashMap::new(), &HashMap::new())
        .unwrap();

        CameraPipeline::new(
            spec,
            config,
            Arc::new(StatusStore::new()),
            Arc::new(StreamProber::new()),
        )
    }

    #[tokio::test]
    async fn test_initial_phase_idle() {
        let pipeline = test_pipeline().await;
        assert_eq!(pipeline.phase(), Phase::Idle);
        assert_eq!(pipeline.bus().sequence(), 0);
    }

    #[tokio::test]
    async fn test_stop_marks_stopped_and_is_safe_without_start() {
        let pipeline = test_pipeline().await;
        pipeline.stop().await;
        assert_eq!(pipeline.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_start_refused_while_breaker_open() {
        let pipeline = test_pipeline().await;
        for _ in 0..3 {
            pipeline.controller().record_failure(ErrorCode::ConnectFailed);
        }
        assert_eq!(pipeline.phase(), Phase::OpenBreaker);
        let err = pipeline.start().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BreakerOpen));
    }

    #[tokio::test]
    async fn test_start_idempotent_when_active() {
        let pipeline = test_pipeline().await;
        pipeline.controller().mark_connecting();
        // Phase CONNECTING: start is a no-op and must not spawn a supervisor
        pipeline.start().unwrap();
        assert!(pipeline.supervisor.lock().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_publisher() {
        let pipeline = test_pipeline().await;
        pipeline.shutdown().await;
        assert!(pipeline.publisher().subscribe().is_err());
    }
}
