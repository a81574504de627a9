//! MJPEG preview publisher
//!
//! Converts a camera's frame bus into multipart JPEG parts for any number
//! of HTTP subscribers. Encoding happens once per bus sequence and the
//! bytes are shared; each subscriber gets its own paced pump task and a
//! bounded channel, so one stalled client can never slow the others down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::bus::FrameBus;
use super::frame::{Frame, FrameFormat};
use crate::error::{AppError, ErrorCode, Result};

/// Client ID type (UUID string)
pub type ClientId = String;

/// Per-client session information
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub parts_sent: u64,
    pub fps: FpsCalculator,
}

impl ClientSession {
    fn new(id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            last_activity: now,
            parts_sent: 0,
            fps: FpsCalculator::new(),
        }
    }
}

/// Rolling window FPS calculator (1-second window)
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);
        let cutoff = now - self.window;
        while let Some(&oldest) = self.frame_times.front() {
            if oldest < cutoff {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

struct CachedJpeg {
    sequence: u64,
    content_hash: u64,
    bytes: Bytes,
}

/// Settings snapshot for one publisher
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub heartbeat_interval: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            target_fps: 15,
            jpeg_quality: 80,
            heartbeat_interval: Duration::from_millis(1_500),
        }
    }
}

/// An open preview subscription: framed JPEG parts ready to write into a
/// multipart body. Dropping the receiver cancels the pump.
#[derive(Debug)]
pub struct PreviewSubscription {
    pub client_id: ClientId,
    pub rx: mpsc::Receiver<Bytes>,
}

/// MJPEG broadcaster for one camera
pub struct PreviewPublisher {
    camera_id: String,
    bus: Arc<FrameBus>,
    settings: PublisherSettings,
    /// show/hide flag; false rejects new subscriptions
    enabled: AtomicBool,
    /// terminal flag; set on registry remove
    closed: AtomicBool,
    encode_cache: Mutex<Option<CachedJpeg>>,
    clients: RwLock<HashMap<ClientId, ClientSession>>,
}

impl PreviewPublisher {
    pub fn new(
        camera_id: &str,
        bus: Arc<FrameBus>,
        settings: PublisherSettings,
        enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera_id: camera_id.to_string(),
            bus,
            settings,
            enabled: AtomicBool::new(enabled),
            closed: AtomicBool::new(false),
            encode_cache: Mutex::new(None),
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Toggle preview enablement (`show` / `hide`).
    ///
    /// Disabling lets existing subscribers drain: each pump sends one final
    /// part and terminates within a frame slot.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(
            camera_id = %self.camera_id,
            enabled,
            "Preview enablement changed"
        );
    }

    /// Terminal shutdown (registry remove): subscribers receive a final
    /// frame and disconnect; no new subscriptions ever again.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Highest per-client delivery rate, reported as the camera's fps_out.
    pub fn fps_out(&self) -> f64 {
        self.clients
            .read()
            .values()
            .map(|s| s.fps.current())
            .max()
            .unwrap_or(0) as f64
    }

    /// Latest frame as JPEG, for the snapshot endpoint.
    pub fn snapshot_jpeg(&self) -> Option<Bytes> {
        let frame = self.bus.latest()?;
        self.jpeg_for(&frame).ok()
    }

    /// Open a subscription and start its pump task.
    ///
    /// Fails with `PREVIEW_DISABLED` while hidden or closed. The returned
    /// channel yields fully framed multipart parts; the HTTP handler owns
    /// status and headers.
    pub fn subscribe(self: &Arc<Self>) -> Result<PreviewSubscription> {
        if !self.is_enabled() {
            return Err(AppError::camera(
                ErrorCode::PreviewDisabled,
                format!("preview disabled for camera {}", self.camera_id),
            ));
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        self.register_client(client_id.clone());

        // Capacity 1 is the backpressure contract: a client that does not
        // drain within a slot gets frames skipped, never queued.
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let publisher = self.clone();
        let pump_id = client_id.clone();
        tokio::spawn(async move {
            publisher.pump(pump_id.clone(), tx).await;
            publisher.unregister_client(&pump_id);
        });

        Ok(PreviewSubscription { client_id, rx })
    }

    /// Paced delivery loop for one subscriber.
    async fn pump(self: &Arc<Self>, client_id: ClientId, tx: mpsc::Sender<Bytes>) {
        let slot = Duration::from_secs_f64(1.0 / self.settings.target_fps.max(1) as f64);
        let mut next_slot = tokio::time::Instant::now();
        let mut last_sent_seq: Option<u64> = None;
        let mut last_emit: Option<Instant> = None;

        loop {
            tokio::time::sleep_until(next_slot).await;
            // Monotonic slot schedule; no drift over long runs. If the
            // writer held us past a full slot, realign instead of bursting.
            next_slot += slot;
            let now = tokio::time::Instant::now();
            if next_slot + slot < now {
                next_slot = now + slot;
            }

            if self.closed.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
                // Final part, then disconnect
                if let Some(bytes) = self.latest_or_placeholder() {
                    let _ = tx.send_timeout(create_mjpeg_part(&bytes), slot).await;
                }
                return;
            }

            let payload = self.next_payload(&mut last_sent_seq, &mut last_emit, slot);
            let Some(bytes) = payload else { continue };

            match tx.send_timeout(create_mjpeg_part(&bytes), slot).await {
                Ok(()) => {
                    last_emit = Some(Instant::now());
                    self.record_part_sent(&client_id);
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    // Slow client: skip, the next slot re-evaluates freshness
                    continue;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => return,
            }
        }
    }

    /// Decide what (if anything) to emit at this slot.
    fn next_payload(
        &self,
        last_sent_seq: &mut Option<u64>,
        last_emit: &mut Option<Instant>,
        slot: Duration,
    ) -> Option<Bytes> {
        let heartbeat_due = last_emit
            .map(|at| at.elapsed() >= self.settings.heartbeat_interval)
            .unwrap_or(true);

        match self.bus.latest() {
            // Fresh frame (sequence change also covers reset after reload)
            Some(frame) if *last_sent_seq != Some(frame.sequence) => {
                match self.jpeg_for(&frame) {
                    Ok(bytes) => {
                        *last_sent_seq = Some(frame.sequence);
                        Some(bytes)
                    }
                    Err(e) => {
                        tracing::warn!(
                            camera_id = %self.camera_id,
                            error = %e,
                            "JPEG encode failed"
                        );
                        None
                    }
                }
            }
            // No fresh frame: re-send the cached JPEG while it is recent,
            // then fall back to heartbeat cadence to keep the socket open.
            Some(frame) => {
                let stale = frame.age() > self.settings.heartbeat_interval + slot;
                if !stale || heartbeat_due {
                    self.jpeg_for(&frame).ok()
                } else {
                    None
                }
            }
            // Nothing ever published: heartbeat placeholder only
            None => heartbeat_due.then(|| heartbeat_placeholder().clone()),
        }
    }

    fn latest_or_placeholder(&self) -> Option<Bytes> {
        match self.bus.latest() {
            Some(frame) => self.jpeg_for(&frame).ok(),
            None => Some(heartbeat_placeholder().clone()),
        }
    }

    /// JPEG bytes for `frame`, encoded at most once per sequence.
    ///
    /// Identical payloads (by content hash) reuse the previous encoding even
    /// across sequence numbers, so a frozen scene costs nothing.
    fn jpeg_for(&self, frame: &Frame) -> Result<Bytes> {
        let mut cache = self.encode_cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.sequence == frame.sequence {
                return Ok(cached.bytes.clone());
            }
            if cached.content_hash == frame.content_hash() {
                let bytes = cached.bytes.clone();
                *cache = Some(CachedJpeg {
                    sequence: frame.sequence,
                    content_hash: frame.content_hash(),
                    bytes: bytes.clone(),
                });
                return Ok(bytes);
            }
        }

        let bytes = match frame.format {
            FrameFormat::Jpeg => frame.data_bytes(),
            FrameFormat::Bgr24 => encode_bgr_jpeg(
                frame.data(),
                frame.width(),
                frame.height(),
                self.settings.jpeg_quality,
            )?,
        };
        *cache = Some(CachedJpeg {
            sequence: frame.sequence,
            content_hash: frame.content_hash(),
            bytes: bytes.clone(),
        });
        Ok(bytes)
    }

    fn register_client(&self, client_id: ClientId) {
        let mut clients = self.clients.write();
        clients.insert(client_id.clone(), ClientSession::new(client_id.clone()));
        tracing::info!(
            camera_id = %self.camera_id,
            client_id = %client_id,
            total = clients.len(),
            "Preview client connected"
        );
    }

    fn unregister_client(&self, client_id: &str) {
        let removed = self.clients.write().remove(client_id);
        if let Some(session) = removed {
            let secs = session.connected_at.elapsed().as_secs_f32();
            tracing::info!(
                camera_id = %self.camera_id,
                client_id = %client_id,
                parts = session.parts_sent,
                connected_secs = format!("{secs:.1}"),
                "Preview client disconnected"
            );
        }
    }

    fn record_part_sent(&self, client_id: &str) {
        if let Some(session) = self.clients.write().get_mut(client_id) {
            session.last_activity = Instant::now();
            session.parts_sent += 1;
            session.fps.record();
        }
    }
}

/// Create one multipart MJPEG part
pub fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());
    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a packed BGR24 buffer as JPEG.
pub fn encode_bgr_jpeg(data: &[u8], width: u32, height: u32, quality: u8) -> Result<Bytes> {
    let expected = width as usize * height as usize * 3;
    if data.len() != expected {
        return Err(AppError::Internal(format!(
            "frame size {} does not match {width}x{height}x3",
            data.len()
        )));
    }

    // image 0.24 dropped BGR input; swap into an RGB scratch buffer
    let mut rgb = vec![0u8; expected];
    for (src, dst) in data.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }

    let mut out = Vec::with_capacity(expected / 8);
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(&rgb, width, height, image::ColorType::Rgb8)
        .map_err(|e| AppError::Internal(format!("jpeg encode: {e}")))?;
    Ok(Bytes::from(out))
}

/// Keep-alive JPEG used when a camera has never produced a frame.
fn heartbeat_placeholder() -> &'static Bytes {
    static PLACEHOLDER: OnceLock<Bytes> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        encode_bgr_jpeg(&[16, 16, 16], 1, 1, 80).expect("1x1 placeholder encodes")
    })
}
