//! Per-camera frame ring buffer
//!
//! One producer (the capture task) and many consumers (preview publisher,
//! analytics pollers) meet here. The bus keeps only the most recent frames
//! to bound latency and memory: `put` never blocks and overwrites the
//! oldest slot, consumers track the last sequence they saw and always jump
//! to the newest frame beyond it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::frame::{Frame, FrameFormat, Resolution};

/// Default ring capacity; the `QUEUE_MAX` setting can raise it.
pub const DEFAULT_CAPACITY: usize = 3;

/// EWMA window for the observed input frame rate.
const FPS_WINDOW: Duration = Duration::from_secs(2);

/// Latest metadata snapshot of a bus
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BusInfo {
    pub width: u32,
    pub height: u32,
    /// Observed input FPS (EWMA over a 2 second window)
    pub fps: f64,
    /// Last published sequence number (0 when nothing was published yet)
    pub sequence: u64,
}

struct BusInner {
    ring: VecDeque<Frame>,
    seq: u64,
    info: BusInfo,
    last_put: Option<Instant>,
}

/// Thread-safe ring of the most recent decoded frames for one camera
pub struct FrameBus {
    inner: Mutex<BusInner>,
    notify: broadcast::Sender<()>,
    capacity: usize,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(BusInner {
                ring: VecDeque::with_capacity(capacity.max(1)),
                seq: 0,
                info: BusInfo::default(),
                last_put: None,
            }),
            notify,
            capacity: capacity.max(1),
        }
    }

    /// Publish a frame, dropping the oldest slot when full.
    ///
    /// Never blocks beyond the lock hold time; assigns and returns the
    /// frame's sequence number. All waiters are woken.
    pub fn put(&self, payload: Bytes, resolution: Resolution, format: FrameFormat) -> u64 {
        let seq = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            if inner.ring.len() == self.capacity {
                inner.ring.pop_front();
            }
            inner
                .ring
                .push_back(Frame::new(payload, resolution, format, seq));

            let now = Instant::now();
            if let Some(prev) = inner.last_put {
                let dt = now.duration_since(prev).as_secs_f64();
                if dt > 0.0 {
                    let inst = 1.0 / dt;
                    // alpha derived from dt so the mean settles over FPS_WINDOW
                    let alpha = 1.0 - (-dt / FPS_WINDOW.as_secs_f64()).exp();
                    inner.info.fps += alpha * (inst - inner.info.fps);
                }
            }
            inner.last_put = Some(now);
            inner.info.width = resolution.width;
            inner.info.height = resolution.height;
            inner.info.sequence = seq;
            seq
        };
        // Send outside the lock; no receivers is normal.
        let _ = self.notify.send(());
        seq
    }

    /// Return the newest frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.inner.lock().ring.back().cloned()
    }

    /// Return the newest frame with `sequence > last_seen`, waiting up to
    /// `timeout` for one to arrive.
    ///
    /// A consumer that always passes back its last sequence sees a strictly
    /// increasing subsequence of published frames; it may miss intermediate
    /// frames but never observes one out of order.
    pub async fn get_latest(&self, last_seen: u64, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first check so a put between check and wait
        // cannot be missed.
        let mut rx = self.notify.subscribe();
        loop {
            if let Some(frame) = self.newer_than(last_seen) {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(())) => continue,
                // Lagged just means several puts happened; re-check.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return self.newer_than(last_seen),
                Err(_) => return None,
            }
        }
    }

    fn newer_than(&self, last_seen: u64) -> Option<Frame> {
        let inner = self.inner.lock();
        inner
            .ring
            .back()
            .filter(|f| f.sequence > last_seen)
            .cloned()
    }

    /// Latest metadata snapshot.
    pub fn info(&self) -> BusInfo {
        self.inner.lock().info
    }

    /// Last published sequence number.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Age of the newest frame, if any.
    pub fn last_frame_age(&self) -> Option<Duration> {
        self.inner.lock().last_put.map(|t| t.elapsed())
    }

    /// Subscribe to publication wakeups.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    const RES: Resolution = Resolution {
        width: 16,
        height: 16,
    };

    #[tokio::test]
    async fn test_put_assigns_monotonic_sequences() {
        let bus = FrameBus::new(3);
        let s1 = bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let s2 = bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let s3 = bus.put(bgr(768), RES, FrameFormat::Bgr24);
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(bus.sequence(), s3);
    }

    #[tokio::test]
    async fn test_ring_overwrites_oldest() {
        let bus = FrameBus::new(3);
        for _ in 0..10 {
            bus.put(bgr(768), RES, FrameFormat::Bgr24);
        }
        // Capacity bounds live frames regardless of put count
        assert_eq!(bus.inner.lock().ring.len(), 3);
        assert_eq!(bus.latest().unwrap().sequence, 10);
    }

    #[tokio::test]
    async fn test_get_latest_returns_immediately_when_newer_exists() {
        let bus = FrameBus::new(3);
        bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let frame = bus.get_latest(0, Duration::from_millis(10)).await;
        assert_eq!(frame.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_get_latest_times_out_without_new_frames() {
        let bus = FrameBus::new(3);
        bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let frame = bus.get_latest(1, Duration::from_millis(50)).await;
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_get_latest_wakes_on_put() {
        let bus = std::sync::Arc::new(FrameBus::new(3));
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.get_latest(0, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let frame = waiter.await.unwrap();
        assert_eq!(frame.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_consumer_sees_strictly_increasing_subsequence() {
        let bus = std::sync::Arc::new(FrameBus::new(3));
        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    bus.put(bgr(768), RES, FrameFormat::Bgr24);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
            })
        };

        let mut last_seen = 0u64;
        let mut observed = Vec::new();
        while let Some(frame) = bus.get_latest(last_seen, Duration::from_millis(100)).await {
            assert!(frame.sequence > last_seen, "sequence went backwards");
            last_seen = frame.sequence;
            observed.push(frame.sequence);
            if last_seen >= 200 {
                break;
            }
        }
        producer.await.unwrap();
        assert!(observed.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_info_tracks_dimensions() {
        let bus = FrameBus::new(3);
        bus.put(bgr(768), RES, FrameFormat::Bgr24);
        let info = bus.info();
        assert_eq!(info.width, 16);
        assert_eq!(info.height, 16);
        assert_eq!(info.sequence, 1);
    }
}
