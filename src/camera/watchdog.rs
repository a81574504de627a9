//! Stall watchdog
//!
//! Periodic sweep over all pipelines: a READY camera whose bus has gone
//! quiet for `no_frame_timeout_ms` is marked STALLED. The camera's own
//! reader then resolves the stall: a frame arriving within one frame slot
//! rolls it back to READY, otherwise the stall is confirmed and the
//! supervisor goes through the cooldown path. The same sweep refreshes
//! each camera's `cam:<id>:state` record so external observers see live
//! fps numbers without polling the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::camera::reconnect::Phase;
use crate::camera::registry::CameraRegistry;
use crate::status::CamState;

/// Sweep cadence; a fraction of the default no-frame timeout so stalls are
/// noticed promptly without busy-polling.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Spawn the watchdog task. Exits when the shutdown channel fires.
pub fn spawn(
    registry: Arc<CameraRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!("Watchdog started");
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(&registry).await,
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Watchdog stopped");
    })
}

async fn sweep(registry: &Arc<CameraRegistry>) {
    let no_frame_timeout =
        Duration::from_millis(registry.config_snapshot().stream.no_frame_timeout_ms);

    for pipeline in registry.pipelines().await {
        let snap = pipeline.controller().snapshot();

        if snap.phase == Phase::Ready {
            let stalled = pipeline
                .bus()
                .last_frame_age()
                .map(|age| age > no_frame_timeout)
                .unwrap_or(false);
            if stalled {
                pipeline.controller().mark_stalled();
            }
        }

        let info = pipeline.bus().info();
        registry.status_store().set_state(
            &pipeline.id(),
            &CamState {
                fps_in: info.fps,
                fps_out: pipeline.publisher().fps_out(),
                last_error: snap.last_error,
                width: info.width,
                height: info.height,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::spec::{BackendKind, CameraSpec, Transport};
    use crate::config::ConfigStore;
    use crate::status::StatusStore;
    use tempfile::tempdir;

    async fn registry_with_camera() -> (Arc<CameraRegistry>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = ConfigStore::open(&dir.path().join("c.json")).await.unwrap();
        let registry = CameraRegistry::new(config, Arc::new(StatusStore::new()));
        registry
            .create(CameraSpec {
                id: "lobby".to_string(),
                mode: None,
                uri: "rtsp://u:p@10.0.0.5/stream".to_string(),
                transport_preference: Transport::Tcp,
                resolution: "16x16".parse().unwrap(),
                ready_frames: 1,
                ready_duration_ms: 0,
                ready_timeout_ms: 15_000,
                backend_priority: vec![BackendKind::Ffmpeg],
                extra_decoder_flags: String::new(),
                profile_name: None,
                show: false,
                enabled: false,
            })
            .await
            .unwrap();
        (registry, dir)
    }

    #[tokio::test]
    async fn test_sweep_marks_ready_camera_stalled() {
        let (registry, _dir) = registry_with_camera().await;
        let pipeline = registry.pipelines().await.pop().unwrap();

        // Force READY with one old frame on the bus
        pipeline.bus().put(
            bytes::Bytes::from(vec![0u8; 16 * 16 * 3]),
            crate::stream::frame::Resolution::new(16, 16),
            crate::stream::frame::FrameFormat::Bgr24,
        );
        pipeline.controller().mark_connecting();
        pipeline.controller().mark_ready();

        // Fresh frame: no stall
        sweep(&registry).await;
        assert_eq!(pipeline.phase(), Phase::Ready);

        // Age the frame past the timeout by waiting is too slow; shrink the
        // timeout instead
        registry
            .config_store()
            .update(|c| c.stream.no_frame_timeout_ms = 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        sweep(&registry).await;
        assert_eq!(pipeline.phase(), Phase::Stalled);
    }

    #[tokio::test]
    async fn test_sweep_refreshes_state_records() {
        let (registry, _dir) = registry_with_camera().await;
        sweep(&registry).await;
        let state = registry.status_store().get("cam:lobby:state").unwrap();
        assert_eq!(state["fps_out"], 0.0);
    }

    #[tokio::test]
    async fn test_watchdog_exits_on_shutdown() {
        let (registry, _dir) = registry_with_camera().await;
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn(registry, rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watchdog exits promptly")
            .unwrap();
    }
}
