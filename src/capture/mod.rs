//! Decoder process attachments
//!
//! A [`CaptureSource`] is one running external decoder feeding one camera's
//! frame bus. The variants share a capability set — spawn, read the next
//! frame, inspect stderr, shut down — and the pipeline drives whichever
//! backend the spec's priority list selected.

pub mod ffmpeg;
pub mod gstreamer;
pub mod probe;
pub mod stderr;

use std::time::Duration;

use bytes::Bytes;

use crate::camera::spec::{BackendKind, ResolvedCameraSpec, SourceMode};
use crate::config::schema::CaptureSettings;
use crate::error::{AppError, ErrorCode, Result};
use crate::stream::frame::{FrameFormat, Resolution};

pub use ffmpeg::FfmpegSource;
pub use gstreamer::GstSource;
pub use probe::{ProbeReport, StreamProber};

/// Per-source counters surfaced through `stats()`
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CaptureMetrics {
    pub frames_total: u64,
    pub partial_reads: u64,
    pub first_frame_ms: Option<u64>,
}

/// A running decoder process for one camera
///
/// The `Local` variant drives the same ffmpeg process shape with a platform
/// capture input, so the bus contract stays uniform across backends.
#[derive(Debug)]
pub enum CaptureSource {
    Ffmpeg(FfmpegSource),
    Gstreamer(GstSource),
    Local(FfmpegSource),
}

impl CaptureSource {
    /// Spawn one backend attempt for `spec` over `transport`.
    pub fn spawn(
        backend: BackendKind,
        spec: &ResolvedCameraSpec,
        settings: &CaptureSettings,
        transport: &str,
        dims: Option<Resolution>,
    ) -> Result<Self> {
        match backend {
            BackendKind::Ffmpeg => {
                FfmpegSource::spawn(spec, settings, transport, dims).map(CaptureSource::Ffmpeg)
            }
            BackendKind::Gstreamer => {
                if spec.mode != SourceMode::Rtsp && spec.gst_pipeline.is_none() {
                    return Err(AppError::camera(
                        ErrorCode::DecoderMissing,
                        format!("gstreamer backend does not handle {} sources", spec.mode),
                    ));
                }
                GstSource::spawn(spec, transport, dims).map(CaptureSource::Gstreamer)
            }
            BackendKind::Local => {
                if spec.mode != SourceMode::Local {
                    return Err(AppError::camera(
                        ErrorCode::DecoderMissing,
                        format!("local backend cannot open {} sources", spec.mode),
                    ));
                }
                FfmpegSource::spawn(spec, settings, transport, dims).map(CaptureSource::Local)
            }
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            CaptureSource::Ffmpeg(_) => BackendKind::Ffmpeg,
            CaptureSource::Gstreamer(_) => BackendKind::Gstreamer,
            CaptureSource::Local(_) => BackendKind::Local,
        }
    }

    /// Read the next complete frame, waiting up to `timeout`.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes> {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.read_frame(timeout).await,
            CaptureSource::Gstreamer(s) => s.read_frame(timeout).await,
        }
    }

    /// Payload format this source publishes.
    pub fn format(&self) -> FrameFormat {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.format(),
            CaptureSource::Gstreamer(_) => FrameFormat::Bgr24,
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.resolution(),
            CaptureSource::Gstreamer(s) => s.resolution(),
        }
    }

    /// Masked command line, for debug records.
    pub fn command(&self) -> &str {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.command(),
            CaptureSource::Gstreamer(s) => s.command(),
        }
    }

    /// Most recent stderr lines (masked).
    pub fn stderr_tail(&self) -> String {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.stderr_tail(),
            CaptureSource::Gstreamer(s) => s.stderr_tail(),
        }
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.exit_code(),
            CaptureSource::Gstreamer(s) => s.exit_code(),
        }
    }

    pub fn metrics(&self) -> CaptureMetrics {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => CaptureMetrics {
                frames_total: s.frames_total,
                partial_reads: s.partial_reads,
                first_frame_ms: s.first_frame_ms,
            },
            CaptureSource::Gstreamer(s) => CaptureMetrics {
                frames_total: s.frames_total,
                partial_reads: s.partial_reads,
                first_frame_ms: s.first_frame_ms,
            },
        }
    }

    /// Graceful terminate, then unconditional kill after 2 s.
    pub async fn shutdown(self) {
        match self {
            CaptureSource::Ffmpeg(s) | CaptureSource::Local(s) => s.shutdown().await,
            CaptureSource::Gstreamer(s) => s.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::spec::Transport;

    fn local_spec() -> ResolvedCameraSpec {
        ResolvedCameraSpec {
            id: "door".to_string(),
            mode: SourceMode::Local,
            uri: "/dev/video0".to_string(),
            transport_preference: Transport::Auto,
            resolution: "640x480".parse().unwrap(),
            ready_frames: 1,
            ready_duration_ms: 0,
            ready_timeout_ms: 15_000,
            backend_priority: vec![BackendKind::Local],
            extra_decoder_flags: String::new(),
            gst_pipeline: None,
            show: false,
            enabled: true,
        }
    }

    #[test]
    fn test_local_backend_rejects_network_sources() {
        let mut spec = local_spec();
        spec.mode = SourceMode::Rtsp;
        spec.uri = "rtsp://cam/s".to_string();
        let err = CaptureSource::spawn(
            BackendKind::Local,
            &spec,
            &CaptureSettings::default(),
            "tcp",
            Some(Resolution::new(640, 480)),
        )
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DecoderMissing));
    }

    #[test]
    fn test_gstreamer_rejects_non_rtsp_without_template() {
        let spec = local_spec();
        let err = CaptureSource::spawn(
            BackendKind::Gstreamer,
            &spec,
            &CaptureSettings::default(),
            "tcp",
            Some(Resolution::new(640, 480)),
        )
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DecoderMissing));
    }
}
