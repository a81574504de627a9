//! GStreamer capture backend (fallback)
//!
//! Assembles a `gst-launch-1.0` pipeline decoding to raw BGR on stdout.
//! Used when ffmpeg is unavailable or a profile carries a full pipeline
//! template (with `{url}` substitution) tuned for specific hardware.

use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::ffmpeg::classify_decoder_stderr;
use super::stderr::{spawn_drain, StderrRing};
use crate::camera::spec::ResolvedCameraSpec;
use crate::error::{AppError, ErrorCode, Result};
use crate::stream::frame::{FrameFormat, Resolution};
use crate::utils::url::mask_credentials;

const KILL_GRACE: Duration = Duration::from_secs(2);

/// Build the gst-launch argv for a resolved spec.
pub fn build_pipeline(spec: &ResolvedCameraSpec, transport: &str) -> Vec<String> {
    if let Some(template) = &spec.gst_pipeline {
        return template
            .replace("{url}", &spec.uri)
            .split_whitespace()
            .map(String::from)
            .collect();
    }
    format!(
        "rtspsrc location={} protocols={} latency=0 \
         ! decodebin ! videoconvert ! video/x-raw,format=BGR ! fdsink fd=1",
        spec.uri, transport
    )
    .split_whitespace()
    .map(String::from)
    .collect()
}

/// A running gst-launch decoder for one camera
#[derive(Debug)]
pub struct GstSource {
    child: Child,
    stdout: ChildStdout,
    stderr_ring: StderrRing,
    stderr_task: JoinHandle<()>,
    command: String,
    resolution: Resolution,
    frame_buf: Vec<u8>,
    started_at: Instant,
    pub frames_total: u64,
    pub partial_reads: u64,
    pub first_frame_ms: Option<u64>,
}

impl GstSource {
    /// Spawn the pipeline. Raw output always requires known dimensions.
    pub fn spawn(
        spec: &ResolvedCameraSpec,
        transport: &str,
        dims: Option<Resolution>,
    ) -> Result<Self> {
        let resolution = dims.unwrap_or(Resolution::new(0, 0));
        if !resolution.is_valid() {
            return Err(AppError::camera(
                ErrorCode::NoVideoStream,
                format!("camera {}: stream dimensions unknown", spec.id),
            ));
        }

        let args = build_pipeline(spec, transport);
        let command = mask_credentials(&format!("gst-launch-1.0 {}", args.join(" ")));
        tracing::debug!(camera_id = %spec.id, cmd = %command, "Spawning gstreamer pipeline");

        let mut child = Command::new("gst-launch-1.0")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AppError::camera(ErrorCode::DecoderMissing, "gst-launch-1.0 not found in PATH")
                } else {
                    AppError::camera(ErrorCode::ConnectFailed, format!("gst-launch spawn: {e}"))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("pipeline stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Internal("pipeline stderr not captured".into()))?;

        let stderr_ring = StderrRing::new();
        let stderr_task = spawn_drain(stderr, stderr_ring.clone());

        let expected = FrameFormat::Bgr24
            .frame_size(resolution)
            .expect("raw format has fixed size");

        Ok(Self {
            child,
            stdout,
            stderr_ring,
            stderr_task,
            command,
            resolution,
            frame_buf: vec![0u8; expected],
            started_at: Instant::now(),
            frames_total: 0,
            partial_reads: 0,
            first_frame_ms: None,
        })
    }

    /// Read the next raw BGR frame, waiting up to `timeout`.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes> {
        let expected = self.frame_buf.len();
        let read = async {
            let mut filled = 0usize;
            while filled < expected {
                match self.stdout.read(&mut self.frame_buf[filled..]).await {
                    Ok(0) => return Err(filled),
                    Ok(n) => filled += n,
                    Err(_) => return Err(filled),
                }
            }
            Ok(())
        };

        let result = tokio::time::timeout(timeout, read).await;
        match result {
            Ok(Ok(())) => {
                self.frames_total += 1;
                if self.first_frame_ms.is_none() {
                    self.first_frame_ms = Some(self.started_at.elapsed().as_millis() as u64);
                }
                Ok(Bytes::copy_from_slice(&self.frame_buf))
            }
            Ok(Err(filled)) => {
                if filled > 0 {
                    self.partial_reads += 1;
                }
                Err(self.classified_error(ErrorCode::ConnectFailed))
            }
            Err(_) => Err(self.classified_error(ErrorCode::ReadTimeout)),
        }
    }

    fn classified_error(&self, fallback: ErrorCode) -> AppError {
        let tail = self.stderr_ring.tail();
        let code = classify_decoder_stderr(&tail).unwrap_or(fallback);
        let message = if tail.is_empty() {
            "pipeline produced no diagnostics".to_string()
        } else {
            tail
        };
        AppError::Camera { code, message }
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_ring.tail()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
    }

    pub async fn shutdown(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(KILL_GRACE, self.child.wait())
                .await
                .is_ok()
            {
                self.stderr_task.abort();
                return;
            }
        }
        let _ = self.child.kill().await;
        self.stderr_task.abort();
    }
}
