//! FFmpeg capture backend
//!
//! Spawns an `ffmpeg` process decoding one stream to stdout and converts
//! its output into frames: fixed-size raw BGR24 reads for network/local
//! video, JPEG boundary scanning for HTTP MJPEG sources. The process is
//! the unit of failure; any read problem tears it down and reports a
//! classified error to the reconnect controller.

use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::stderr::{spawn_drain, StderrRing};
use crate::camera::spec::{ResolvedCameraSpec, SourceMode};
use crate::config::schema::CaptureSettings;
use crate::error::{AppError, ErrorCode, Result};
use crate::stream::frame::{FrameFormat, Resolution};
use crate::utils::url::mask_credentials;

/// How long a decoder gets to exit after the graceful terminate signal
/// before the unconditional kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for the MJPEG scan buffer; a stream that never closes a JPEG
/// within this many bytes is not a JPEG stream.
const MAX_JPEG_SCAN: usize = 8 * 1024 * 1024;

/// Map decoder stderr to a taxonomy code, if it matches a known failure.
pub fn classify_decoder_stderr(stderr: &str) -> Option<ErrorCode> {
    let s = stderr.to_ascii_lowercase();
    if s.contains("invalid data found when processing input") {
        Some(ErrorCode::InvalidStream)
    } else if s.contains("401") || s.contains("unauthor") || s.contains("403") {
        Some(ErrorCode::AuthFailed)
    } else if s.contains("404") || s.contains("not found") {
        Some(ErrorCode::InvalidPath)
    } else if s.contains("connection refused")
        || s.contains("no route to host")
        || s.contains("network is unreachable")
    {
        Some(ErrorCode::NetworkUnreachable)
    } else if s.contains("operation not permitted") {
        Some(ErrorCode::ConnectFailed)
    } else if s.contains("timed out") {
        Some(ErrorCode::ReadTimeout)
    } else {
        None
    }
}

/// Build the ffmpeg argv for a resolved spec.
///
/// `dims` is the probed (or fixed) output resolution; it selects the `-s`
/// rescale and sizes raw reads. Exposed for tests: argv construction is the
/// part of this backend worth pinning down without a live stream.
pub fn build_args(
    spec: &ResolvedCameraSpec,
    settings: &CaptureSettings,
    transport: &str,
    dims: Option<Resolution>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
        "-hide_banner".into(),
    ];

    match spec.mode {
        SourceMode::Rtsp => {
            args.extend(["-rtsp_transport".into(), transport.into()]);
            args.extend([
                "-fflags".into(),
                "nobuffer".into(),
                "-flags".into(),
                "low_delay".into(),
                "-analyzeduration".into(),
                "0".into(),
                "-probesize".into(),
                "32".into(),
                "-stimeout".into(),
                settings.rtsp_stimeout_usec.to_string(),
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                settings.ffmpeg_reconnect_delay_secs.to_string(),
            ]);
        }
        SourceMode::Http => {
            args.extend([
                "-fflags".into(),
                "nobuffer".into(),
                "-flags".into(),
                "low_delay".into(),
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                settings.ffmpeg_reconnect_delay_secs.to_string(),
            ]);
        }
        SourceMode::Local => {
            args.extend(local_input_format());
        }
    }

    args.push("-an".into());

    // Operator-level flags come first so per-camera flags can override them
    if !settings.ffmpeg_extra_flags.is_empty() {
        args.extend(settings.ffmpeg_extra_flags.split_whitespace().map(String::from));
    }

    args.push("-i".into());
    args.push(input_specifier(spec));

    if !spec.extra_decoder_flags.is_empty() {
        args.extend(spec.extra_decoder_flags.split_whitespace().map(String::from));
    }

    match output_format(spec) {
        FrameFormat::Bgr24 => {
            if let Some(res) = dims.filter(|_| spec.resolution.fixed().is_some()) {
                args.extend(["-s".into(), res.to_string()]);
            }
            args.extend([
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "bgr24".into(),
            ]);
        }
        FrameFormat::Jpeg => {
            args.extend(["-f".into(), "mjpeg".into()]);
        }
    }
    args.push("-".into());
    args
}

/// Bus payload format produced by this backend for a given source mode.
pub fn output_format(spec: &ResolvedCameraSpec) -> FrameFormat {
    match spec.mode {
        // Local devices share the raw BGR contract so the bus stays uniform
        SourceMode::Rtsp | SourceMode::Local => FrameFormat::Bgr24,
        SourceMode::Http => FrameFormat::Jpeg,
    }
}

fn input_specifier(spec: &ResolvedCameraSpec) -> String {
    match spec.mode {
        SourceMode::Rtsp | SourceMode::Http => spec.uri.clone(),
        SourceMode::Local => {
            if cfg!(target_os = "windows") {
                format!("video={}", spec.uri)
            } else {
                spec.uri.clone()
            }
        }
    }
}

fn local_input_format() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["-f".into(), "avfoundation".into()]
    } else if cfg!(target_os = "windows") {
        vec!["-f".into(), "dshow".into()]
    } else {
        vec!["-f".into(), "v4l2".into()]
    }
}

#[derive(Debug)]
enum ReadState {
    Raw {
        expected: usize,
        buf: Vec<u8>,
    },
    Mjpeg {
        scan: BytesMut,
    },
}

/// A running ffmpeg decoder for one camera
#[derive(Debug)]
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr_ring: StderrRing,
    stderr_task: JoinHandle<()>,
    state: ReadState,
    /// Masked command line, stored for debug records
    command: String,
    resolution: Resolution,
    format: FrameFormat,
    started_at: Instant,
    pub frames_total: u64,
    pub partial_reads: u64,
    pub first_frame_ms: Option<u64>,
}

impl FfmpegSource {
    /// Spawn the decoder process for `spec` over `transport`.
    ///
    /// `dims` must be known for raw output; MJPEG output tolerates unknown
    /// dimensions until the first probe succeeds.
    pub fn spawn(
        spec: &ResolvedCameraSpec,
        settings: &CaptureSettings,
        transport: &str,
        dims: Option<Resolution>,
    ) -> Result<Self> {
        let format = output_format(spec);
        let resolution = dims.unwrap_or(Resolution::new(0, 0));
        if format == FrameFormat::Bgr24 && !resolution.is_valid() {
            return Err(AppError::camera(
                ErrorCode::NoVideoStream,
                format!("camera {}: stream dimensions unknown", spec.id),
            ));
        }

        let args = build_args(spec, settings, transport, dims);
        let command = mask_credentials(&format!("ffmpeg {}", args.join(" ")));
        tracing::debug!(camera_id = %spec.id, cmd = %command, "Spawning decoder");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AppError::camera(ErrorCode::DecoderMissing, "ffmpeg not found in PATH")
                } else {
                    AppError::camera(ErrorCode::ConnectFailed, format!("ffmpeg spawn: {e}"))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("decoder stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Internal("decoder stderr not captured".into()))?;

        let stderr_ring = StderrRing::new();
        let stderr_task = spawn_drain(stderr, stderr_ring.clone());

        let state = match format {
            FrameFormat::Bgr24 => {
                let expected = FrameFormat::Bgr24
                    .frame_size(resolution)
                    .expect("raw format has fixed size");
                ReadState::Raw {
                    expected,
                    buf: vec![0u8; expected],
                }
            }
            FrameFormat::Jpeg => ReadState::Mjpeg {
                scan: BytesMut::with_capacity(64 * 1024),
            },
        };

        Ok(Self {
            child,
            stdout,
            stderr_ring,
            stderr_task,
            state,
            command,
            resolution,
            format,
            started_at: Instant::now(),
            frames_total: 0,
            partial_reads: 0,
            first_frame_ms: None,
        })
    }

    /// Read the next complete frame, waiting up to `timeout`.
    ///
    /// On timeout, EOF or short read the stderr tail is consulted for a
    /// more specific classification than the raw I/O symptom.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes> {
        let result = tokio::time::timeout(timeout, self.read_frame_inner()).await;
        let payload = match result {
            Ok(Ok(payload)) => payload,
            Ok(Err(code)) => return Err(self.classified_error(code)),
            Err(_) => return Err(self.classified_error(ErrorCode::ReadTimeout)),
        };

        self.frames_total += 1;
        if self.first_frame_ms.is_none() {
            self.first_frame_ms = Some(self.started_at.elapsed().as_millis() as u64);
        }
        Ok(payload)
    }

    async fn read_frame_inner(&mut self) -> std::result::Result<Bytes, ErrorCode> {
        match &mut self.state {
            ReadState::Raw { expected, buf } => {
                let mut filled = 0usize;
                while filled < *expected {
                    match self.stdout.read(&mut buf[filled..]).await {
                        Ok(0) => {
                            if filled > 0 {
                                self.partial_reads += 1;
                            }
                            return Err(ErrorCode::ConnectFailed);
                        }
                        Ok(n) => filled += n,
                        Err(_) => return Err(ErrorCode::ConnectFailed),
                    }
                }
                Ok(Bytes::copy_from_slice(buf))
            }
            ReadState::Mjpeg { scan } => {
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    if let Some(jpeg) = extract_jpeg(scan) {
                        return Ok(jpeg);
                    }
                    if scan.len() > MAX_JPEG_SCAN {
                        return Err(ErrorCode::InvalidStream);
                    }
                    match self.stdout.read(&mut chunk).await {
                        Ok(0) => return Err(ErrorCode::ConnectFailed),
                        Ok(n) => scan.extend_from_slice(&chunk[..n]),
                        Err(_) => return Err(ErrorCode::ConnectFailed),
                    }
                }
            }
        }
    }

    fn classified_error(&self, fallback: ErrorCode) -> AppError {
        let tail = self.stderr_ring.tail();
        let code = classify_decoder_stderr(&tail).unwrap_or(fallback);
        let message = if tail.is_empty() {
            "decoder produced no diagnostics".to_string()
        } else {
            tail
        };
        AppError::Camera { code, message }
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_ring.tail()
    }

    /// Masked command line of the running decoder.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Exit code if the process has already terminated.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
    }

    /// Stop the decoder: graceful terminate, unconditional kill after 2 s.
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

/// Pull one complete JPEG (SOI..EOI) out of the scan buffer, if present.
fn extract_jpeg(scan: &mut BytesMut) -> Option<Bytes> {
    let start = find_marker(scan, &[0xFF, 0xD8])?;
    let end = find_marker(&scan[start..], &[0xFF, 0xD9]).map(|p| start + p + 2)?;
    let mut jpeg = scan.split_to(end);
    let jpeg = jpeg.split_off(start);
    Some(jpeg.freeze())
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|w| w[0] == marker[0] && w[1] == marker[1])
}
