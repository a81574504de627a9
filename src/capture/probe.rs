//! One-shot stream probing
//!
//! Wraps the decoder's inspection tool (`ffprobe`) to discover codec,
//! resolution and frame rate before a decoder is spawned, and optionally
//! runs short trial decodes across transport/hwaccel combinations to pick
//! the best performing one. Probing is idempotent and side-effect free.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Command;

use crate::config::schema::CaptureSettings;
use crate::error::{AppError, ErrorCode, Result};
use crate::stream::frame::Resolution;
use crate::utils::url::mask_credentials;

/// Video stream metadata extracted from ffprobe JSON
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeMetadata {
    pub codec: Option<String>,
    pub profile: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    /// From `r_frame_rate`
    pub nominal_fps: f64,
    /// From `avg_frame_rate`
    pub avg_fps: f64,
}

/// Outcome of one trial decode
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub transport: String,
    pub hwaccel: bool,
    pub frames: u32,
    pub fps: f64,
    pub elapsed_ms: u64,
}

/// Full probe report
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub metadata: ProbeMetadata,
    /// Best transport observed by the trials (or the requested one)
    pub transport: String,
    pub hwaccel: bool,
    pub frames: u32,
    pub effective_fps: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trials: Vec<TrialResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Map probe tool stderr to a taxonomy code.
pub fn classify_probe_stderr(stderr: &str) -> ErrorCode {
    let s = stderr.to_ascii_lowercase();
    if s.contains("401") || s.contains("403") || s.contains("unauthor") {
        ErrorCode::AuthFailed
    } else if s.contains("404") || s.contains("not found") {
        ErrorCode::InvalidPath
    } else if s.contains("connection refused")
        || s.contains("no route to host")
        || s.contains("network is unreachable")
        || s.contains("name or service not known")
    {
        ErrorCode::NetworkUnreachable
    } else if s.contains("invalid data found") {
        ErrorCode::InvalidStream
    } else {
        ErrorCode::ConnectFailed
    }
}

/// Operator hints attached to classified probe failures.
fn hints_for(code: ErrorCode) -> Vec<String> {
    match code {
        ErrorCode::AuthFailed => vec!["Verify camera credentials".to_string()],
        ErrorCode::InvalidPath => vec![
            "Check stream path or channel".to_string(),
            "Hikvision: /Streaming/Channels/101, Dahua: /cam/realmonitor?channel=1&subtype=0"
                .to_string(),
        ],
        ErrorCode::NetworkUnreachable => {
            vec!["Verify camera is reachable and port is open".to_string()]
        }
        ErrorCode::InvalidStream => {
            vec!["Check credentials or stream format".to_string()]
        }
        _ => Vec::new(),
    }
}

enum CacheDecision {
    /// A recent failure is on record; reuse the cached dimensions.
    UseFallback(Resolution),
    /// No usable fallback; a probe process must run.
    NeedProbe,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    dims: Option<Resolution>,
    last_failure: Option<Instant>,
    /// Transport whose trial decode produced the most frames
    preferred_transport: Option<String>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            dims: None,
            last_failure: None,
            preferred_transport: None,
        }
    }
}

/// Fallback cache: after a probe failure, dimension queries within the TTL
/// are served from the last known values without spawning a probe process.
struct ProbeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ProbeCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, uri: &str, ttl: Duration) -> CacheDecision {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(uri) {
            if let (Some(failed_at), Some(dims)) = (entry.last_failure, entry.dims) {
                if failed_at.elapsed() < ttl {
                    return CacheDecision::UseFallback(dims);
                }
            }
        }
        CacheDecision::NeedProbe
    }

    fn record_success(&self, uri: &str, dims: Resolution) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(uri.to_string())
            .or_insert_with(CacheEntry::empty);
        entry.dims = Some(dims);
        entry.last_failure = None;
    }

    fn record_failure(&self, uri: &str) {
        let mut entries = self.entries.lock();
        entries
            .entry(uri.to_string())
            .or_insert_with(CacheEntry::empty)
            .last_failure = Some(Instant::now());
    }

    fn record_transport(&self, uri: &str, transport: &str) {
        let mut entries = self.entries.lock();
        entries
            .entry(uri.to_string())
            .or_insert_with(CacheEntry::empty)
            .preferred_transport = Some(transport.to_string());
    }

    fn preferred(&self, uri: &str) -> Option<String> {
        self.entries
            .lock()
            .get(uri)
            .and_then(|e| e.preferred_transport.clone())
    }
}

/// Stream prober with a per-URI fallback cache
pub struct StreamProber {
    cache: ProbeCache,
}

impl StreamProber {
    pub fn new() -> Self {
        Self {
            cache: ProbeCache::new(),
        }
    }

    /// Resolve stream dimensions for a capture attempt.
    ///
    /// Serves the cached fallback (without spawning) while a recent probe
    /// failure is within `probe_fallback_ttl_secs`; otherwise runs ffprobe
    /// and updates the cache either way.
    pub async fn dimensions(
        &self,
        uri: &str,
        transport: &str,
        settings: &CaptureSettings,
    ) -> Option<Resolution> {
        let ttl = Duration::from_secs(settings.probe_fallback_ttl_secs);
        if let CacheDecision::UseFallback(dims) = self.cache.lookup(uri, ttl) {
            tracing::debug!(
                uri = %mask_credentials(uri),
                %dims,
                "Using cached fallback resolution"
            );
            return Some(dims);
        }

        match self.run_ffprobe(uri, transport, settings).await {
            Ok(meta) if meta.width >= 16 && meta.height >= 16 => {
                let dims = Resolution::new(meta.width, meta.height);
                self.cache.record_success(uri, dims);
                Some(dims)
            }
            Ok(_) => {
                self.cache.record_failure(uri);
                None
            }
            Err(e) => {
                tracing::debug!(uri = %mask_credentials(uri), error = %e, "ffprobe failed");
                self.cache.record_failure(uri);
                // Fall back to whatever we knew before the failure window
                match self.cache.lookup(uri, ttl) {
                    CacheDecision::UseFallback(dims) => Some(dims),
                    CacheDecision::NeedProbe => None,
                }
            }
        }
    }

    /// Transport that decoded the most frames in the last sampled probe of
    /// this URI, if any.
    pub fn preferred_transport(&self, uri: &str) -> Option<String> {
        self.cache.preferred(uri)
    }

    /// One-shot probe with classification, for the `/api/probe` surface.
    ///
    /// `transport` limits the trials; `sample` enables short trial decodes
    /// across {tcp, udp} x {hwaccel on, off}.
    pub async fn probe(
        &self,
        uri: &str,
        transport: Option<&str>,
        sample: bool,
        settings: &CaptureSettings,
    ) -> Result<ProbeReport> {
        let meta = self
            .run_ffprobe(uri, transport.unwrap_or("tcp"), settings)
            .await?;
        if meta.width >= 16 && meta.height >= 16 {
            self.cache
                .record_success(uri, Resolution::new(meta.width, meta.height));
        }

        let mut trials = Vec::new();
        if sample {
            let transports: Vec<&str> = match transport {
                Some(t) => vec![t],
                None => vec!["tcp", "udp"],
            };
            for t in &transports {
                for hwaccel in [false, true] {
                    trials.push(self.run_trial(uri, t, hwaccel, settings).await);
                }
            }
        }

        let best = trials
            .iter()
            .max_by(|a, b| {
                (a.frames, a.fps)
                    .partial_cmp(&(b.frames, b.fps))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        // Remember the winning transport so Auto capture attempts can try
        // it first.
        if let Some(best) = best.as_ref().filter(|b| b.frames > 0) {
            self.cache.record_transport(uri, &best.transport);
        }

        Ok(ProbeReport {
            metadata: meta,
            transport: best
                .as_ref()
                .map(|b| b.transport.clone())
                .unwrap_or_else(|| transport.unwrap_or("tcp").to_string()),
            hwaccel: best.as_ref().map(|b| b.hwaccel).unwrap_or(false),
            frames: best.as_ref().map(|b| b.frames).unwrap_or(0),
            effective_fps: best.as_ref().map(|b| b.fps).unwrap_or(0.0),
            trials,
            hints: Vec::new(),
        })
    }

    async fn run_ffprobe(
        &self,
        uri: &str,
        transport: &str,
        settings: &CaptureSettings,
    ) -> Result<ProbeMetadata> {
        let mut cmd = Command::new("ffprobe");
        cmd.args(["-v", "error", "-show_streams", "-print_format", "json"]);
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", transport]);
            cmd.args(["-stimeout", &settings.rtsp_stimeout_usec.to_string()]);
            cmd.args(["-select_streams", "v:0"]);
        }
        cmd.arg(uri);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::camera(ErrorCode::DecoderMissing, "ffprobe not found in PATH")
            } else {
                AppError::camera(ErrorCode::ConnectFailed, format!("ffprobe spawn: {e}"))
            }
        })?;

        let timeout = Duration::from_secs(settings.ffprobe_timeout_sec);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AppError::camera(
                    ErrorCode::ConnectFailed,
                    format!("ffprobe: {e}"),
                ))
            }
            // Dropping the child on timeout kills it (kill_on_drop)
            Err(_) => {
                return Err(AppError::camera(
                    ErrorCode::ConnectFailed,
                    format!("ffprobe timed out after {}s", settings.ffprobe_timeout_sec),
                ))
            }
        };

        if !output.status.success() {
            let stderr = mask_credentials(&String::from_utf8_lossy(&output.stderr));
            let code = classify_probe_stderr(&stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            let mut message = tail;
            for hint in hints_for(code) {
                message.push_str("\nhint: ");
                message.push_str(&hint);
            }
            return Err(AppError::Camera { code, message });
        }

        parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            AppError::camera(ErrorCode::NoVideoStream, "probe found no video stream")
        })
    }

    async fn run_trial(
        &self,
        uri: &str,
        transport: &str,
        hwaccel: bool,
        settings: &CaptureSettings,
    ) -> TrialResult {
        let mut cmd = Command::new("ffmpeg");
        if uri.starts_with("rtsp://") {
            cmd.args(["-rtsp_transport", transport]);
        }
        if hwaccel {
            cmd.args(["-hwaccel", "auto"]);
        }
        cmd.args([
            "-i",
            uri,
            "-an",
            "-flags",
            "low_delay",
            "-fflags",
            "nobuffer",
            "-t",
            &settings.probe_sample_seconds.to_string(),
            "-f",
            "null",
            "-",
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let timeout = Duration::from_secs(settings.probe_sample_seconds + 5);
        let frames = match cmd.spawn() {
            Ok(child) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    parse_trial_frames(&String::from_utf8_lossy(&output.stderr))
                }
                _ => 0,
            },
            Err(_) => 0,
        };
        let elapsed = start.elapsed();
        let fps = frames as f64 / elapsed.as_secs_f64().max(0.001);

        TrialResult {
            transport: transport.to_string(),
            hwaccel,
            frames,
            fps,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl Default for StreamProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the first video stream out of ffprobe's JSON report.
fn parse_ffprobe_json(text: &str) -> Option<ProbeMetadata> {
    let info: serde_json::Value = serde_json::from_str(text).ok()?;
    let streams = info.get("streams")?.as_array()?;
    let stream = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(|t| t.as_str()) == Some("video"))?;

    let parse_rate = |key: &str| -> f64 {
        stream
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|txt| {
                let (num, den) = txt.split_once('/')?;
                let num: f64 = num.parse().ok()?;
                let den: f64 = den.parse().ok()?;
                (den != 0.0).then(|| num / den)
            })
            .unwrap_or(0.0)
    };

    Some(ProbeMetadata {
        codec: stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(String::from),
        profile: stream
            .get("profile")
            .and_then(|v| v.as_str())
            .map(String::from),
        width: stream.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        height: stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        pix_fmt: stream
            .get("pix_fmt")
            .and_then(|v| v.as_str())
            .map(String::from),
        nominal_fps: parse_rate("r_frame_rate"),
        avg_fps: parse_rate("avg_frame_rate"),
    })
}

/// Extract the final decoded frame count from ffmpeg progress stderr.
fn parse_trial_frames(stderr: &str) -> u32 {
    let mut frames = 0;
    for line in stderr.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("frame=") {
            if let Some(value) = rest.split_whitespace().next() {
                if let Ok(n) = value.parse() {
                    frames = n;
                }
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth() {
        assert_eq!(
            classify_probe_stderr("method DESCRIBE failed: 401 Unauthorized"),
            ErrorCode::AuthFailed
        );
        assert_eq!(
            classify_probe_stderr("Server returned 403 Forbidden"),
            ErrorCode::AuthFailed
        );
    }

    #[test]
    fn test_classify_path_and_network() {
        assert_eq!(
            classify_probe_stderr("Server returned 404 Not Found"),
            ErrorCode::InvalidPath
        );
        assert_eq!(
            classify_probe_stderr("Connection refused"),
            ErrorCode::NetworkUnreachable
        );
        assert_eq!(
            classify_probe_stderr("Network is unreachable"),
            ErrorCode::NetworkUnreachable
        );
    }

    #[test]
    fn test_classify_invalid_stream_and_default() {
        assert_eq!(
            classify_probe_stderr("Invalid data found when processing input"),
            ErrorCode::InvalidStream
        );
        assert_eq!(
            classify_probe_stderr("something else entirely"),
            ErrorCode::ConnectFailed
        );
    }

    #[test]
    fn test_parse_ffprobe_json() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "profile": "Main",
                    "width": 1280,
                    "height": 720,
                    "pix_fmt": "yuv420p",
                    "r_frame_rate": "30/1",
                    "avg_frame_rate": "25/1"
                }
            ]
        }"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert_eq!(meta.codec.as_deref(), Some("h264"));
        assert_eq!(meta.width, 1280);
        assert_eq!(meta.height, 720);
        assert_eq!(meta.nominal_fps, 30.0);
        assert_eq!(meta.avg_fps, 25.0);
    }

    #[test]
    fn test_parse_ffprobe_json_no_video() {
        let json = r#"{"streams": [{"codec_type": "audio"}]}"#;
        assert!(parse_ffprobe_json(json).is_none());
        assert!(parse_ffprobe_json("not json").is_none());
    }

    #[test]
    fn test_parse_trial_frames_takes_last() {
        let stderr = "frame=   10 fps= 10 q=-0.0\nframe=   57 fps= 28 q=-0.0 Lsize=N/A";
        assert_eq!(parse_trial_frames(stderr), 57);
        assert_eq!(parse_trial_frames("no frames here"), 0);
    }

    #[test]
    fn test_fallback_cache_serves_within_ttl() {
        let cache = ProbeCache::new();
        let ttl = Duration::from_secs(120);
        let dims = Resolution::new(1280, 720);

        // Nothing known yet
        assert!(matches!(
            cache.lookup("rtsp://cam/s", ttl),
            CacheDecision::NeedProbe
        ));

        // Success then failure: fallback is served while the failure is fresh
        cache.record_success("rtsp://cam/s", dims);
        assert!(matches!(
            cache.lookup("rtsp://cam/s", ttl),
            CacheDecision::NeedProbe
        ));
        cache.record_failure("rtsp://cam/s");
        match cache.lookup("rtsp://cam/s", ttl) {
            CacheDecision::UseFallback(d) => assert_eq!(d, dims),
            CacheDecision::NeedProbe => panic!("expected fallback"),
        }
    }

    #[test]
    fn test_fallback_cache_expires() {
        let cache = ProbeCache::new();
        let dims = Resolution::new(640, 360);
        cache.record_success("u", dims);
        cache.record_failure("u");
        // Zero TTL: the failure window is already over
        assert!(matches!(
            cache.lookup("u", Duration::ZERO),
            CacheDecision::NeedProbe
        ));
    }

    #[test]
    fn test_fallback_without_known_dims_forces_probe() {
        let cache = ProbeCache::new();
        cache.record_failure("u");
        assert!(matches!(
            cache.lookup("u", Duration::from_secs(120)),
            CacheDecision::NeedProbe
        ));
    }

    #[test]
    fn test_preferred_transport_survives_other_updates() {
        let cache = ProbeCache::new();
        assert!(cache.preferred("u").is_none());
        cache.record_transport("u", "udp");
        assert_eq!(cache.preferred("u").as_deref(), Some("udp"));
        // Dimension updates must not clobber the transport hint
        cache.record_success("u", Resolution::new(640, 360));
        cache.record_failure("u");
        assert_eq!(cache.preferred("u").as_deref(), Some("udp"));
    }
}
