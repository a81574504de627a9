use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::camera::spec::{CameraOverride, CameraProfile, CameraSpec};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Frame bus and preview settings
    pub stream: StreamSettings,
    /// Decoder process settings
    pub capture: CaptureSettings,
    /// Backoff and circuit breaker settings
    pub reconnect: ReconnectSettings,
    /// Camera fleet definition
    pub cameras: Vec<CameraSpec>,
    /// Per-camera overrides applied between explicit values and profiles
    pub overrides: HashMap<String, CameraOverride>,
    /// Named profiles referenced by `CameraSpec::profile_name`
    pub profiles: HashMap<String, CameraProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            stream: StreamSettings::default(),
            capture: CaptureSettings::default(),
            reconnect: ReconnectSettings::default(),
            cameras: Vec::new(),
            overrides: HashMap::new(),
            profiles: HashMap::new(),
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Listen address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Frame bus and MJPEG preview settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Frame bus ring capacity
    pub queue_max: usize,
    /// Maximum MJPEG emission rate per subscriber
    pub target_fps: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// No frame for this long marks a READY capture as stalled
    pub no_frame_timeout_ms: u64,
    /// Keep-alive part cadence when no fresh frame is available
    pub heartbeat_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_max: 3,
            target_fps: 15,
            jpeg_quality: 80,
            no_frame_timeout_ms: 2_000,
            heartbeat_interval_ms: 1_500,
        }
    }
}

/// Decoder process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// RTSP connection timeout passed as `-stimeout` (microseconds)
    pub rtsp_stimeout_usec: u64,
    /// `-reconnect_delay_max` for the decoder's own retry (seconds)
    pub ffmpeg_reconnect_delay_secs: u32,
    /// Global ffprobe timeout (seconds)
    pub ffprobe_timeout_sec: u64,
    /// Trial decode length during probing (seconds)
    pub probe_sample_seconds: u64,
    /// How long a cached resolution survives a probe failure (seconds)
    pub probe_fallback_ttl_secs: u64,
    /// Force tcp transport regardless of spec preference
    pub force_tcp: bool,
    /// Flags prepended to every decoder argv (before `-i`)
    pub ffmpeg_extra_flags: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            rtsp_stimeout_usec: 5_000_000,
            ffmpeg_reconnect_delay_secs: 2,
            ffprobe_timeout_sec: 30,
            probe_sample_seconds: 2,
            probe_fallback_ttl_secs: 120,
            force_tcp: false,
            ffmpeg_extra_flags: String::new(),
        }
    }
}

/// Backoff and circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Jitter fraction applied as `delay * (1 ± jitter)`
    pub jitter: f64,
    /// Consecutive failures that open the breaker
    pub breaker_threshold: u32,
    /// How long the breaker stays open before a half-open retry
    pub breaker_open_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            jitter: 0.25,
            breaker_threshold: 3,
            breaker_open_ms: 15_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
                None
            }
        },
        Err(_) => None,
    }
}

impl AppConfig {
    /// Apply recognized environment switches on top of file values.
    ///
    /// Environment always wins; this runs once at startup so pipelines see a
    /// single consistent configuration.
    pub fn apply_env_overrides(&mut self) {
        if std::env::var("RTSP_TCP").map(|v| v == "1").unwrap_or(false) {
            self.capture.force_tcp = true;
        }
        if let Ok(flags) = std::env::var("FFMPEG_EXTRA_FLAGS") {
            self.capture.ffmpeg_extra_flags = flags;
        }
        if let Some(v) = env_parse("QUEUE_MAX") {
            self.stream.queue_max = v;
        }
        if let Some(v) = env_parse("TARGET_FPS") {
            self.stream.target_fps = v;
        }
        if let Some(v) = env_parse("FRAME_JPEG_QUALITY") {
            self.stream.jpeg_quality = v;
        }
        if let Some(v) = env_parse("NO_FRAME_TIMEOUT_MS") {
            self.stream.no_frame_timeout_ms = v;
        }
        if let Some(v) = env_parse("HEARTBEAT_INTERVAL_MS") {
            self.stream.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("RTSP_STIMEOUT_USEC") {
            self.capture.rtsp_stimeout_usec = v;
        }
        if let Some(v) = env_parse("FFPROBE_TIMEOUT_SEC") {
            self.capture.ffprobe_timeout_sec = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recognized_timeouts() {
        let config = AppConfig::default();
        assert_eq!(config.stream.queue_max, 3);
        assert_eq!(config.stream.target_fps, 15);
        assert_eq!(config.stream.jpeg_quality, 80);
        assert_eq!(config.stream.no_frame_timeout_ms, 2_000);
        assert_eq!(config.stream.heartbeat_interval_ms, 1_500);
        assert_eq!(config.capture.rtsp_stimeout_usec, 5_000_000);
        assert_eq!(config.capture.ffprobe_timeout_sec, 30);
        assert_eq!(config.capture.probe_fallback_ttl_secs, 120);
        assert_eq!(config.reconnect.breaker_threshold, 3);
        assert_eq!(config.reconnect.breaker_open_ms, 15_000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"web": {"http_port": 9000}}"#).unwrap();
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.stream.target_fps, 15);
    }

    #[test]
    fn test_cameras_deserialize() {
        let config: AppConfig = serde_json::from_str(
            r#"{"cameras": [{"id": "lobby", "uri": "rtsp://10.0.0.5/stream", "resolution": "1280x720"}]}"#,
        )
        .unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].id, "lobby");
        assert_eq!(config.cameras[0].ready_frames, 1);
    }
}
