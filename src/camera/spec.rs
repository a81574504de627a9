//! Camera specifications
//!
//! A [`CameraSpec`] is what the operator submits; a [`ResolvedCameraSpec`]
//! is the immutable result of merging it with registry overrides and named
//! profile defaults. Precedence is explicit value → override → profile.
//! Resolution happens exactly once at create/reload; downstream components
//! never re-resolve.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorCode, Result};
use crate::stream::frame::Resolution;
use crate::utils::url::detect_mode;

/// Kind of source feeding a camera pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Rtsp,
    Http,
    Local,
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMode::Rtsp => write!(f, "rtsp"),
            SourceMode::Http => write!(f, "http"),
            SourceMode::Local => write!(f, "local"),
        }
    }
}

/// RTSP transport preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    /// Try tcp first, then udp
    #[default]
    Auto,
}

impl Transport {
    /// Transports to attempt, in order, within one capture lifecycle.
    ///
    /// For `Auto` this is the default order; the pipeline reverses it when
    /// a sampled probe found udp decoding more frames for the same URI.
    pub fn attempt_order(&self) -> &'static [&'static str] {
        match self {
            Transport::Tcp => &["tcp"],
            Transport::Udp => &["udp"],
            Transport::Auto => &["tcp", "udp"],
        }
    }
}

/// Capture backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ffmpeg,
    Gstreamer,
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Ffmpeg => write!(f, "ffmpeg"),
            BackendKind::Gstreamer => write!(f, "gstreamer"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Requested output resolution: native stream size or a fixed rescale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResolutionSpec {
    #[default]
    Original,
    Fixed(Resolution),
}

impl ResolutionSpec {
    pub fn fixed(&self) -> Option<Resolution> {
        match self {
            ResolutionSpec::Original => None,
            ResolutionSpec::Fixed(res) => Some(*res),
        }
    }
}

impl FromStr for ResolutionSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("original") {
            return Ok(ResolutionSpec::Original);
        }
        let (w, h) = trimmed
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH or 'original', got '{s}'"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("bad width in '{s}'"))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("bad height in '{s}'"))?;
        let res = Resolution::new(width, height);
        if !res.is_valid() {
            return Err(format!("resolution {res} out of range 16..=7680"));
        }
        Ok(ResolutionSpec::Fixed(res))
    }
}

impl TryFrom<String> for ResolutionSpec {
    type Error = String;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResolutionSpec> for String {
    fn from(value: ResolutionSpec) -> Self {
        match value {
            ResolutionSpec::Original => "original".to_string(),
            ResolutionSpec::Fixed(res) => res.to_string(),
        }
    }
}

fn default_ready_frames() -> u32 {
    1
}

fn default_ready_timeout_ms() -> u64 {
    15_000
}

fn default_backend_priority() -> Vec<BackendKind> {
    vec![BackendKind::Ffmpeg, BackendKind::Gstreamer, BackendKind::Local]
}

/// Operator-facing camera definition
///
/// Immutable after creation; `reload` replaces it atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSpec {
    /// Stable identifier, unique within the registry
    pub id: String,
    /// Source kind; inferred from the URI scheme when omitted
    #[serde(default)]
    pub mode: Option<SourceMode>,
    /// Stream URL or device path
    pub uri: String,
    #[serde(default)]
    pub transport_preference: Transport,
    #[serde(default)]
    pub resolution: ResolutionSpec,
    /// Consecutive frames required to declare READY
    #[serde(default = "default_ready_frames")]
    pub ready_frames: u32,
    /// Alternative readiness criterion: contiguous delivery for this long
    #[serde(default)]
    pub ready_duration_ms: u64,
    /// Maximum wait for readiness before a backend is declared failed
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Backends to attempt, in order
    #[serde(default = "default_backend_priority")]
    pub backend_priority: Vec<BackendKind>,
    /// Opaque flags appended to the decoder argv after `-i`
    #[serde(default)]
    pub extra_decoder_flags: String,
    /// Named override set applied below explicit values
    #[serde(default)]
    pub profile_name: Option<String>,
    /// Preview enablement flag
    #[serde(default)]
    pub show: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Named default set referenced by `CameraSpec::profile_name`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraProfile {
    pub transport_preference: Option<Transport>,
    pub resolution: Option<ResolutionSpec>,
    pub extra_decoder_flags: Option<String>,
    pub backend_priority: Option<Vec<BackendKind>>,
    /// Full GStreamer pipeline template; `{url}` is substituted
    pub gst_pipeline: Option<String>,
}

/// Per-camera override record stored in the registry config
pub type CameraOverride = CameraProfile;

/// Fully resolved, immutable camera configuration
///
/// Everything a pipeline needs, with profile and override precedence
/// already applied.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCameraSpec {
    pub id: String,
    pub mode: SourceMode,
    pub uri: String,
    pub transport_preference: Transport,
    pub resolution: ResolutionSpec,
    pub ready_frames: u32,
    pub ready_duration_ms: u64,
    pub ready_timeout_ms: u64,
    pub backend_priority: Vec<BackendKind>,
    pub extra_decoder_flags: String,
    pub gst_pipeline: Option<String>,
    pub show: bool,
    pub enabled: bool,
}

impl CameraSpec {
    /// Validate and resolve against overrides and profiles.
    ///
    /// Fails with `INVALID_SPEC` on a bad uri, resolution or mode.
    pub fn resolve(
        &self,
        overrides: &HashMap<String, CameraOverride>,
        profiles: &HashMap<String, CameraProfile>,
    ) -> Result<ResolvedCameraSpec> {
        if self.id.trim().is_empty() {
            return Err(AppError::camera(ErrorCode::InvalidSpec, "empty camera id"));
        }
        if self.uri.trim().is_empty() {
            return Err(AppError::camera(
                ErrorCode::InvalidSpec,
                format!("camera {}: empty uri", self.id),
            ));
        }

        let inferred = detect_mode(&self.uri);
        let mode = self.mode.unwrap_or(inferred);
        // A network scheme with mode=local (or vice versa) is a config typo,
        // not something to silently reinterpret.
        if self.mode.is_some() && mode != inferred {
            return Err(AppError::camera(
                ErrorCode::InvalidSpec,
                format!(
                    "camera {}: mode {mode} does not match uri scheme ({inferred})",
                    self.id
                ),
            ));
        }

        if let Some(res) = self.resolution.fixed() {
            if !res.is_valid() {
                return Err(AppError::camera(
                    ErrorCode::InvalidSpec,
                    format!("camera {}: resolution {res} out of range", self.id),
                ));
            }
        }
        if self.backend_priority.is_empty() {
            return Err(AppError::camera(
                ErrorCode::InvalidSpec,
                format!("camera {}: empty backend_priority", self.id),
            ));
        }

        let profile = self
            .profile_name
            .as_ref()
            .and_then(|name| profiles.get(name));
        let over = overrides.get(&self.id);

        // explicit > override > profile default, field by field
        let transport_preference = if self.transport_preference != Transport::default() {
            self.transport_preference
        } else {
            over.and_then(|o| o.transport_preference)
                .or_else(|| profile.and_then(|p| p.transport_preference))
                .unwrap_or(self.transport_preference)
        };
        let resolution = if self.resolution != ResolutionSpec::default() {
            self.resolution
        } else {
            over.and_then(|o| o.resolution)
                .or_else(|| profile.and_then(|p| p.resolution))
                .unwrap_or(self.resolution)
        };
        let extra_decoder_flags = if !self.extra_decoder_flags.is_empty() {
            self.extra_decoder_flags.clone()
        } else {
            over.and_then(|o| o.extra_decoder_flags.clone())
                .or_else(|| profile.and_then(|p| p.extra_decoder_flags.clone()))
                .unwrap_or_default()
        };
        let backend_priority = over
            .and_then(|o| o.backend_priority.clone())
            .or_else(|| profile.and_then(|p| p.backend_priority.clone()))
            .unwrap_or_else(|| self.backend_priority.clone());
        let gst_pipeline = over
            .and_then(|o| o.gst_pipeline.clone())
            .or_else(|| profile.and_then(|p| p.gst_pipeline.clone()));

        Ok(ResolvedCameraSpec {
            id: self.id.clone(),
            mode,
            uri: self.uri.clone(),
            transport_preference,
            resolution,
            ready_frames: self.ready_frames,
            ready_duration_ms: self.ready_duration_ms,
            ready_timeout_ms: self.ready_timeout_ms,
            backend_priority,
            extra_decoder_flags,
            gst_pipeline,
            show: self.show,
            enabled: self.enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> CameraSpec {
        CameraSpec {
            id: "lobby".to_string(),
            mode: None,
            uri: "rtsp://u:p@10.0.0.5/stream".to_string(),
            transport_preference: Transport::Tcp,
            resolution: "1280x720".parse().unwrap(),
            ready_frames: 1,
            ready_duration_ms: 0,
            ready_timeout_ms: 15_000,
            backend_priority: default_backend_priority(),
            extra_decoder_flags: String::new(),
            profile_name: None,
            show: false,
            enabled: true,
        }
    }

    #[test]
    fn test_resolution_spec_parsing() {
        assert_eq!(
            "original".parse::<ResolutionSpec>().unwrap(),
            ResolutionSpec::Original
        );
        assert_eq!(
            "1280x720".parse::<ResolutionSpec>().unwrap(),
            ResolutionSpec::Fixed(Resolution::new(1280, 720))
        );
        assert!("1280x".parse::<ResolutionSpec>().is_err());
        assert!("8x8".parse::<ResolutionSpec>().is_err());
        assert!("9000x720".parse::<ResolutionSpec>().is_err());
    }

    #[test]
    fn test_mode_inferred_from_scheme() {
        let resolved = base_spec()
            .resolve(&HashMap::new(), &HashMap::new())
            .unwrap();
        assert_eq!(resolved.mode, SourceMode::Rtsp);
    }

    #[test]
    fn test_mode_mismatch_rejected() {
        let mut spec = base_spec();
        spec.mode = Some(SourceMode::Local);
        let err = spec
            .resolve(&HashMap::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidSpec));
    }

    #[test]
    fn test_empty_uri_rejected() {
        let mut spec = base_spec();
        spec.uri = "  ".to_string();
        let err = spec
            .resolve(&HashMap::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidSpec));
    }

    #[test]
    fn test_profile_fills_defaults_but_explicit_wins() {
        let mut spec = base_spec();
        spec.profile_name = Some("low-latency".to_string());
        spec.transport_preference = Transport::Auto; // default → profile applies
        spec.resolution = ResolutionSpec::Original; // default → profile applies

        let mut profiles = HashMap::new();
        profiles.insert(
            "low-latency".to_string(),
            CameraProfile {
                transport_preference: Some(Transport::Udp),
                resolution: Some("640x360".parse().unwrap()),
                extra_decoder_flags: Some("-threads 2".to_string()),
                ..Default::default()
            },
        );

        let resolved = spec.resolve(&HashMap::new(), &profiles).unwrap();
        assert_eq!(resolved.transport_preference, Transport::Udp);
        assert_eq!(
            resolved.resolution,
            ResolutionSpec::Fixed(Resolution::new(640, 360))
        );
        assert_eq!(resolved.extra_decoder_flags, "-threads 2");

        // Explicit value beats the profile
        spec.transport_preference = Transport::Tcp;
        let resolved = spec.resolve(&HashMap::new(), &profiles).unwrap();
        assert_eq!(resolved.transport_preference, Transport::Tcp);
    }

    #[test]
    fn test_override_beats_profile() {
        let mut spec = base_spec();
        spec.profile_name = Some("p".to_string());
        spec.resolution = ResolutionSpec::Original;

        let mut profiles = HashMap::new();
        profiles.insert(
            "p".to_string(),
            CameraProfile {
                resolution: Some("640x360".parse().unwrap()),
                ..Default::default()
            },
        );
        let mut overrides = HashMap::new();
        overrides.insert(
            "lobby".to_string(),
            CameraOverride {
                resolution: Some("1920x1080".parse().unwrap()),
                ..Default::default()
            },
        );

        let resolved = spec.resolve(&overrides, &profiles).unwrap();
        assert_eq!(
            resolved.resolution,
            ResolutionSpec::Fixed(Resolution::new(1920, 1080))
        );
    }

    #[test]
    fn test_transport_attempt_order() {
        assert_eq!(Transport::Auto.attempt_order(), ["tcp", "udp"]);
        assert_eq!(Transport::Tcp.attempt_order(), ["tcp"]);
        assert_eq!(Transport::Udp.attempt_order(), ["udp"]);
    }
}
