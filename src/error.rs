use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable string codes for every failure the core can observe.
///
/// Codes are classified at the point a failure is first seen (probe result,
/// decoder exit, read error, timeout) and propagate unchanged through the
/// reconnect controller into `last_error` and the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    InvalidPath,
    NetworkUnreachable,
    InvalidStream,
    ConnectFailed,
    ReadTimeout,
    NoVideoStream,
    DecoderMissing,
    InvalidSpec,
    AlreadyExists,
    PreviewDisabled,
    BreakerOpen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::NetworkUnreachable => "NETWORK_UNREACHABLE",
            ErrorCode::InvalidStream => "INVALID_STREAM",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::ReadTimeout => "READ_TIMEOUT",
            ErrorCode::NoVideoStream => "NO_VIDEO_STREAM",
            ErrorCode::DecoderMissing => "DECODER_MISSING",
            ErrorCode::InvalidSpec => "INVALID_SPEC",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PreviewDisabled => "PREVIEW_DISABLED",
            ErrorCode::BreakerOpen => "BREAKER_OPEN",
        }
    }

    /// Transient failures are retried by the reconnect controller and only
    /// surface as `last_error`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectFailed | ErrorCode::ReadTimeout | ErrorCode::NoVideoStream
        )
    }

    /// Persistent configuration problems. Still retried (camera firmware may
    /// recover), but the breaker opens sooner and the UI surfaces the code.
    pub fn is_persistent_config(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed
                | ErrorCode::InvalidPath
                | ErrorCode::InvalidStream
                | ErrorCode::InvalidSpec
                | ErrorCode::DecoderMissing
        )
    }

    /// Contract violations returned to the caller synchronously, never
    /// retried internally.
    pub fn is_contract(&self) -> bool {
        matches!(
            self,
            ErrorCode::AlreadyExists | ErrorCode::PreviewDisabled | ErrorCode::BreakerOpen
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{code}: {message}")]
    Camera { code: ErrorCode, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Construct a camera error carrying a taxonomy code.
    pub fn camera(code: ErrorCode, message: impl Into<String>) -> Self {
        AppError::Camera {
            code,
            message: message.into(),
        }
    }

    /// Taxonomy code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AppError::Camera { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn status_code(&self) -> StatusCode {
        // Always return 200 OK - success/failure is indicated by the success field
        StatusCode::OK
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
            code: self.code().map(|c| c.as_str()),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(ErrorCode::AuthFailed.as_str(), "AUTH_FAILED");
        assert_eq!(ErrorCode::NoVideoStream.as_str(), "NO_VIDEO_STREAM");
        assert_eq!(ErrorCode::BreakerOpen.as_str(), "BREAKER_OPEN");
    }

    #[test]
    fn test_classification_is_disjoint() {
        for code in [
            ErrorCode::AuthFailed,
            ErrorCode::InvalidPath,
            ErrorCode::NetworkUnreachable,
            ErrorCode::InvalidStream,
            ErrorCode::ConnectFailed,
            ErrorCode::ReadTimeout,
            ErrorCode::NoVideoStream,
            ErrorCode::DecoderMissing,
            ErrorCode::InvalidSpec,
            ErrorCode::AlreadyExists,
            ErrorCode::PreviewDisabled,
            ErrorCode::BreakerOpen,
        ] {
            let classes = [
                code.is_transient(),
                code.is_persistent_config(),
                code.is_contract(),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "{code} must belong to exactly one class"
            );
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCode::ReadTimeout).unwrap();
        assert_eq!(json, "\"READ_TIMEOUT\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::ReadTimeout);
    }

    #[test]
    fn test_camera_error_display() {
        let err = AppError::camera(ErrorCode::AuthFailed, "rtsp probe returned 401");
        assert_eq!(err.to_string(), "AUTH_FAILED: rtsp probe returned 401");
        assert_eq!(err.code(), Some(ErrorCode::AuthFailed));
    }
}
