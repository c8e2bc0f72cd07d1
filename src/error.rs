//! Error handling for OVD Watchdog.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rule document failed to parse or validate.
    #[error("Invalid rule ({origin}): {reason}")]
    InvalidRule { origin: String, reason: String },

    /// Process or channel configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The evidence buffer holds no frames.
    #[error("Ring buffer is empty")]
    EmptyBuffer,

    /// No buffered frame falls inside the requested window.
    #[error("No frames in range [{start:.2}, {end:.2}]")]
    NoFramesInRange { start: f64, end: f64 },

    /// A notification channel could not be built or used.
    #[error("Channel '{channel}': {reason}")]
    Channel { channel: String, reason: String },

    /// Malformed request parameter
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The frame loop is no longer accepting operator commands.
    #[error("Monitoring loop unavailable")]
    LoopUnavailable,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn invalid_rule(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRule {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn channel(channel: impl Into<String>, reason: impl ToString) -> Self {
        Error::Channel {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::InvalidRule { .. } => (StatusCode::BAD_REQUEST, "INVALID_RULE"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Error::LoopUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "LOOP_UNAVAILABLE"),
            Error::Http(_) | Error::Channel { .. } => (StatusCode::BAD_GATEWAY, "CHANNEL_ERROR"),
            Error::Sqlx(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
