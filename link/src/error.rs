//! Error types for hass-link.
//!
//! Errors fall into three families:
//!
//! - **Internal**: a local bug, parse or decode failure, carrying a debug string.
//! - **Underlying**: an error raised by a dependency (JSON decoding, I/O, ...).
//! - **External**: an error reported by the server as `{code, message}`.
//!
//! Transport-level variants (`WebSocketError`, `NetworkError`, ...) describe why a
//! connection was lost; they reach callers through [`ConnectionPhase`] rather than
//! through request completions.
//!
//! [`ConnectionPhase`]: crate::response::ConnectionPhase

use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for hass-link operations.
pub type Result<T> = std::result::Result<T, HassLinkError>;

/// Errors produced by the connection engine and its caches.
///
/// The type is `Clone` so that it can be stored inside connection phases and
/// reconnect state and handed to several observers.
#[derive(Debug, Clone, Error)]
pub enum HassLinkError {
    /// Local failure (bug, malformed frame, decode failure).
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Wrapped error from a dependency.
    #[error("Underlying error: {0}")]
    UnderlyingError(Arc<dyn std::error::Error + Send + Sync>),

    /// Error reported by the server.
    #[error("Server error: {0}")]
    ServerError(ExternalError),

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// HTTP (Rest channel) failure.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Missing or invalid configuration (no endpoint, bad URL, ...).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The access token could not be obtained.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// An operation exceeded its deadline.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl HassLinkError {
    /// Create an internal error from anything printable.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Wrap a dependency error.
    pub fn underlying(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::UnderlyingError(Arc::new(err))
    }

    /// Returns the server-reported error, if this is one.
    pub fn as_external(&self) -> Option<&ExternalError> {
        match self {
            Self::ServerError(external) => Some(external),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HassLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::underlying(err)
    }
}

impl From<reqwest::Error> for HassLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HassLinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocketError(err.to_string())
    }
}

impl From<ExternalError> for HassLinkError {
    fn from(err: ExternalError) -> Self {
        Self::ServerError(err)
    }
}

/// An error object sent by the server in a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalError {
    /// Machine-readable error code, e.g. `not_found`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ExternalError {
    /// Code used when the server's error payload could not be understood.
    pub const INVALID_CODE: &'static str = "invalid";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Synthesized error for an error payload that has no usable shape.
    pub fn invalid() -> Self {
        Self::new(Self::INVALID_CODE, "Unable to parse error response")
    }

    /// Parse `{ "code": ..., "message": ... }`.
    ///
    /// Numeric codes are stringified. Anything without both fields yields
    /// [`ExternalError::invalid`].
    pub fn from_value(value: &JsonValue) -> Self {
        let code = match value.get("code") {
            Some(JsonValue::String(code)) => Some(code.clone()),
            Some(JsonValue::Number(code)) => Some(code.to_string()),
            _ => None,
        };
        let message = value.get("message").and_then(JsonValue::as_str);

        match (code, message) {
            (Some(code), Some(message)) => Self::new(code, message),
            _ => Self::invalid(),
        }
    }
}

impl fmt::Display for ExternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for ExternalError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_external_error_from_well_formed_value() {
        let err = ExternalError::from_value(&json!({"code": "not_found", "message": "Nope"}));
        assert_eq!(err, ExternalError::new("not_found", "Nope"));
    }

    #[test]
    fn test_external_error_numeric_code_is_stringified() {
        let err = ExternalError::from_value(&json!({"code": 3, "message": "bad"}));
        assert_eq!(err.code, "3");
    }

    #[test]
    fn test_external_error_unparseable_shape_is_invalid() {
        assert_eq!(ExternalError::from_value(&json!({"k": true})), ExternalError::invalid());
        assert_eq!(ExternalError::from_value(&json!("oops")), ExternalError::invalid());
        assert_eq!(ExternalError::from_value(&json!({"code": "x"})), ExternalError::invalid());
    }

    #[test]
    fn test_json_error_becomes_underlying() {
        let err: HassLinkError = serde_json::from_str::<JsonValue>("{nope")
            .map_err(HassLinkError::from)
            .unwrap_err();
        assert!(matches!(err, HassLinkError::UnderlyingError(_)));
        assert!(err.to_string().starts_with("Underlying error"));
    }
}
