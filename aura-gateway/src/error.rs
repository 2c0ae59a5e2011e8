//! Error types and wire response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy exposed on the wire
///
/// Plugins translate low-level failures into one of these kinds before
/// returning; adapters translate the kind into a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    Validation,
    #[serde(rename = "ratelimit")]
    RateLimit,
    Encryption,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::RateLimit => "ratelimit",
            Self::Encryption => "encryption",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Request requires encryption but no session exists for the client id
    #[error("No encryption session for client '{0}'")]
    NoSession(String),

    /// Ciphertext failed to authenticate
    #[error("Decryption failed: {0}")]
    DecryptFail(String),

    /// Nonce was already seen within the replay window
    #[error("Nonce replay detected")]
    NonceReplay,

    /// Bearer token missing from the request
    #[error("Missing bearer token")]
    AuthMissing,

    /// Bearer token failed validation
    #[error("Invalid bearer token: {0}")]
    AuthInvalid(String),

    /// Bearer token expired
    #[error("Bearer token expired")]
    AuthExpired,

    /// Caller is authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded; hint tells the caller when to retry
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_ms: u64 },

    /// Payload failed the per-route contract
    #[error("Invalid payload at '{pointer}': {message}")]
    BadPayload { pointer: String, message: String },

    /// Bus reply deadline passed
    #[error("Upstream timeout on '{0}'")]
    UpstreamTimeout(String),

    /// No handler subscribed for the subject, or no route for the path
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Resource conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// JWT library error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log store error
    #[error("Store error: {0}")]
    Store(Box<sqlx::Error>),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSession(_) | Self::DecryptFail(_) | Self::NonceReplay => ErrorKind::Encryption,
            Self::AuthMissing | Self::AuthInvalid(_) | Self::AuthExpired | Self::Forbidden(_) => {
                ErrorKind::Auth
            }
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::BadPayload { .. } => ErrorKind::Validation,
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_) => ErrorKind::Upstream,
            Self::Config(_)
            | Self::Conflict(_)
            | Self::Jwt(_)
            | Self::Io(_)
            | Self::Store(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable sub-code within the taxonomy, e.g. `encryption/no_session`
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "encryption/no_session",
            Self::DecryptFail(_) => "encryption/decrypt_fail",
            Self::NonceReplay => "encryption/replay",
            Self::AuthMissing => "auth/missing",
            Self::AuthInvalid(_) => "auth/invalid",
            Self::AuthExpired => "auth/expired",
            Self::Forbidden(_) => "auth/forbidden",
            Self::RateLimited { .. } => "ratelimit/exceeded",
            Self::BadPayload { .. } => "validation/bad_payload",
            Self::UpstreamTimeout(_) => "upstream/timeout",
            Self::UpstreamUnavailable(_) => "upstream/unavailable",
            Self::Conflict(_) => "internal/conflict",
            Self::Config(_) => "internal/config",
            _ => "internal/error",
        }
    }

    /// HTTP status the adapters map this error to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSession(_)
            | Self::DecryptFail(_)
            | Self::NonceReplay
            | Self::AuthMissing
            | Self::AuthInvalid(_)
            | Self::AuthExpired
            | Self::Jwt(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BadPayload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) | Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry hint in milliseconds, present only for rate-limit rejections
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// JSON pointer to the failing field, present only for validation errors
    pub fn pointer(&self) -> Option<&str> {
        match self {
            Self::BadPayload { pointer, .. } => Some(pointer),
            _ => None,
        }
    }

    /// Build the wire error body `{"success":false,"error":{...}}`
    pub fn to_wire(&self) -> serde_json::Value {
        let mut error = json!({
            "kind": self.kind().as_str(),
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(ms) = self.retry_after_ms() {
            error["retry_after_ms"] = json!(ms);
        }
        if let Some(pointer) = self.pointer() {
            error["pointer"] = json!(pointer);
        }
        json!({ "success": false, "error": error })
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind as JwtKind;
        match e.kind() {
            JwtKind::ExpiredSignature => Self::AuthExpired,
            JwtKind::InvalidToken
            | JwtKind::InvalidSignature
            | JwtKind::ImmatureSignature
            | JwtKind::InvalidIssuer
            | JwtKind::InvalidAudience => Self::AuthInvalid(e.to_string()),
            _ => Self::Jwt(Box::new(e)),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(Box::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", e))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.code(), error = %self, "Internal error");
        }
        (status, Json(self.to_wire())).into_response()
    }
}
