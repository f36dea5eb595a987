//! # Error Handling
//!
//! Two error families live here:
//!
//! - **`AppError`**: failures of the HTTP surface, converted into JSON
//!   responses through actix's `ResponseError` trait.
//! - **`PlaybackError`**: failures inside the playback engine (a corrupt
//!   fragment, a closed or misbehaving rendering device). None of them is
//!   fatal; the engine reports them and keeps streaming.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **thiserror**: derives `Display` and `std::error::Error` from the
//!   `#[error(...)]` attributes, so each variant documents its own message
//! - **From trait**: lets `?` convert library errors into ours automatically
//! - **ResponseError trait**: turns an error into an HTTP response

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - ServiceUnavailable → 503 (session limit reached)
#[derive(Debug, Error)]
pub enum AppError {
    /// Server-side problems
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested resource was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No capacity for another playback session
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Machine-readable error type used in JSON bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

/// Converts errors into JSON responses of the shape:
///
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Sample rate must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `?` on an anyhow error inside a handler becomes a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// A fragment payload that could not be turned into PCM samples.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("fragment payload is empty")]
    EmptyPayload,

    #[error("fragment payload is not valid base64: {0}")]
    InvalidEncoding(String),

    /// 16-bit PCM needs an even number of bytes
    #[error("fragment payload has odd length {0}, expected 16-bit samples")]
    OddLength(usize),
}

/// Failures reported by a rendering device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Terminal state; callers treat operations on a closed device as no-ops
    #[error("rendering device is closed")]
    Closed,

    #[error("rendering device failure: {0}")]
    Backend(String),
}

/// Everything the playback engine can report while streaming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl PlaybackError {
    /// Short code sent to WebSocket clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            PlaybackError::Decode(_) => "decode_error",
            PlaybackError::Device(DeviceError::Closed) => "device_closed",
            PlaybackError::Device(DeviceError::Backend(_)) => "device_error",
        }
    }
}
