//! Error types for the Gatehouse gateway.
//!
//! Every client-facing failure renders the same stable JSON body:
//! `{"error": <short code>, "message": <human text>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the gateway error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error. Fatal at startup, never served to clients.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error (missing/invalid/expired credential, inactive principal)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Authorization error (role mismatch)
    #[error("Authorization error: {0}")]
    Forbidden(String),

    /// No matching route
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Rate limit exceeded. Client-retryable after the window resets.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Backend transport failure (connection refused, timeout, DNS).
    /// The carried detail is for logs only; clients always see the
    /// fixed "Service unavailable" body.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short error code for the JSON body.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "Unauthorized",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound(_) => "Not found",
            Self::InvalidRequest(_) => "Bad request",
            Self::RateLimited(_) => "Too many requests",
            Self::BackendUnavailable(_) => "Service unavailable",
            Self::Config(_) | Self::Internal(_) => "Internal error",
        }
    }

    /// Human-readable message for the JSON body.
    ///
    /// Backend failures always render the same message regardless of
    /// the underlying transport error; the detail goes to logs only.
    pub fn client_message(&self) -> String {
        match self {
            Self::BackendUnavailable(_) => "Backend service is not responding".to_string(),
            Self::Config(_) | Self::Internal(_) => "An internal error occurred".to_string(),
            Self::Auth(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::InvalidRequest(msg)
            | Self::RateLimited(msg) => msg.clone(),
        }
    }
}

/// Stable error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error_code().to_string(),
            message: self.client_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
