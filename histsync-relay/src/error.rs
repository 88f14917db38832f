//! Relay error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Relay server errors.
///
/// Only [`RelayError::BadRequest`] maps to a 4xx status. Everything else is
/// reported as `503 Service Unavailable`, which clients interpret as "the
/// relay is unhealthy, keep working offline" rather than a protocol error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing parameter or malformed body. No state was changed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A protocol invariant was violated upstream (no devices for a user,
    /// registration over the user cap).
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Usage bookkeeping failure. Only surfaced outside production.
    #[error("Non-critical error: {0}")]
    NonCritical(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(e) => e.clone(),
            Self::Precondition(_) | Self::Storage(_) | Self::NonCritical(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                "Service unavailable".to_string()
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("Corrupt JSON column: {}", e))
    }
}

impl From<axum::extract::rejection::JsonRejection> for RelayError {
    fn from(e: axum::extract::rejection::JsonRejection) -> Self {
        Self::BadRequest(format!("Failed to decode body: {}", e.body_text()))
    }
}

impl From<axum::extract::rejection::QueryRejection> for RelayError {
    fn from(e: axum::extract::rejection::QueryRejection) -> Self {
        Self::BadRequest(format!("Invalid query string: {}", e.body_text()))
    }
}
