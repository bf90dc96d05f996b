//! Control plane error surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced through the control plane.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The transcription provider could not be reached; 503.
    #[error("{0}")]
    Unavailable(String),

    /// No active session for the addressed room; 404.
    #[error("{0}")]
    NotFound(String),

    /// The request itself is invalid; 400.
    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProviderError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
            ProviderError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProviderError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
