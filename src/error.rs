//! Error types for genia-relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Main error type for genia-relay.
///
/// Only `InvalidRequest` ever reaches a chat caller; provider failures are
/// absorbed by the fallback relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "genia_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
