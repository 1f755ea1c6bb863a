use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::OesError;

/// Structured error body: every failed request carries a stable code and a
/// human-readable detail.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: String,
}

impl IntoResponse for OesError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error surfaced to client: {}", self);
        }
        let body = ErrorBody {
            detail: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
