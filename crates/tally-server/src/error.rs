//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tally_common::TallyError;
use tracing::error;

/// A [`TallyError`] rendered as `{"status":"error","message":...}`
#[derive(Debug)]
pub struct ApiError(pub TallyError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TallyError::Validation(_) | TallyError::UnknownAggregationKind(_) => StatusCode::BAD_REQUEST,
            TallyError::AlreadyExists(_) => StatusCode::CONFLICT,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({ "status": "error", "message": self.0.to_string() }));
        (status, body).into_response()
    }
}
