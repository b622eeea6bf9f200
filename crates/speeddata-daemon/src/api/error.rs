//! Control API errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::storage::DatabaseError;
use crate::supervisor::SupervisorError;

/// A failed request. Each variant carries the JSON body sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(Value),

    #[error("not found: {0}")]
    NotFound(Value),

    #[error("conflict: {0}")]
    Conflict(Value),

    #[error("internal error: {0}")]
    Internal(Value),
}

impl ApiError {
    pub fn bad_request(message: &str) -> Self {
        Self::BadRequest(json!({ "error": message }))
    }

    pub fn channel_not_found(name: &str) -> Self {
        Self::NotFound(json!({ "error": "Channel not found", "name": name }))
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(json!({ "error": format!("{what} not found") })),
            other => Self::Internal(json!({
                "error": "Registry failure",
                "details": other.to_string(),
            })),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self::Internal(json!({
            "error": "Supervisor failure",
            "details": e.to_string(),
        }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Request failed");
        }
        let body = match self {
            Self::BadRequest(b) | Self::NotFound(b) | Self::Conflict(b) | Self::Internal(b) => b,
        };
        (status, Json(body)).into_response()
    }
}
