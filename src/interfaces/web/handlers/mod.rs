pub mod agents;
pub mod events;
pub mod jobs;
pub mod memory;
pub mod webhooks;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::core::error::{EngineError, MemoryError};

/// Maps engine errors onto HTTP statuses. Validation failures carry their
/// field list.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            EngineError::Config(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "error": "invalid agent definition", "fields": errors }),
            ),
            EngineError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": "Agent not found" }),
            ),
            EngineError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "Unauthorized" }),
            ),
            EngineError::Disabled(_) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": "Agent is disabled" }),
            ),
            EngineError::Memory(e @ MemoryError::InvalidKey(_)) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": e.to_string() }),
            ),
            other => {
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": other.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
