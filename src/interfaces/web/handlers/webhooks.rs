use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, info};

use super::super::AppState;
use super::{ApiError, bad_request};

pub const WEBHOOK_TOKEN_HEADER: &str = "webhook-token";

/// `POST /agents/webhook/{agent_id}`. Authenticates before looking at the
/// body and answers as soon as the job is queued.
pub async fn webhook_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    let agent = match state.engine.authorize_webhook(&agent_id, token).await {
        Ok(agent) => agent,
        Err(e) => return ApiError(e).into_response(),
    };

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => return bad_request("Invalid JSON payload"),
    };

    match state.engine.enqueue_webhook(&agent, payload).await {
        Ok(job_id) => {
            info!("Webhook for agent {} queued as job {}", agent_id, job_id);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "Job accepted for processing" })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to enqueue webhook job for agent {}: {}", agent_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to process webhook" })),
            )
                .into_response()
        }
    }
}
