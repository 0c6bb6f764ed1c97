use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::super::AppState;
use super::{ApiError, bad_request};
use crate::core::agent::AgentDefinition;

pub async fn get_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents = state.engine.list_agents().await;
    let agents: Vec<&AgentDefinition> = agents.iter().map(|a| a.as_ref()).collect();
    Json(serde_json::json!({ "agents": agents }))
}

pub async fn get_agent(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<AgentDefinition>, ApiError> {
    let agent = state.engine.get_agent(&agent_id).await?;
    Ok(Json(agent.as_ref().clone()))
}

/// Registers or replaces a definition; field errors come back as 422.
pub async fn create_agent_endpoint(
    State(state): State<AppState>,
    Json(def): Json<AgentDefinition>,
) -> Result<Response, ApiError> {
    let agent = state.engine.register_agent(def).await?;
    Ok((StatusCode::CREATED, Json(agent.as_ref().clone())).into_response())
}

pub async fn delete_agent_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.unregister_agent(&agent_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    input: String,
}

/// Manual activation through the queue.
pub async fn run_agent_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let input = if body.is_empty() {
        String::new()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(r) => r.input,
            Err(_) => return Ok(bad_request("Invalid JSON payload")),
        }
    };
    let job_id = state.engine.enqueue_manual(&agent_id, &input).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id })),
    )
        .into_response())
}
