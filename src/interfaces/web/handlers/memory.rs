use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::super::AppState;
use super::ApiError;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    limit: i64,
}

/// `limit` omitted or <= 0 returns the whole session.
pub async fn get_session_messages(
    Path((agent_id, session_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = state
        .engine
        .history(&agent_id, &session_id, query.limit)
        .await?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "session_id": session_id,
        "messages": messages,
    })))
}
