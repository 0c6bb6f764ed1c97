use axum::{Json, extract::State};

use super::super::AppState;
use super::ApiError;
use crate::core::queue::QueueStats;

pub async fn get_job_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.engine.queue_stats().await?))
}
