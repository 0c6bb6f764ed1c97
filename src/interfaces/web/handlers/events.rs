use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::super::AppState;
use super::bad_request;
use crate::core::agent::COLLECTION_EVENT_TYPES;
use crate::core::queue::CollectionEventData;

/// Fans a data-layer event out to every subscribed agent.
pub async fn collection_event_endpoint(
    State(state): State<AppState>,
    Json(event): Json<CollectionEventData>,
) -> Response {
    if event.collection.trim().is_empty() {
        return bad_request("collection is required");
    }
    if !COLLECTION_EVENT_TYPES.contains(&event.event.as_str()) {
        return bad_request("unknown event type");
    }
    let job_ids = state.engine.dispatch_collection_event(&event).await;
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_ids": job_ids })),
    )
        .into_response()
}
