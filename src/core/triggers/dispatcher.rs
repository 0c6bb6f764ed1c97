use tracing::{info, warn};

use crate::core::agent::AgentRegistry;
use crate::core::queue::{CollectionEventData, JobPayload, JobQueue, TriggerEvent};

/// Enqueues one job for every enabled agent subscribed to this collection and
/// event type. A failed enqueue for one agent does not stop the others.
pub async fn dispatch_collection_event(
    registry: &AgentRegistry,
    queue: &dyn JobQueue,
    event: &CollectionEventData,
) -> Vec<String> {
    let subscribers: Vec<_> = registry
        .list()
        .await
        .into_iter()
        .filter(|a| a.enabled && a.trigger.subscribes_to(&event.collection, &event.event))
        .collect();

    if subscribers.is_empty() {
        info!(
            "No agents subscribed to '{}' on collection '{}'",
            event.event, event.collection
        );
        return Vec::new();
    }
    info!(
        "Found {} agent(s) subscribed to '{}' on collection '{}'",
        subscribers.len(),
        event.event,
        event.collection
    );

    let mut job_ids = Vec::with_capacity(subscribers.len());
    for agent in subscribers {
        let payload =
            JobPayload::new(agent.id.clone(), "").with_event(TriggerEvent::collection(event.clone()));
        match queue.enqueue(&payload).await {
            Ok(id) => job_ids.push(id),
            Err(e) => warn!("Failed to enqueue collection event for agent {}: {}", agent.id, e),
        }
    }
    job_ids
}
