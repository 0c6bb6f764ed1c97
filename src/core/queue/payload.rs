use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The durable unit handed from a trigger to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub agent_id: String,
    #[serde(default)]
    pub initial_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<TriggerEvent>,
    pub created_at: DateTime<Utc>,
}

impl JobPayload {
    pub fn new(agent_id: impl Into<String>, initial_input: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            initial_input: initial_input.into(),
            trigger_event: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_event(mut self, event: TriggerEvent) -> Self {
        self.trigger_event = Some(event);
        self
    }

    /// The trigger kind used for session derivation; payloads without an
    /// event count as manual runs.
    pub fn trigger_kind(&self) -> &'static str {
        self.trigger_event
            .as_ref()
            .map(|e| e.kind.trigger_kind())
            .unwrap_or("manual")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CollectionEvent,
    Webhook,
    Schedule,
    Manual,
}

impl EventKind {
    /// Maps onto the agent trigger vocabulary (`cron`, `webhook`, ...).
    pub fn trigger_kind(&self) -> &'static str {
        match self {
            EventKind::CollectionEvent => "collection_event",
            EventKind::Webhook => "webhook",
            EventKind::Schedule => "cron",
            EventKind::Manual => "manual",
        }
    }
}

/// A trigger firing with whatever structured data came with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_event: Option<CollectionEventData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            collection_event: None,
            webhook_data: None,
            schedule_data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn webhook(payload: Value) -> Self {
        Self {
            webhook_data: Some(payload),
            ..Self::bare(EventKind::Webhook)
        }
    }

    pub fn schedule(expression: &str) -> Self {
        Self {
            schedule_data: Some(serde_json::json!({ "expression": expression })),
            ..Self::bare(EventKind::Schedule)
        }
    }

    pub fn manual() -> Self {
        Self::bare(EventKind::Manual)
    }

    pub fn collection(data: CollectionEventData) -> Self {
        Self {
            collection_event: Some(data),
            ..Self::bare(EventKind::CollectionEvent)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEventData {
    pub collection: String,
    pub event: String,
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub item_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_type_tag() {
        let payload = JobPayload::new("a1", "").with_event(TriggerEvent::webhook(json!({"x": 1})));
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["agent_id"], "a1");
        assert_eq!(wire["trigger_event"]["type"], "webhook");
        assert_eq!(wire["trigger_event"]["webhook_data"]["x"], 1);
        assert!(wire["trigger_event"].get("collection_event").is_none());

        let back: JobPayload = serde_json::from_value(wire).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn trigger_kind_follows_event() {
        assert_eq!(JobPayload::new("a", "hi").trigger_kind(), "manual");
        let scheduled = JobPayload::new("a", "").with_event(TriggerEvent::schedule("0 * * * * *"));
        assert_eq!(scheduled.trigger_kind(), "cron");
    }
}
