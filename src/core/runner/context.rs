use serde_json::Value;

use crate::core::queue::{EventKind, JobPayload};

pub const ACTIVATION_FALLBACK: &str =
    "You have been activated. Please execute your task according to your system prompt.";

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Turns a job's trigger event into the first user turn of the run.
pub fn contextual_input(payload: &JobPayload) -> String {
    if let Some(event) = &payload.trigger_event {
        match event.kind {
            EventKind::CollectionEvent => {
                if let Some(data) = &event.collection_event {
                    return format!(
                        "An event has occurred. Here is the data:\n\n\
                         Event Type: {}\n\
                         Collection: {}\n\
                         Item ID: {}\n\n\
                         Item Data:\n```json\n{}\n```\n\n\
                         Based on your instructions, you must now call the appropriate function to handle this event.",
                        data.event,
                        data.collection,
                        data.item_id,
                        pretty(&data.item_data)
                    );
                }
            }
            EventKind::Webhook => {
                if let Some(data) = &event.webhook_data {
                    return format!(
                        "A webhook has been received. Here is the payload:\n\n\
                         ```json\n{}\n```\n\n\
                         Based on your instructions, you must now call the appropriate function to process this webhook.",
                        pretty(data)
                    );
                }
            }
            EventKind::Schedule | EventKind::Manual => {}
        }
    }

    if payload.initial_input.trim().is_empty() {
        ACTIVATION_FALLBACK.to_string()
    } else {
        payload.initial_input.clone()
    }
}
