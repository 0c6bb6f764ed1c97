use std::collections::HashSet;

use super::{AgentDefinition, COLLECTION_EVENT_TYPES, SessionScope, TriggerSpec};
use crate::core::error::ValidationErrors;
use crate::core::tools::ArgumentSchema;

/// Converts a standard 5-field cron expression into the seconds-first form the
/// scheduler expects. Returns `None` when the field count is wrong.
pub fn normalize_cron(expression: &str) -> Option<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    Some(format!("0 {}", fields.join(" ")))
}

fn check_cron(expression: &str) -> Result<(), String> {
    let normalized = normalize_cron(expression)
        .ok_or_else(|| "cron expression must have exactly 5 fields".to_string())?;
    tokio_cron_scheduler::Job::new_async(normalized.as_str(), |_uuid, _l| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression: {}", e))
}

pub fn validate_agent(def: &AgentDefinition) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::default();

    if def.id.trim().is_empty() {
        errs.push("id", "is required");
    } else if def.id.chars().any(char::is_control) {
        errs.push("id", "must not contain control characters");
    }
    if def.name.trim().is_empty() {
        errs.push("name", "is required");
    }
    if def.system_prompt.trim().is_empty() {
        errs.push("system_prompt", "is required");
    }
    if def.max_turns <= 0 {
        errs.push("max_turns", "must be greater than 0");
    }
    if def.provider.kind.trim().is_empty() {
        errs.push("provider.kind", "is required");
    }
    if def.provider.model.trim().is_empty() {
        errs.push("provider.model", "is required");
    }
    if def.memory.session_scope == SessionScope::Namespace && def.memory.namespace.is_empty() {
        errs.push(
            "memory.namespace",
            "is required when session_scope is namespace",
        );
    }
    if def.memory.namespace.chars().any(char::is_control) {
        errs.push("memory.namespace", "must not contain control characters");
    }

    match &def.trigger {
        TriggerSpec::Manual => {}
        TriggerSpec::Cron { expression } => {
            if expression.trim().is_empty() {
                errs.push("trigger.expression", "is required for cron triggers");
            } else if let Err(msg) = check_cron(expression) {
                errs.push("trigger.expression", msg);
            }
        }
        TriggerSpec::Webhook { token } => {
            if token.is_empty() {
                errs.push("trigger.token", "is required for webhook triggers");
            }
        }
        TriggerSpec::CollectionEvent { collection, events } => {
            if collection.trim().is_empty() {
                errs.push("trigger.collection", "is required for collection triggers");
            }
            if events.is_empty() {
                errs.push("trigger.events", "must list at least one event type");
            }
            for event in events {
                if !COLLECTION_EVENT_TYPES.contains(&event.as_str()) {
                    errs.push("trigger.events", format!("unknown event type '{}'", event));
                }
            }
        }
    }

    let mut names = HashSet::new();
    let mut keys = HashSet::new();
    for (i, func) in def.functions.iter().enumerate() {
        let field = |suffix: &str| format!("functions[{}].{}", i, suffix);

        if !func.implementation_key.is_empty() && !keys.insert(func.implementation_key.as_str()) {
            errs.push(field("implementation_key"), "duplicate function implementation key");
        }
        if !func.name.is_empty() && !names.insert(func.name.as_str()) {
            errs.push(field("name"), "duplicate function name");
        }
        if func.name.trim().is_empty() {
            errs.push(field("name"), "is required");
        }
        if func.implementation_key.trim().is_empty() {
            errs.push(field("implementation_key"), "is required");
        }
        check_parameters(&func.parameters, &field("parameters"), &mut errs);
    }

    errs.into_result()
}

// Parameters may arrive as an inline object or as a JSON-encoded string, and
// must compile as a JSON schema.
fn check_parameters(params: &serde_json::Value, field: &str, errs: &mut ValidationErrors) {
    let parsed = match params {
        serde_json::Value::Null => return errs.push(field, "is required"),
        serde_json::Value::String(raw) if raw.trim().is_empty() => {
            return errs.push(field, "is required");
        }
        serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            Ok(_) => return errs.push(field, "must be a JSON object"),
            Err(e) => return errs.push(field, format!("invalid JSON: {}", e)),
        },
        serde_json::Value::Object(map) if map.is_empty() => {
            return errs.push(field, "must not be empty");
        }
        value @ serde_json::Value::Object(_) => value.clone(),
        _ => return errs.push(field, "must be a JSON object"),
    };
    if let Err(msg) = ArgumentSchema::compile(&parsed) {
        errs.push(field, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::{ToolSpec, test_agent};
    use serde_json::json;

    fn tool(name: &str, key: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
            implementation_key: key.into(),
        }
    }

    #[test]
    fn normalize_cron_prefixes_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *").as_deref(), Some("0 */5 * * * *"));
        assert_eq!(normalize_cron("0 9 * * 1-5").as_deref(), Some("0 0 9 * * 1-5"));
        assert!(normalize_cron("0 0 9 * * *").is_none());
        assert!(normalize_cron("").is_none());
    }

    #[test]
    fn accepts_valid_definition() {
        let mut def = test_agent("ok");
        def.functions = vec![tool("log", "system.log")];
        assert!(validate_agent(&def).is_ok());
    }

    #[test]
    fn reports_every_missing_field() {
        let mut def = test_agent("");
        def.name.clear();
        def.system_prompt.clear();
        def.max_turns = -1;
        let errs = validate_agent(&def).unwrap_err();
        let fields: Vec<&str> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "name", "system_prompt", "max_turns"]);
    }

    #[tokio::test]
    async fn rejects_invalid_cron_at_validation() {
        let mut def = test_agent("cron");
        def.trigger = TriggerSpec::Cron {
            expression: "every day".into(),
        };
        let errs = validate_agent(&def).unwrap_err();
        assert_eq!(errs.0[0].field, "trigger.expression");

        def.trigger = TriggerSpec::Cron {
            expression: "61 * * * *".into(),
        };
        assert!(validate_agent(&def).is_err());

        def.trigger = TriggerSpec::Cron {
            expression: "30 2 * * *".into(),
        };
        assert!(validate_agent(&def).is_ok());
    }

    #[test]
    fn webhook_trigger_requires_token() {
        let mut def = test_agent("hook");
        def.trigger = TriggerSpec::Webhook {
            token: String::new(),
        };
        let errs = validate_agent(&def).unwrap_err();
        assert_eq!(errs.0[0].field, "trigger.token");
    }

    #[test]
    fn control_characters_are_rejected_in_keys() {
        let mut def = test_agent("a\u{1f}b");
        def.memory.namespace = "team\nops".into();
        let errs = validate_agent(&def).unwrap_err();
        let fields: Vec<&str> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "memory.namespace"]);
        assert_eq!(errs.0[0].message, "must not contain control characters");

        let mut def = test_agent("unicode-ok-é");
        def.memory.namespace = "team ops".into();
        assert!(validate_agent(&def).is_ok());
    }

    #[test]
    fn duplicate_functions_are_rejected() {
        let mut def = test_agent("dups");
        def.functions = vec![
            tool("log", "system.log"),
            tool("log", "collections.list"),
            tool("other", "system.log"),
        ];
        let errs = validate_agent(&def).unwrap_err();
        let messages: Vec<&str> = errs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["duplicate function name", "duplicate function implementation key"]
        );
    }

    #[test]
    fn parameters_must_be_non_empty_json_objects() {
        let mut def = test_agent("params");
        let mut bad = tool("a", "system.log");
        bad.parameters = json!("{not json");
        let mut empty = tool("b", "collections.list");
        empty.parameters = json!({});
        let mut encoded = tool("c", "collections.get_schema");
        encoded.parameters = json!("{\"type\":\"object\"}");
        let mut broken = tool("d", "collections.get_item");
        broken.parameters = json!({"type": 12});
        def.functions = vec![bad, empty, encoded, broken];

        let errs = validate_agent(&def).unwrap_err();
        assert_eq!(errs.0.len(), 3);
        assert!(errs.0[0].message.starts_with("invalid JSON"));
        assert_eq!(errs.0[1].message, "must not be empty");
        assert_eq!(errs.0[2].field, "functions[3].parameters");
        assert!(errs.0[2].message.starts_with("invalid JSON schema"));
    }

    #[test]
    fn unknown_collection_event_is_rejected() {
        let mut def = test_agent("events");
        def.trigger = TriggerSpec::CollectionEvent {
            collection: "orders".into(),
            events: vec!["item:exploded".into()],
        };
        assert!(validate_agent(&def).is_err());
    }
}
