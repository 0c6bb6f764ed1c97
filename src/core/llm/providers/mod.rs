pub mod anthropic;
pub mod ollama;
pub mod openai;

use crate::core::memory::{Message, Role, ToolCall};

pub(crate) const MISSING_TOOL_RESULT: &str =
    r#"{"status":"error","message":"no tool result was recorded"}"#;

/// A stored message as the chat protocols see it, with each assistant
/// placeholder paired to the tool result that follows it.
#[derive(Debug, PartialEq)]
pub(crate) enum Turn<'a> {
    Plain(&'a Message),
    Call { id: String, call: &'a ToolCall },
    Result { id: String, name: &'a str, content: &'a str },
    /// A tool result with no call before it.
    OrphanResult(&'a Message),
}

/// Call ids are synthetic (`{prefix}1`, `{prefix}2`, ...). A call that is not
/// followed by its result gets an error result so the protocol stays valid.
pub(crate) fn pair_tool_turns<'a>(messages: &'a [Message], id_prefix: &str) -> Vec<Turn<'a>> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending: Option<(String, &'a str)> = None;
    let mut next_id = 0usize;

    for message in messages {
        if message.role != Role::Tool
            && let Some((id, name)) = pending.take()
        {
            out.push(Turn::Result {
                id,
                name,
                content: MISSING_TOOL_RESULT,
            });
        }

        match (message.role, &message.tool_call) {
            (Role::Assistant, Some(call)) => {
                next_id += 1;
                let id = format!("{}{}", id_prefix, next_id);
                out.push(Turn::Call {
                    id: id.clone(),
                    call,
                });
                pending = Some((id, call.name.as_str()));
            }
            (Role::Tool, _) => match pending.take() {
                Some((id, name)) => out.push(Turn::Result {
                    id,
                    name: message.name.as_deref().unwrap_or(name),
                    content: &message.content,
                }),
                None => out.push(Turn::OrphanResult(message)),
            },
            _ => out.push(Turn::Plain(message)),
        }
    }
    if let Some((id, name)) = pending {
        out.push(Turn::Result {
            id,
            name,
            content: MISSING_TOOL_RESULT,
        });
    }
    out
}

/// Replays a tool result that lost its call as plain user text.
pub(crate) fn orphan_result_text(message: &Message) -> String {
    format!(
        "Result of tool {}: {}",
        message.name.as_deref().unwrap_or("unknown"),
        message.content
    )
}

/// Tool arguments arrive either as an object or as a JSON-encoded string.
pub(crate) fn decode_arguments(raw: serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) if s.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    }
}
