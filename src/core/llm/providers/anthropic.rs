use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::agent::ProviderConfig;
use crate::core::error::ChatError;
use crate::core::llm::providers::{Turn, orphan_result_text, pair_tool_turns};
use crate::core::llm::{ChatCompleter, Response, ToolChoice, ToolSpecification};
use crate::core::memory::{Message, Role, ToolCall};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Thinking and other block kinds the engine has no use for.
    #[serde(other)]
    Other,
}

#[derive(Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<Block>,
}

/// Messages API adapter.
pub struct AnthropicCompleter {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

impl AnthropicCompleter {
    pub fn new(client: Client, base_url: String, api_key: String, provider: &ProviderConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            api_key,
            model: provider.model.clone(),
            temperature: provider.temperature,
            top_p: provider.top_p,
        }
    }
}

/// System messages move to the top-level `system` field. Consecutive turns of
/// one role merge into a single message since the API requires alternation.
fn to_wire_messages(messages: &[Message]) -> (Option<String>, Vec<WireMessage>) {
    let mut system = Vec::new();
    let mut out: Vec<WireMessage> = Vec::new();

    for turn in pair_tool_turns(messages, "toolu_") {
        let (role, block) = match turn {
            Turn::Plain(message) if message.role == Role::System => {
                system.push(message.content.clone());
                continue;
            }
            // Empty text blocks are rejected upstream.
            Turn::Plain(message) if message.content.is_empty() => continue,
            Turn::Plain(message) => (
                if message.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                Block::Text {
                    text: message.content.clone(),
                },
            ),
            Turn::Call { id, call } => (
                "assistant",
                Block::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        json!({})
                    },
                },
            ),
            Turn::Result { id, content, .. } => (
                "user",
                Block::ToolResult {
                    tool_use_id: id,
                    content: content.to_string(),
                },
            ),
            Turn::OrphanResult(message) => (
                "user",
                Block::Text {
                    text: orphan_result_text(message),
                },
            ),
        };
        match out.last_mut() {
            Some(last) if last.role == role => last.content.push(block),
            _ => out.push(WireMessage {
                role,
                content: vec![block],
            }),
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

fn wire_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Function(name) => json!({"type": "tool", "name": name}),
    }
}

fn normalize_reply(parsed: MessagesResponse) -> Result<Response, ChatError> {
    let mut text = Vec::new();
    for block in parsed.content {
        match block {
            // Only the first tool call is honored.
            Block::ToolUse { name, input, .. } => {
                return Ok(Response::ToolCall(ToolCall {
                    name,
                    arguments: if input.is_null() { json!({}) } else { input },
                }));
            }
            Block::Text { text: t } => text.push(t),
            _ => {}
        }
    }
    if text.is_empty() {
        return Err(ChatError::Malformed(
            "response had neither text nor tool_use blocks".to_string(),
        ));
    }
    Ok(Response::Text {
        content: text.concat(),
    })
}

#[async_trait]
impl ChatCompleter for AnthropicCompleter {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpecification],
        tool_choice: &ToolChoice,
    ) -> Result<Response, ChatError> {
        let wire_tools: Vec<WireTool<'_>> = tools
            .iter()
            .map(|t| WireTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.parameters,
            })
            .collect();
        let tool_choice = if wire_tools.is_empty() {
            None
        } else {
            Some(wire_tool_choice(tool_choice))
        };
        let (system, wire_messages) = to_wire_messages(messages);

        let req = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: wire_messages,
            tools: wire_tools,
            tool_choice,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        debug!(
            "POST {} model={} messages={} tools={}",
            self.endpoint,
            self.model,
            req.messages.len(),
            req.tools.len()
        );
        let res = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ChatError::Provider {
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        let parsed: MessagesResponse = res
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))?;
        normalize_reply(parsed)
    }
}
