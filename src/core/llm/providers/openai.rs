use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::agent::ProviderConfig;
use crate::core::error::ChatError;
use crate::core::llm::providers::{Turn, decode_arguments, orphan_result_text, pair_tool_turns};
use crate::core::llm::{ChatCompleter, Response, ToolChoice, ToolSpecification};
use crate::core::memory::{Message, Role, ToolCall};

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReply,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

/// Chat-completions adapter for OpenAI and API-compatible servers.
pub struct OpenAiCompleter {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

impl OpenAiCompleter {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: Option<String>,
        provider: &ProviderConfig,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: provider.model.clone(),
            temperature: provider.temperature,
            top_p: provider.top_p,
        }
    }
}

/// Each placeholder becomes an assistant `tool_calls` entry and its result a
/// `tool` message carrying the same call id.
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    pair_tool_turns(messages, "call_")
        .into_iter()
        .map(|turn| match turn {
            Turn::Plain(message) => WireMessage {
                role: message.role.as_str(),
                content: Some(message.content.clone()),
                name: if message.role == Role::User {
                    message.name.clone()
                } else {
                    None
                },
                tool_call_id: None,
                tool_calls: None,
            },
            Turn::Call { id, call } => WireMessage {
                role: "assistant",
                content: None,
                name: None,
                tool_call_id: None,
                tool_calls: Some(vec![WireToolCall {
                    id,
                    kind: function_kind(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                }]),
            },
            Turn::Result { id, content, .. } => tool_message(id, content.to_string()),
            Turn::OrphanResult(message) => WireMessage {
                role: "user",
                content: Some(orphan_result_text(message)),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            },
        })
        .collect()
}

fn tool_message(id: String, content: String) -> WireMessage {
    WireMessage {
        role: "tool",
        content: Some(content),
        name: None,
        tool_call_id: Some(id),
        tool_calls: None,
    }
}

fn wire_tool_choice(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Required => serde_json::json!("required"),
        ToolChoice::Function(name) => {
            serde_json::json!({ "type": "function", "function": { "name": name } })
        }
    }
}

fn normalize_reply(parsed: ChatCompletionResponse) -> Result<Response, ChatError> {
    let reply = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::Malformed("response contained no choices".to_string()))?
        .message;

    // Only the first tool call is honored.
    if let Some(call) = reply.tool_calls.into_iter().next() {
        return Ok(Response::ToolCall(ToolCall {
            name: call.function.name,
            arguments: decode_arguments(serde_json::Value::String(call.function.arguments)),
        }));
    }

    match reply.content {
        Some(content) => Ok(Response::Text { content }),
        None => Err(ChatError::Malformed(
            "response had neither content nor tool calls".to_string(),
        )),
    }
}

#[async_trait]
impl ChatCompleter for OpenAiCompleter {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpecification],
        tool_choice: &ToolChoice,
    ) -> Result<Response, ChatError> {
        let wire_tools: Vec<WireTool<'_>> = tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect();
        let tool_choice = if wire_tools.is_empty() {
            None
        } else {
            Some(wire_tool_choice(tool_choice))
        };

        let req = ChatCompletionRequest {
            model: &self.model,
            messages: to_wire_messages(messages),
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
        let mut builder = self.client.post(&self.endpoint).json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let res = builder.send().await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ChatError::Provider {
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        let parsed: ChatCompletionResponse = res
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))?;
        normalize_reply(parsed)
    }
}
