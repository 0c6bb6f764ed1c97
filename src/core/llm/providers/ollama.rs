use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::agent::ProviderConfig;
use crate::core::error::ChatError;
use crate::core::llm::providers::{Turn, decode_arguments, orphan_result_text, pair_tool_turns};
use crate::core::llm::{ChatCompleter, Response, ToolChoice, ToolSpecification};
use crate::core::memory::{Message, ToolCall};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
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
    parameters: &'a Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<WireReply>,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

/// Adapter for a local Ollama server's non-streaming chat endpoint.
pub struct OllamaCompleter {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

impl OllamaCompleter {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: Option<String>,
        provider: &ProviderConfig,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            api_key,
            model: provider.model.clone(),
            temperature: provider.temperature,
            top_p: provider.top_p,
        }
    }

    fn options(&self) -> Option<WireOptions> {
        if self.temperature.is_none() && self.top_p.is_none() {
            return None;
        }
        Some(WireOptions {
            temperature: self.temperature,
            top_p: self.top_p,
        })
    }
}

/// Ollama has no call ids; a result is tied to its call by position and
/// `tool_name`.
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    pair_tool_turns(messages, "")
        .into_iter()
        .map(|turn| match turn {
            Turn::Plain(message) => WireMessage {
                role: message.role.as_str(),
                content: message.content.clone(),
                tool_calls: None,
                tool_name: None,
            },
            Turn::Call { call, .. } => WireMessage {
                role: "assistant",
                content: String::new(),
                tool_calls: Some(vec![WireToolCall {
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                }]),
                tool_name: None,
            },
            Turn::Result { name, content, .. } => WireMessage {
                role: "tool",
                content: content.to_string(),
                tool_calls: None,
                tool_name: Some(name.to_string()),
            },
            Turn::OrphanResult(message) => WireMessage {
                role: "user",
                content: orphan_result_text(message),
                tool_calls: None,
                tool_name: None,
            },
        })
        .collect()
}

fn normalize_reply(parsed: ChatResponse) -> Result<Response, ChatError> {
    let reply = parsed
        .message
        .ok_or_else(|| ChatError::Malformed("response contained no message".to_string()))?;

    if let Some(call) = reply.tool_calls.into_iter().next() {
        return Ok(Response::ToolCall(ToolCall {
            name: call.function.name,
            arguments: decode_arguments(call.function.arguments),
        }));
    }
    Ok(Response::Text {
        content: reply.content,
    })
}

#[async_trait]
impl ChatCompleter for OllamaCompleter {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpecification],
        tool_choice: &ToolChoice,
    ) -> Result<Response, ChatError> {
        // The endpoint has no tool_choice; "none" is expressed by sending no tools.
        let wire_tools: Vec<WireTool<'_>> = if *tool_choice == ToolChoice::None {
            Vec::new()
        } else {
            tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect()
        };

        let req = ChatRequest {
            model: &self.model,
            messages: to_wire_messages(messages),
            tools: wire_tools,
            stream: false,
            options: self.options(),
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
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| ChatError::Malformed(e.to_string()))?;
        normalize_reply(parsed)
    }
}
