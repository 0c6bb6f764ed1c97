pub mod providers;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::core::agent::ProviderConfig;
use crate::core::error::{
    ChatError, EngineError, EngineResult, ValidationError, ValidationErrors,
};
use crate::core::memory::{Message, ToolCall};

pub use providers::anthropic::AnthropicCompleter;
pub use providers::ollama::OllamaCompleter;
pub use providers::openai::OpenAiCompleter;

/// What the model is told it may call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Function(String),
}

impl ToolChoice {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some("auto") => ToolChoice::Auto,
            Some("none") => ToolChoice::None,
            Some("required") | Some("any") => ToolChoice::Required,
            Some(name) => ToolChoice::Function(name.to_string()),
        }
    }
}

/// A model reply normalized across providers. Exactly one tool call per
/// response; adapters drop any extra calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text { content: String },
    ToolCall(ToolCall),
}

#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSpecification],
        tool_choice: &ToolChoice,
    ) -> Result<Response, ChatError>;
}

/// Builds a completer for an agent's provider configuration.
pub trait CompleterFactory: Send + Sync {
    fn build(&self, provider: &ProviderConfig) -> EngineResult<Arc<dyn ChatCompleter>>;

    /// Problems with `provider` that would make `build` fail, reported
    /// against the definition's fields at registration.
    fn check(&self, provider: &ProviderConfig) -> Result<(), ValidationErrors> {
        self.build(provider)
            .map(|_| ())
            .map_err(|e| ValidationErrors::single("provider", e.to_string()))
    }
}

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

struct Endpoint {
    base_url: String,
    api_key: Option<String>,
}

/// A provider configuration with its endpoint and credentials settled.
enum Resolved {
    OpenAi { base_url: String, api_key: Option<String> },
    Anthropic { base_url: String, api_key: String },
    Ollama { base_url: String, api_key: Option<String> },
}

/// Default factory. Supports `openai`, `openai-compatible`, `anthropic` and
/// `ollama` over HTTP.
pub struct ProviderFactory {
    openai: Endpoint,
    anthropic: Endpoint,
    ollama_base_url: String,
    client: reqwest::Client,
}

impl ProviderFactory {
    pub fn new(default_api_key: Option<String>, default_base_url: String) -> Self {
        Self {
            openai: Endpoint {
                base_url: default_base_url,
                api_key: default_api_key,
            },
            anthropic: Endpoint {
                base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
                api_key: None,
            },
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_anthropic(mut self, api_key: Option<String>, base_url: String) -> Self {
        self.anthropic = Endpoint { base_url, api_key };
        self
    }

    pub fn with_ollama(mut self, base_url: String) -> Self {
        self.ollama_base_url = base_url;
        self
    }

    /// The variable named by `api_key_ref` wins over the configured default.
    fn resolve_api_key(provider: &ProviderConfig, default: Option<&String>) -> Option<String> {
        provider
            .api_key_ref
            .as_deref()
            .filter(|r| !r.is_empty())
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| default.cloned())
            .filter(|k| !k.is_empty())
    }

    fn resolve(&self, provider: &ProviderConfig) -> Result<Resolved, ValidationError> {
        let base_url = |default: &str| {
            provider
                .base_url
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        match provider.kind.as_str() {
            "openai" => {
                let api_key = Self::resolve_api_key(provider, self.openai.api_key.as_ref())
                    .ok_or_else(|| {
                        ValidationError::new(
                            "provider.api_key_ref",
                            "openai provider requires an API key",
                        )
                    })?;
                Ok(Resolved::OpenAi {
                    base_url: base_url(&self.openai.base_url),
                    api_key: Some(api_key),
                })
            }
            "openai-compatible" => {
                let base_url = provider
                    .base_url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ValidationError::new(
                            "provider.base_url",
                            "openai-compatible provider requires base_url",
                        )
                    })?;
                Ok(Resolved::OpenAi {
                    base_url,
                    api_key: Self::resolve_api_key(provider, self.openai.api_key.as_ref()),
                })
            }
            "anthropic" => {
                let api_key = Self::resolve_api_key(provider, self.anthropic.api_key.as_ref())
                    .ok_or_else(|| {
                        ValidationError::new(
                            "provider.api_key_ref",
                            "anthropic provider requires an API key",
                        )
                    })?;
                Ok(Resolved::Anthropic {
                    base_url: base_url(&self.anthropic.base_url),
                    api_key,
                })
            }
            "ollama" => Ok(Resolved::Ollama {
                base_url: base_url(&self.ollama_base_url),
                api_key: Self::resolve_api_key(provider, None),
            }),
            other => Err(ValidationError::new(
                "provider.kind",
                format!("unsupported provider type: {}", other),
            )),
        }
    }
}

impl CompleterFactory for ProviderFactory {
    fn build(&self, provider: &ProviderConfig) -> EngineResult<Arc<dyn ChatCompleter>> {
        let resolved = self
            .resolve(provider)
            .map_err(|e| EngineError::Setup(e.message))?;
        info!(
            "Building {} completer for model {}",
            provider.kind, provider.model
        );
        let client = self.client.clone();
        Ok(match resolved {
            Resolved::OpenAi { base_url, api_key } => {
                Arc::new(OpenAiCompleter::new(client, base_url, api_key, provider))
            }
            Resolved::Anthropic { base_url, api_key } => {
                Arc::new(AnthropicCompleter::new(client, base_url, api_key, provider))
            }
            Resolved::Ollama { base_url, api_key } => {
                Arc::new(OllamaCompleter::new(client, base_url, api_key, provider))
            }
        })
    }

    fn check(&self, provider: &ProviderConfig) -> Result<(), ValidationErrors> {
        self.resolve(provider)
            .map(|_| ())
            .map_err(|e| ValidationErrors(vec![e]))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order and records every request it saw.
    pub(crate) struct ScriptedCompleter {
        script: Mutex<VecDeque<Result<Response, String>>>,
        fallback: Option<Response>,
        pub(crate) calls: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedCompleter {
        pub(crate) fn new(script: Vec<Response>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().map(Ok).collect()),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Returns `response` forever.
        pub(crate) fn always(response: Response) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(response),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(message: &str) -> Self {
            let mut script = VecDeque::new();
            script.push_back(Err(message.to_string()));
            Self {
                script: Mutex::new(script),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatCompleter for ScriptedCompleter {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[ToolSpecification],
            _tool_choice: &ToolChoice,
        ) -> Result<Response, ChatError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(ChatError::Malformed(message)),
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| ChatError::Malformed("script exhausted".to_string())),
            }
        }
    }

    pub(crate) struct FixedFactory(pub(crate) Arc<dyn ChatCompleter>);

    impl CompleterFactory for FixedFactory {
        fn build(&self, _provider: &ProviderConfig) -> EngineResult<Arc<dyn ChatCompleter>> {
            Ok(self.0.clone())
        }
    }
}
