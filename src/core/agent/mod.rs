mod registry;
mod session;
mod validation;

pub use registry::{AgentRegistry, load_definitions};
pub use session::session_for;
pub use validation::{normalize_cron, validate_agent};

use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, EngineResult};

pub const DEFAULT_MAX_TURNS: i64 = 4;
pub const DEFAULT_HISTORY_WINDOW: i64 = 100;

pub const COLLECTION_EVENT_TYPES: &[&str] = &[
    "item:created",
    "item:updated",
    "item:deleted",
    "collection:created",
    "collection:updated",
    "collection:deleted",
];

/// Declarative definition of a bounded tool-calling conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub max_turns: i64,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub functions: Vec<ToolSpec>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    pub model: String,
    #[serde(default)]
    pub api_key_ref: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tool_choice: Option<String>,
}

fn default_provider_kind() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// One session per agent.
    #[default]
    Agent,
    /// One session per trigger kind.
    Trigger,
    /// The configured namespace names the session.
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub session_scope: SessionScope,
    #[serde(default = "default_window")]
    pub window: i64,
}

fn default_window() -> i64 {
    DEFAULT_HISTORY_WINDOW
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: String::new(),
            namespace: String::new(),
            session_scope: SessionScope::Agent,
            window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    #[default]
    Manual,
    Cron {
        expression: String,
    },
    Webhook {
        token: String,
    },
    CollectionEvent {
        collection: String,
        events: Vec<String>,
    },
}

impl TriggerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Manual => "manual",
            TriggerSpec::Cron { .. } => "cron",
            TriggerSpec::Webhook { .. } => "webhook",
            TriggerSpec::CollectionEvent { .. } => "collection_event",
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            TriggerSpec::Cron { expression } if !expression.trim().is_empty() => {
                Some(expression.as_str())
            }
            _ => None,
        }
    }

    pub fn webhook_token(&self) -> Option<&str> {
        match self {
            TriggerSpec::Webhook { token } => Some(token.as_str()),
            _ => None,
        }
    }

    pub fn subscribes_to(&self, collection_name: &str, event_type: &str) -> bool {
        match self {
            TriggerSpec::CollectionEvent { collection, events } => {
                collection == collection_name && events.iter().any(|e| e == event_type)
            }
            _ => false,
        }
    }
}

/// A function the model may call, bound to a host implementation by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: serde_json::Value,
    pub implementation_key: String,
}

impl AgentDefinition {
    /// Applies registration defaults and validates. The returned definition is
    /// what the engine stores; it is never mutated afterwards.
    pub fn prepare(mut self) -> EngineResult<Self> {
        if self.max_turns == 0 {
            self.max_turns = DEFAULT_MAX_TURNS;
        }
        validate_agent(&self).map_err(EngineError::Config)?;
        Ok(self)
    }

    pub fn max_turns(&self) -> usize {
        usize::try_from(self.max_turns).unwrap_or(DEFAULT_MAX_TURNS as usize)
    }

    /// Parses a definition from TOML or JSON depending on the file extension.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let def = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => toml::from_str(&raw)?,
        };
        Ok(def)
    }
}

#[cfg(test)]
pub(crate) fn test_agent(id: &str) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        name: format!("{} agent", id),
        description: String::new(),
        enabled: true,
        system_prompt: "You are a test agent.".to_string(),
        max_turns: 3,
        provider: ProviderConfig {
            kind: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_ref: None,
            base_url: None,
            temperature: None,
            top_p: None,
            tool_choice: None,
        },
        memory: MemoryConfig::default(),
        trigger: TriggerSpec::Manual,
        functions: Vec::new(),
    }
}
