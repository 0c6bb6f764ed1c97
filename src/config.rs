//! Process configuration: an optional `agentflow.toml` overlaid with
//! `AGENTFLOW_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::queue::RetryPolicy;
use crate::core::runner::RunnerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "agentflow.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/agents`.
    pub agents_dir: Option<PathBuf>,
    pub log_level: String,
    pub api: ApiConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub runner: RunnerSection,
    pub openai: OpenAiConfig,
    pub anthropic: AnthropicConfig,
    pub ollama: OllamaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the `/api` routes. Without one the admin API only
    /// answers on a loopback host.
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub chat_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub history_window: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".agentflow"))
        .unwrap_or_else(|| PathBuf::from(".agentflow"))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agents_dir: None,
            log_level: "info".to_string(),
            api: ApiConfig::default(),
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            runner: RunnerSection::default(),
            openai: OpenAiConfig::default(),
            anthropic: AnthropicConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            admin_token: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval_ms: 500,
            visibility_timeout_secs: 300,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
        }
    }
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            chat_timeout_secs: 120,
            tool_timeout_secs: 60,
            history_window: 100,
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
        }
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: None,
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads `path` when given (it must exist), otherwise `agentflow.toml` in
    /// the working directory if present, then applies the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Unparsable numeric values are ignored rather than fatal.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENTFLOW_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTFLOW_AGENTS_DIR") {
            self.agents_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AGENTFLOW_API_HOST") {
            self.api.host = v;
        }
        if let Some(port) = lookup("AGENTFLOW_API_PORT").and_then(|v| v.parse().ok()) {
            self.api.port = port;
        }
        if let Some(n) = lookup("AGENTFLOW_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.worker.concurrency = n;
        }
        if let Some(v) = lookup("AGENTFLOW_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("AGENTFLOW_ADMIN_TOKEN").filter(|v| !v.is_empty()) {
            self.api.admin_token = Some(v);
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.openai.api_key = Some(v);
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.anthropic.api_key = Some(v);
        }
        if let Some(v) = lookup("OLLAMA_HOST").filter(|v| !v.is_empty()) {
            self.ollama.base_url = v;
        }
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.agents_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("agents"))
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.queue.max_retries,
            backoff_base: Duration::from_secs(self.queue.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.queue.backoff_cap_secs),
            visibility_timeout: Duration::from_secs(self.worker.visibility_timeout_secs),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            chat_timeout: Duration::from_secs(self.runner.chat_timeout_secs),
            tool_timeout: Duration::from_secs(self.runner.tool_timeout_secs),
            history_window: self.runner.history_window,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }
}
