//! The bounded conversation loop.
//!
//! A run moves `AwaitModel -> (Dispatch -> AwaitModel)* -> Done | MaxTurnsReached`,
//! or aborts with an [`EngineError`]. The triggering user message is durable
//! before the first model call; everything the run produces is appended in one
//! batch only when the loop ends without error.

mod context;

pub use context::{ACTIVATION_FALLBACK, contextual_input};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::agent::AgentDefinition;
use crate::core::error::{ChatError, EngineError, EngineResult, ToolError};
use crate::core::llm::{ChatCompleter, Response, ToolChoice};
use crate::core::memory::{ConversationMemory, Message};
use crate::core::tools::{ToolContext, ToolRegistry};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub chat_timeout: Duration,
    pub tool_timeout: Duration,
    /// Upper bound on history loaded per run; 0 leaves agents unclipped.
    pub history_window: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            chat_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(60),
            history_window: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum RunStatus {
    Completed(String),
    MaxTurnsReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub status: RunStatus,
    /// Model calls made.
    pub turns: usize,
    /// Messages produced by the run, after the user message.
    pub messages: Vec<Message>,
}

impl RunOutcome {
    pub fn final_text(&self) -> Option<&str> {
        match &self.status {
            RunStatus::Completed(text) => Some(text),
            RunStatus::MaxTurnsReached => None,
        }
    }
}

/// Everything one run needs, resolved before the loop starts.
pub struct TurnExecutor {
    agent: Arc<AgentDefinition>,
    session_id: String,
    completer: Arc<dyn ChatCompleter>,
    tools: ToolRegistry,
    memory: Arc<dyn ConversationMemory>,
    config: RunnerConfig,
}

impl TurnExecutor {
    pub fn new(
        agent: Arc<AgentDefinition>,
        session_id: String,
        completer: Arc<dyn ChatCompleter>,
        tools: ToolRegistry,
        memory: Arc<dyn ConversationMemory>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            agent,
            session_id,
            completer,
            tools,
            memory,
            config,
        }
    }

    fn history_window(&self) -> i64 {
        let own = self.agent.memory.window;
        let cap = self.config.history_window;
        match (own > 0, cap > 0) {
            (true, true) => own.min(cap),
            (true, false) => own,
            (false, true) => cap,
            (false, false) => 0,
        }
    }

    pub async fn run(&self, input: &str, cancel: &CancellationToken) -> EngineResult<RunOutcome> {
        let agent_id = self.agent.id.as_str();
        let session_id = self.session_id.as_str();

        let history = self
            .memory
            .load(agent_id, session_id, self.history_window())
            .await?;
        let user = Message::user(input);
        self.memory.append(agent_id, session_id, &user).await?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.agent.system_prompt.is_empty() {
            messages.push(Message::system(self.agent.system_prompt.clone()));
        }
        messages.extend(history);
        messages.push(user);
        let base_len = messages.len();

        let tool_choice = ToolChoice::parse(self.agent.provider.tool_choice.as_deref());
        let tool_ctx = ToolContext {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            completer: self.completer.clone(),
        };
        let max_turns = self.agent.max_turns();
        let mut status = RunStatus::MaxTurnsReached;
        let mut turns = 0;

        info!(
            "Run started for agent {} session {} ({} history messages, max {} turns)",
            agent_id,
            session_id,
            base_len - 1,
            max_turns
        );

        while turns < max_turns {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            turns += 1;
            debug!("Agent {} turn {}/{}", agent_id, turns, max_turns);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                reply = tokio::time::timeout(
                    self.config.chat_timeout,
                    self.completer.chat(&messages, self.tools.specs(), &tool_choice),
                ) => reply.map_err(|_| ChatError::Timeout(self.config.chat_timeout))??,
            };

            match response {
                Response::ToolCall(call) => {
                    info!("Agent {} requested tool {}", agent_id, call.name);
                    let tool = self
                        .tools
                        .get(&call.name)
                        .ok_or_else(|| EngineError::UnknownTool(call.name.clone()))?;
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    messages.push(Message::tool_placeholder(call.clone()));

                    let result = match tokio::time::timeout(
                        self.config.tool_timeout,
                        tool.invoke(&tool_ctx, call.arguments),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ToolError::Timeout(self.config.tool_timeout)),
                    }
                    .map_err(|source| {
                        warn!("Tool {} failed for agent {}: {}", call.name, agent_id, source);
                        EngineError::Tool {
                            name: call.name.clone(),
                            source,
                        }
                    })?;
                    messages.push(Message::tool_result(call.name, result));
                }
                Response::Text { content } => {
                    messages.push(Message::assistant(content.clone()));
                    status = RunStatus::Completed(content);
                    break;
                }
            }
        }

        if status == RunStatus::MaxTurnsReached {
            warn!(
                "Agent {} reached its limit of {} turns without a final answer",
                agent_id, max_turns
            );
        }

        let produced = messages.split_off(base_len);
        self.memory
            .append_all(agent_id, session_id, &produced)
            .await?;
        info!(
            "Run finished for agent {} after {} turn(s), {} message(s) recorded",
            agent_id,
            turns,
            produced.len()
        );

        Ok(RunOutcome {
            session_id: self.session_id.clone(),
            status,
            turns,
            messages: produced,
        })
    }
}
