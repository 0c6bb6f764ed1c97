//! The composition root: one `Engine` owns the agent registry, the trigger
//! manager and the job queue, and is shared by reference with the HTTP
//! handlers and the worker pool.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::agent::{AgentDefinition, AgentRegistry, load_definitions, session_for};
use crate::core::error::{EngineError, EngineResult, ValidationErrors};
use crate::core::llm::{CompleterFactory, ProviderFactory};
use crate::core::memory::{BackendKind, MemoryStores, Message};
use crate::core::queue::{
    CollectionEventData, JobHandler, JobPayload, JobQueue, QueueStats, SqliteJobQueue,
    TriggerEvent,
};
use crate::core::runner::{RunOutcome, RunnerConfig, TurnExecutor, contextual_input};
use crate::core::tools::{InMemoryDataBackend, ToolRegistry, ToolTable};
use crate::core::triggers::{self, TriggerManager, verify_webhook_token};

/// Collaborators the engine does not construct itself.
pub struct EngineParts {
    pub queue: Arc<dyn JobQueue>,
    pub memory: Arc<MemoryStores>,
    pub tools: ToolTable,
    pub completers: Arc<dyn CompleterFactory>,
    pub runner: RunnerConfig,
}

pub struct Engine {
    registry: AgentRegistry,
    triggers: TriggerManager,
    queue: Arc<dyn JobQueue>,
    memory: Arc<MemoryStores>,
    tools: ToolTable,
    completers: Arc<dyn CompleterFactory>,
    runner: RunnerConfig,
}

impl Engine {
    pub fn new(scheduler: JobScheduler, parts: EngineParts) -> Self {
        let triggers = TriggerManager::new(scheduler, parts.queue.clone());
        Self {
            registry: AgentRegistry::new(),
            triggers,
            queue: parts.queue,
            memory: parts.memory,
            tools: parts.tools,
            completers: parts.completers,
            runner: parts.runner,
        }
    }

    /// Opens the durable queue and memory stores under `data_dir`.
    pub fn from_config(config: &EngineConfig, scheduler: JobScheduler) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let queue = SqliteJobQueue::open(config.data_dir.join("queue.db"), config.retry_policy())?;
        let parts = EngineParts {
            queue: Arc::new(queue),
            memory: Arc::new(MemoryStores::new(&config.data_dir)),
            tools: ToolTable::builtins(Arc::new(InMemoryDataBackend::new())).build(),
            completers: Arc::new(
                ProviderFactory::new(config.openai.api_key.clone(), config.openai.base_url.clone())
                    .with_anthropic(
                        config.anthropic.api_key.clone(),
                        config.anthropic.base_url.clone(),
                    )
                    .with_ollama(config.ollama.base_url.clone()),
            ),
            runner: config.runner_config(),
        };
        info!("Engine data directory: {}", config.data_dir.display());
        Ok(Self::new(scheduler, parts))
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// A handle sharing this engine's schedule table, for lifecycle wiring.
    pub fn triggers(&self) -> TriggerManager {
        self.triggers.clone()
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    /// Validates, resolves every implementation key and memory backend, then
    /// replaces any previous definition and schedule under the same id.
    pub async fn register_agent(&self, def: AgentDefinition) -> EngineResult<Arc<AgentDefinition>> {
        let def = def.prepare()?;
        self.check_bindings(&def)?;

        self.triggers.register(&def).await?;
        let id = def.id.clone();
        if self.registry.insert(def).await.is_some() {
            info!("Agent {} re-registered", id);
        } else {
            info!("Agent {} registered", id);
        }
        self.registry
            .get(&id)
            .await
            .ok_or_else(|| EngineError::NotFound(id))
    }

    fn check_bindings(&self, def: &AgentDefinition) -> EngineResult<()> {
        let mut errors = ValidationErrors::default();
        for (i, func) in def.functions.iter().enumerate() {
            if !func.implementation_key.is_empty()
                && self.tools.get(&func.implementation_key).is_none()
            {
                errors.push(
                    format!("functions[{}].implementation_key", i),
                    format!("unknown implementation key '{}'", func.implementation_key),
                );
            }
        }
        if let Err(e) = BackendKind::parse(&def.memory.backend) {
            errors.push("memory.backend", e.to_string());
        }
        if let Err(provider_errors) = self.completers.check(&def.provider) {
            errors.0.extend(provider_errors.0);
        }
        errors.into_result().map_err(EngineError::Config)
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> EngineResult<()> {
        self.registry
            .remove(agent_id)
            .await
            .ok_or_else(|| EngineError::NotFound(agent_id.to_string()))?;
        self.triggers.unregister(agent_id).await;
        info!("Agent {} unregistered", agent_id);
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<Arc<AgentDefinition>> {
        self.registry.list().await
    }

    pub async fn get_agent(&self, agent_id: &str) -> EngineResult<Arc<AgentDefinition>> {
        self.registry
            .get(agent_id)
            .await
            .ok_or_else(|| EngineError::NotFound(agent_id.to_string()))
    }

    /// Registers every definition in `dir`. Definitions that fail validation
    /// are logged and skipped. Returns how many were registered.
    pub async fn load_from_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        for def in load_definitions(dir)? {
            let id = def.id.clone();
            match self.register_agent(def).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping agent {} from {}: {}", id, dir.display(), e),
            }
        }
        info!("Loaded {} agent(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Authenticates a webhook call and enqueues a run. Never waits on the
    /// run itself.
    pub async fn handle_webhook(
        &self,
        agent_id: &str,
        token: Option<&str>,
        payload: Value,
    ) -> EngineResult<String> {
        let agent = self.authorize_webhook(agent_id, token).await?;
        self.enqueue_webhook(&agent, payload).await
    }

    /// Agent lookup and token check, before the body is even parsed.
    pub async fn authorize_webhook(
        &self,
        agent_id: &str,
        token: Option<&str>,
    ) -> EngineResult<Arc<AgentDefinition>> {
        let agent = self.get_agent(agent_id).await?;
        let expected = agent.trigger.webhook_token().unwrap_or_default();
        if !verify_webhook_token(expected, token.unwrap_or_default()) {
            warn!("Rejected webhook for agent {}: token mismatch", agent_id);
            return Err(EngineError::Unauthorized(agent_id.to_string()));
        }
        if !agent.enabled {
            return Err(EngineError::Disabled(agent_id.to_string()));
        }
        Ok(agent)
    }

    pub async fn enqueue_webhook(
        &self,
        agent: &AgentDefinition,
        payload: Value,
    ) -> EngineResult<String> {
        // The first user turn is rendered from the event when the job runs.
        let job = JobPayload::new(agent.id.clone(), "").with_event(TriggerEvent::webhook(payload));
        let job_id = self.queue.enqueue(&job).await?;
        info!("Webhook accepted for agent {} as job {}", agent.id, job_id);
        Ok(job_id)
    }

    pub async fn enqueue_manual(&self, agent_id: &str, input: &str) -> EngineResult<String> {
        let agent = self.get_agent(agent_id).await?;
        if !agent.enabled {
            return Err(EngineError::Disabled(agent_id.to_string()));
        }
        let job = JobPayload::new(agent_id, input).with_event(TriggerEvent::manual());
        Ok(self.queue.enqueue(&job).await?)
    }

    pub async fn dispatch_collection_event(&self, event: &CollectionEventData) -> Vec<String> {
        triggers::dispatch_collection_event(&self.registry, self.queue.as_ref(), event).await
    }

    /// Runs a delivered job to completion. The registry lock is released
    /// before anything blocking happens.
    pub async fn execute_job(
        &self,
        payload: &JobPayload,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let agent = self.get_agent(&payload.agent_id).await?;
        if !agent.enabled {
            return Err(EngineError::Disabled(agent.id.clone()));
        }
        let input = contextual_input(payload);
        self.run_definition(agent, payload.trigger_kind(), &input, cancel)
            .await
    }

    /// One synchronous run outside the queue, as a manual trigger.
    pub async fn run_agent(
        &self,
        agent_id: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let payload = JobPayload::new(agent_id, input).with_event(TriggerEvent::manual());
        self.execute_job(&payload, cancel).await
    }

    async fn run_definition(
        &self,
        agent: Arc<AgentDefinition>,
        trigger_kind: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let session_id = session_for(&agent, trigger_kind);
        let completer = self.completers.build(&agent.provider)?;
        let tools = ToolRegistry::build(&agent.functions, &self.tools)?;
        let memory = self.memory.open(&agent.memory).await?;

        TurnExecutor::new(
            agent,
            session_id,
            completer,
            tools,
            memory,
            self.runner.clone(),
        )
        .run(input, cancel)
        .await
    }

    /// Stored messages of one session, oldest first. `limit <= 0` loads all.
    pub async fn history(
        &self,
        agent_id: &str,
        session_id: &str,
        limit: i64,
    ) -> EngineResult<Vec<Message>> {
        let agent = self.get_agent(agent_id).await?;
        let memory = self.memory.open(&agent.memory).await?;
        Ok(memory.load(agent_id, session_id, limit).await?)
    }

    pub async fn queue_stats(&self) -> EngineResult<QueueStats> {
        Ok(self.queue.stats().await?)
    }
}

#[async_trait]
impl JobHandler for Engine {
    async fn handle(&self, payload: JobPayload, cancel: CancellationToken) -> Result<(), EngineError> {
        let outcome = self.execute_job(&payload, &cancel).await?;
        info!(
            "Agent {} session {} finished: {:?}",
            payload.agent_id, outcome.session_id, outcome.status
        );
        Ok(())
    }
}

/// An engine over in-memory stores, the test tool table and a fixed model.
#[cfg(test)]
pub(crate) async fn test_engine(
    completer: Arc<dyn crate::core::llm::ChatCompleter>,
) -> (Engine, tempfile::TempDir) {
    use crate::core::llm::testing::FixedFactory;
    use crate::core::queue::RetryPolicy;

    let (stores, dir) = crate::core::memory::test_memory_stores();
    let queue = SqliteJobQueue::in_memory(RetryPolicy::default()).unwrap();
    let engine = Engine::new(
        JobScheduler::new().await.unwrap(),
        EngineParts {
            queue: Arc::new(queue),
            memory: Arc::new(stores),
            tools: crate::core::tools::testing::test_table(),
            completers: Arc::new(FixedFactory(completer)),
            runner: RunnerConfig::default(),
        },
    );
    (engine, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::{ToolSpec, TriggerSpec, test_agent};
    use crate::core::llm::Response;
    use crate::core::llm::testing::ScriptedCompleter;
    use crate::core::memory::Role;
    use crate::core::runner::RunStatus;
    use serde_json::json;

    struct Harness {
        engine: Engine,
        queue: Arc<dyn JobQueue>,
        completer: Arc<ScriptedCompleter>,
        _dir: tempfile::TempDir,
    }

    async fn harness(completer: ScriptedCompleter) -> Harness {
        let completer = Arc::new(completer);
        let (engine, dir) = test_engine(completer.clone()).await;
        Harness {
            queue: engine.queue(),
            engine,
            completer,
            _dir: dir,
        }
    }

    fn done() -> ScriptedCompleter {
        ScriptedCompleter::always(Response::Text {
            content: "done".into(),
        })
    }

    fn webhook_agent(id: &str, token: &str) -> AgentDefinition {
        let mut agent = test_agent(id);
        agent.trigger = TriggerSpec::Webhook {
            token: token.into(),
        };
        agent
    }

    #[tokio::test]
    async fn unresolvable_bindings_are_field_errors() {
        let h = harness(done()).await;
        let mut agent = test_agent("bad");
        agent.functions = vec![ToolSpec {
            name: "ghost".into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
            implementation_key: "nowhere.ghost".into(),
        }];
        agent.memory.backend = "gorm".into();

        let Err(EngineError::Config(errors)) = h.engine.register_agent(agent).await else {
            panic!("expected a configuration error");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["functions[0].implementation_key", "memory.backend"]);
        assert!(h.engine.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn unusable_providers_fail_registration() {
        use crate::core::queue::RetryPolicy;

        let (stores, _dir) = crate::core::memory::test_memory_stores();
        let engine = Engine::new(
            JobScheduler::new().await.unwrap(),
            EngineParts {
                queue: Arc::new(SqliteJobQueue::in_memory(RetryPolicy::default()).unwrap()),
                memory: Arc::new(stores),
                tools: crate::core::tools::testing::test_table(),
                completers: Arc::new(ProviderFactory::new(None, "http://127.0.0.1:9/v1".into())),
                runner: RunnerConfig::default(),
            },
        );

        let mut agent = test_agent("pigeon");
        agent.provider.kind = "carrier-pigeon".into();
        let Err(EngineError::Config(errors)) = engine.register_agent(agent).await else {
            panic!("expected a configuration error");
        };
        assert_eq!(errors.0[0].field, "provider.kind");

        // openai without any key resolvable
        let mut agent = test_agent("keyless");
        agent.provider.api_key_ref = Some("AGENTFLOW_TEST_KEY_THAT_IS_NOT_SET".into());
        let Err(EngineError::Config(errors)) = engine.register_agent(agent).await else {
            panic!("expected a configuration error");
        };
        assert_eq!(errors.0[0].field, "provider.api_key_ref");
        assert!(engine.list_agents().await.is_empty());
    }

    #[tokio::test]
    async fn registration_defaults_max_turns() {
        let h = harness(done()).await;
        let mut agent = test_agent("a");
        agent.max_turns = 0;
        let stored = h.engine.register_agent(agent).await.unwrap();
        assert_eq!(stored.max_turns, 4);
    }

    #[tokio::test]
    async fn wrong_webhook_token_never_enqueues() {
        let h = harness(done()).await;
        h.engine
            .register_agent(webhook_agent("hook", "s3cret"))
            .await
            .unwrap();

        for token in [None, Some(""), Some("guess")] {
            let err = h
                .engine
                .handle_webhook("hook", token, json!({"x": 1}))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized(_)));
        }
        let err = h
            .engine
            .handle_webhook("missing", Some("s3cret"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn non_webhook_agents_reject_any_token() {
        let h = harness(done()).await;
        h.engine.register_agent(test_agent("manual")).await.unwrap();
        let err = h
            .engine
            .handle_webhook("manual", Some(""), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn accepted_webhook_runs_in_webhook_session() {
        let h = harness(done()).await;
        let mut agent = webhook_agent("hook", "s3cret");
        agent.memory.session_scope = crate::core::agent::SessionScope::Trigger;
        h.engine.register_agent(agent).await.unwrap();

        h.engine
            .handle_webhook("hook", Some("s3cret"), json!({"order": 42}))
            .await
            .unwrap();
        let job = h.queue.claim("w").await.unwrap().unwrap();
        assert!(job.payload.initial_input.is_empty());

        h.engine
            .handle(job.payload, CancellationToken::new())
            .await
            .unwrap();

        let history = h.engine.history("hook", "hook:webhook", 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(history[0].content.contains("\"order\": 42"));
        assert_eq!(history[1].content, "done");
        assert_eq!(h.completer.call_count(), 1);

        let sent = h.completer.calls.lock().unwrap()[0].clone();
        let last = sent.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(last.content.starts_with("A webhook has been received. Here is the payload:"));
        assert!(last.content.contains("\"order\": 42"));
    }

    #[tokio::test]
    async fn disabled_agents_do_not_run() {
        let h = harness(done()).await;
        let mut agent = webhook_agent("off", "s3cret");
        agent.enabled = false;
        h.engine.register_agent(agent).await.unwrap();

        let err = h
            .engine
            .handle_webhook("off", Some("s3cret"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Disabled(_)));

        let err = h
            .engine
            .execute_job(&JobPayload::new("off", "go"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(h.completer.call_count(), 0);
    }

    #[tokio::test]
    async fn manual_run_uses_input_and_persists() {
        let h = harness(done()).await;
        h.engine.register_agent(test_agent("m")).await.unwrap();

        let outcome = h
            .engine
            .run_agent("m", "summarize today", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed("done".into()));
        assert_eq!(outcome.session_id, "m");

        let sent = h.completer.calls.lock().unwrap()[0].clone();
        assert_eq!(sent.last().unwrap().content, "summarize today");
        assert_eq!(h.engine.history("m", "m", 1).await.unwrap()[0].content, "done");
    }

    #[tokio::test]
    async fn unregister_removes_agent_and_schedule() {
        let h = harness(done()).await;
        let mut agent = test_agent("cron");
        agent.trigger = TriggerSpec::Cron {
            expression: "*/5 * * * *".into(),
        };
        h.engine.register_agent(agent.clone()).await.unwrap();
        h.engine.register_agent(agent).await.unwrap();
        assert_eq!(h.engine.triggers().scheduled_count().await, 1);

        h.engine.unregister_agent("cron").await.unwrap();
        assert_eq!(h.engine.triggers().scheduled_count().await, 0);
        assert!(matches!(
            h.engine.unregister_agent("cron").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_from_dir_skips_invalid_definitions() {
        let h = harness(done()).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.json"),
            serde_json::to_string(&test_agent("good")).unwrap(),
        )
        .unwrap();
        let mut bad = test_agent("bad");
        bad.system_prompt.clear();
        std::fs::write(
            dir.path().join("bad.json"),
            serde_json::to_string(&bad).unwrap(),
        )
        .unwrap();

        assert_eq!(h.engine.load_from_dir(dir.path()).await.unwrap(), 1);
        assert!(h.engine.get_agent("good").await.is_ok());
        assert!(h.engine.get_agent("bad").await.is_err());
    }
}
