mod dispatcher;
mod webhook;

pub use dispatcher::dispatch_collection_event;
pub use webhook::verify_webhook_token;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::agent::{AgentDefinition, normalize_cron};
use crate::core::error::{EngineError, EngineResult, ValidationErrors};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::queue::{JobPayload, JobQueue, TriggerEvent};

/// Owns the cron schedule of every registered agent. Firing only enqueues;
/// the scheduler never waits on a run. Clones share one schedule table.
#[derive(Clone)]
pub struct TriggerManager {
    scheduler: JobScheduler,
    queue: Arc<dyn JobQueue>,
    scheduled: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl TriggerManager {
    pub fn new(scheduler: JobScheduler, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            scheduler,
            queue,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replaces whatever schedule the agent had. Disabled agents and agents
    /// without a cron trigger end up with none.
    pub async fn register(&self, agent: &AgentDefinition) -> EngineResult<()> {
        if agent.id.trim().is_empty() {
            return Err(EngineError::Config(ValidationErrors::single(
                "id",
                "agent id is required",
            )));
        }

        let mut scheduled = self.scheduled.lock().await;
        if let Some(previous) = scheduled.remove(&agent.id) {
            self.remove_job(&agent.id, previous).await;
        }

        let Some(expression) = agent.trigger.cron_expression().filter(|_| agent.enabled) else {
            return Ok(());
        };
        let normalized = normalize_cron(expression).ok_or_else(|| {
            EngineError::Config(ValidationErrors::single(
                "trigger.expression",
                "cron expression must have exactly 5 fields",
            ))
        })?;

        let job_id = self.schedule(&agent.id, &normalized).await?;
        scheduled.insert(agent.id.clone(), job_id);
        info!("Scheduled agent {} with cron '{}'", agent.id, expression);
        Ok(())
    }

    /// Returns whether a schedule was removed.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let previous = self.scheduled.lock().await.remove(agent_id);
        match previous {
            Some(job_id) => {
                self.remove_job(agent_id, job_id).await;
                true
            }
            None => false,
        }
    }

    pub async fn scheduled_count(&self) -> usize {
        self.scheduled.lock().await.len()
    }

    pub async fn is_scheduled(&self, agent_id: &str) -> bool {
        self.scheduled.lock().await.contains_key(agent_id)
    }

    /// Adds a job for an already normalized six-field expression.
    async fn schedule(&self, agent_id: &str, expression: &str) -> EngineResult<Uuid> {
        let queue = self.queue.clone();
        let owner = agent_id.to_string();
        let cron = expression.to_string();

        let job = Job::new_async(expression, move |_uuid, _l| {
            let queue = queue.clone();
            let agent_id = owner.clone();
            let cron = cron.clone();
            Box::pin(async move {
                let payload = JobPayload::new(agent_id.clone(), "")
                    .with_event(TriggerEvent::schedule(&cron));
                if let Err(e) = queue.enqueue(&payload).await {
                    error!("Cron enqueue failed for agent {}: {}", agent_id, e);
                }
            })
        })
        .map_err(|e| EngineError::Setup(format!("cron job for {}: {}", agent_id, e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| EngineError::Setup(format!("scheduler rejected job for {}: {}", agent_id, e)))
    }

    async fn remove_job(&self, agent_id: &str, job_id: Uuid) {
        match self.scheduler.remove(&job_id).await {
            Ok(()) => info!("Removed cron schedule for agent {}", agent_id),
            Err(e) => warn!("Failed to remove cron schedule for agent {}: {}", agent_id, e),
        }
    }
}

#[async_trait]
impl LifecycleComponent for TriggerManager {
    async fn on_shutdown(&mut self) -> Result<()> {
        let ids: Vec<(String, Uuid)> = self.scheduled.lock().await.drain().collect();
        for (agent_id, job_id) in ids {
            self.remove_job(&agent_id, job_id).await;
        }
        Ok(())
    }
}
