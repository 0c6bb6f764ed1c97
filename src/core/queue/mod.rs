mod payload;
mod sqlite;
pub mod worker;

pub use payload::{CollectionEventData, EventKind, JobPayload, TriggerEvent};
pub use sqlite::SqliteJobQueue;
pub use worker::{JobHandler, WorkerPool};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

use crate::core::error::QueueError;

pub const QUEUE_NAME: &str = "agents";
pub const TASK_AGENT_RUN: &str = "agent:run";

/// A job leased to one worker until it is acked, failed or its lease expires.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    /// Fences `ack`, `fail` and `extend` to the holder of this lease.
    pub lease: String,
    pub payload: JobPayload,
    /// Failed attempts before this one.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { delay: Duration },
    Dead,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub dead: u64,
}

/// At-least-once hand-off between producers and workers.
///
/// A job leaves the queue only through `ack`. Whether a failed job is tried
/// again is the queue's decision, made from its [`RetryPolicy`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: &JobPayload) -> Result<String, QueueError>;

    /// Leases the oldest due job whose lane has nothing running.
    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, QueueError>;

    /// Fails with `LeaseLost` when `lease` no longer holds the job.
    async fn ack(&self, job_id: &str, lease: &str) -> Result<(), QueueError>;

    /// Records a failed attempt. `retryable = false` skips straight to dead.
    async fn fail(
        &self,
        job_id: &str,
        lease: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Restarts the visibility timeout of a running job.
    async fn extend(&self, job_id: &str, lease: &str) -> Result<(), QueueError>;

    /// How long a lease lasts without `extend`. Zero disables renewal.
    fn visibility_timeout(&self) -> Duration;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// A running job whose lease is older than this is handed out again.
    pub visibility_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempts`, capped, plus up to a quarter of `base` of jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(20));
        let delay = self
            .backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap);
        let jitter_ms = (self.backoff_base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
