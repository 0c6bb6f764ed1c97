use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ClaimedJob, FailOutcome, JobPayload, JobQueue};
use crate::core::error::EngineError;
use crate::core::lifecycle::LifecycleComponent;

/// Runs one delivered job. Returning `Ok` acknowledges it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        payload: JobPayload,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Polls the queue and runs up to `concurrency` jobs at once.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Renews the lease every third of the visibility timeout. When the lease is
/// lost the run is cancelled so two workers never write the same lane.
async fn keep_lease(queue: &dyn JobQueue, id: &str, lease: &str, cancel: &CancellationToken) {
    let every = queue.visibility_timeout() / 3;
    if every.is_zero() {
        return std::future::pending().await;
    }
    loop {
        tokio::time::sleep(every).await;
        if let Err(e) = queue.extend(id, lease).await {
            warn!("Job {} lost its lease ({}), cancelling the run", id, e);
            cancel.cancel();
            return std::future::pending().await;
        }
    }
}

async fn process(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    job: ClaimedJob,
    cancel: CancellationToken,
) {
    let ClaimedJob {
        id,
        lease,
        payload,
        attempts,
    } = job;
    let agent_id = payload.agent_id.clone();
    info!(
        "Job {} started for agent {} (attempt {})",
        id,
        agent_id,
        attempts + 1
    );

    let result = tokio::select! {
        result = handler.handle(payload, cancel.clone()) => result,
        () = keep_lease(queue.as_ref(), &id, &lease, &cancel) => Err(EngineError::Cancelled),
    };

    match result {
        Ok(()) => {
            if let Err(e) = queue.ack(&id, &lease).await {
                error!("Failed to ack job {}: {}", id, e);
            } else {
                info!("Job {} for agent {} completed", id, agent_id);
            }
        }
        Err(e) => {
            warn!("Job {} for agent {} failed: {}", id, agent_id, e);
            match queue.fail(&id, &lease, &e.to_string(), e.is_retryable()).await {
                Ok(FailOutcome::Retry { delay }) => {
                    info!("Job {} rescheduled in {:?}", id, delay)
                }
                Ok(FailOutcome::Dead) => warn!("Job {} moved to dead", id),
                Err(qe) => error!("Failed to record failure of job {}: {}", id, qe),
            }
        }
    }
}

async fn poll_loop(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let worker_id = format!("worker-{}", std::process::id());
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = match queue.claim(&worker_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => None,
            Err(e) => {
                warn!("Queue claim failed: {}", e);
                None
            }
        };

        let Some(job) = job else {
            drop(permit);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        let queue = queue.clone();
        let handler = handler.clone();
        let child = cancel.child_token();
        tasks.spawn(async move {
            let _permit = permit;
            process(queue, handler, job, child).await;
        });

        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!("Worker task panicked: {}", e);
            }
        }
    }

    info!("Worker pool draining {} in-flight job(s)", tasks.len());
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!("Worker task panicked: {}", e);
        }
    }
}

#[async_trait]
impl LifecycleComponent for WorkerPool {
    async fn on_start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        info!("Starting worker pool with concurrency {}", self.concurrency);
        self.handle = Some(tokio::spawn(poll_loop(
            self.queue.clone(),
            self.handler.clone(),
            self.concurrency,
            self.poll_interval,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{RetryPolicy, SqliteJobQueue};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        seen: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn handle(
            &self,
            payload: JobPayload,
            _cancel: CancellationToken,
        ) -> Result<(), EngineError> {
            self.seen.lock().unwrap().push(payload.initial_input);
            let should_fail = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(EngineError::Cancelled);
            }
            Ok(())
        }
    }

    async fn wait_until_empty(queue: &SqliteJobQueue) {
        for _ in 0..200 {
            let stats = queue.stats().await.unwrap();
            if stats.pending == 0 && stats.running == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never drained");
    }

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn runs_and_acks_jobs() {
        let queue = Arc::new(SqliteJobQueue::in_memory(immediate()).unwrap());
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(0),
        });
        queue.enqueue(&JobPayload::new("a", "one")).await.unwrap();
        queue.enqueue(&JobPayload::new("b", "two")).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), 2, Duration::from_millis(5));
        pool.on_start().await.unwrap();
        wait_until_empty(&queue).await;
        pool.on_shutdown().await.unwrap();

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["one", "two"]);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn failed_job_is_redelivered() {
        let queue = Arc::new(SqliteJobQueue::in_memory(immediate()).unwrap());
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(1),
        });
        queue.enqueue(&JobPayload::new("a", "flaky")).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), 1, Duration::from_millis(5));
        pool.on_start().await.unwrap();
        wait_until_empty(&queue).await;
        pool.on_shutdown().await.unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec!["flaky", "flaky"]);
    }

    struct Slow {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(
            &self,
            _payload: JobPayload,
            _cancel: CancellationToken,
        ) -> Result<(), EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn long_run_outlives_the_visibility_timeout() {
        let policy = RetryPolicy {
            visibility_timeout: Duration::from_millis(90),
            ..immediate()
        };
        let queue = Arc::new(SqliteJobQueue::in_memory(policy).unwrap());
        let handler = Arc::new(Slow {
            runs: AtomicUsize::new(0),
        });
        queue.enqueue(&JobPayload::new("a", "slow")).await.unwrap();

        let mut pool = WorkerPool::new(queue.clone(), handler.clone(), 2, Duration::from_millis(5));
        pool.on_start().await.unwrap();
        wait_until_empty(&queue).await;
        pool.on_shutdown().await.unwrap();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.unwrap().dead, 0);
    }
}
