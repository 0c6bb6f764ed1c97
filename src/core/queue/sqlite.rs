use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    ClaimedJob, FailOutcome, JobPayload, JobQueue, QUEUE_NAME, QueueStats, RetryPolicy,
    TASK_AGENT_RUN,
};
use crate::core::error::QueueError;

/// Durable queue in a single `jobs` table. Each job sits in the lane of its
/// agent and at most one job per lane is running at a time, so one agent's
/// runs never overlap.
pub struct SqliteJobQueue {
    db: Arc<Mutex<Connection>>,
    policy: RetryPolicy,
}

impl SqliteJobQueue {
    pub fn open<P: AsRef<Path>>(path: P, policy: RetryPolicy) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open(path)?, policy)
    }

    pub fn in_memory(policy: RetryPolicy) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?, policy)
    }

    fn with_connection(db: Connection, policy: RetryPolicy) -> Result<Self, QueueError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                task_type TEXT NOT NULL,
                lane TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER,
                lease TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_available ON jobs (status, available_at)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            policy,
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hands expired leases back to the queue, counting each as a failed attempt.
/// Jobs that used up their retries this way go to `dead`.
fn reclaim_expired(
    db: &Connection,
    now: i64,
    policy: &RetryPolicy,
) -> Result<(usize, usize), rusqlite::Error> {
    let cutoff = now - policy.visibility_timeout.as_millis() as i64;
    let dead = db.execute(
        "UPDATE jobs SET status = 'dead', claimed_by = NULL, claimed_at = NULL, lease = NULL,
                attempts = attempts + 1, last_error = 'lease expired'
         WHERE status = 'running' AND claimed_at <= ?1 AND attempts + 1 > ?2",
        params![cutoff, policy.max_retries],
    )?;
    let requeued = db.execute(
        "UPDATE jobs SET status = 'pending', claimed_by = NULL, claimed_at = NULL, lease = NULL,
                attempts = attempts + 1, last_error = 'lease expired'
         WHERE status = 'running' AND claimed_at <= ?1",
        params![cutoff],
    )?;
    Ok((requeued, dead))
}

fn claim_next(
    db: &mut Connection,
    worker_id: &str,
    policy: &RetryPolicy,
) -> Result<Option<(String, String, String, u32)>, rusqlite::Error> {
    let now = now_millis();
    let tx = db.transaction()?;
    let (requeued, dead) = reclaim_expired(&tx, now, policy)?;
    if requeued > 0 {
        warn!("Reclaimed {} job(s) whose lease expired", requeued);
    }
    if dead > 0 {
        warn!("{} job(s) with expired leases ran out of retries", dead);
    }

    let next: Option<(String, String, u32)> = tx
        .query_row(
            "SELECT id, payload, attempts FROM jobs j
             WHERE j.queue = ?1 AND j.status = 'pending' AND j.available_at <= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM jobs r WHERE r.lane = j.lane AND r.status = 'running'
               )
             ORDER BY j.rowid ASC
             LIMIT 1",
            params![QUEUE_NAME, now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let claimed = match next {
        Some((id, body, attempts)) => {
            let lease = Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE jobs SET status = 'running', claimed_by = ?1, claimed_at = ?2, lease = ?3
                 WHERE id = ?4",
                params![worker_id, now, lease, id],
            )?;
            Some((id, lease, body, attempts))
        }
        None => None,
    };
    tx.commit()?;
    Ok(claimed)
}

/// Why a fenced update touched no row.
fn lease_error(db: &Connection, job_id: &str) -> Result<QueueError, rusqlite::Error> {
    let exists = db
        .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(if exists {
        QueueError::LeaseLost(job_id.to_string())
    } else {
        QueueError::NotFound(job_id.to_string())
    })
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, payload: &JobPayload) -> Result<String, QueueError> {
        let body = serde_json::to_string(payload)?;
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO jobs (id, queue, task_type, lane, payload, available_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, QUEUE_NAME, TASK_AGENT_RUN, payload.agent_id, body, now],
        )?;
        info!("Enqueued job {} for agent {}", id, payload.agent_id);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, QueueError> {
        let claimed = {
            let mut db = self.db.lock().await;
            claim_next(&mut db, worker_id, &self.policy)?
        };
        let Some((id, lease, body, attempts)) = claimed else {
            return Ok(None);
        };

        match serde_json::from_str::<JobPayload>(&body) {
            Ok(payload) => Ok(Some(ClaimedJob {
                id,
                lease,
                payload,
                attempts,
            })),
            Err(e) => {
                // An undecodable payload can never succeed.
                self.fail(&id, &lease, &format!("payload decode failed: {}", e), false)
                    .await?;
                Err(QueueError::Encoding(e))
            }
        }
    }

    async fn ack(&self, job_id: &str, lease: &str) -> Result<(), QueueError> {
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM jobs WHERE id = ?1 AND lease = ?2 AND status = 'running'",
            params![job_id, lease],
        )?;
        if removed == 0 {
            return Err(lease_error(&db, job_id)?);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        lease: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let db = self.db.lock().await;
        let attempts: Option<u32> = db
            .query_row(
                "SELECT attempts FROM jobs WHERE id = ?1 AND lease = ?2 AND status = 'running'",
                params![job_id, lease],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(lease_error(&db, job_id)?);
        };
        let attempts = attempts + 1;

        if !retryable || attempts > self.policy.max_retries {
            db.execute(
                "UPDATE jobs SET status = 'dead', attempts = ?1, last_error = ?2,
                        claimed_by = NULL, claimed_at = NULL, lease = NULL
                 WHERE id = ?3",
                params![attempts, error, job_id],
            )?;
            warn!("Job {} is dead after {} attempt(s): {}", job_id, attempts, error);
            return Ok(FailOutcome::Dead);
        }

        let delay = self.policy.backoff(attempts - 1);
        db.execute(
            "UPDATE jobs SET status = 'pending', attempts = ?1, last_error = ?2,
                    available_at = ?3, claimed_by = NULL, claimed_at = NULL, lease = NULL
             WHERE id = ?4",
            params![
                attempts,
                error,
                now_millis() + delay.as_millis() as i64,
                job_id
            ],
        )?;
        info!(
            "Job {} will be retried in {:?} (attempt {} of {})",
            job_id, delay, attempts, self.policy.max_retries
        );
        Ok(FailOutcome::Retry { delay })
    }

    async fn extend(&self, job_id: &str, lease: &str) -> Result<(), QueueError> {
        let db = self.db.lock().await;
        let touched = db.execute(
            "UPDATE jobs SET claimed_at = ?1 WHERE id = ?2 AND lease = ?3 AND status = 'running'",
            params![now_millis(), job_id, lease],
        )?;
        if touched == 0 {
            return Err(lease_error(&db, job_id)?);
        }
        Ok(())
    }

    fn visibility_timeout(&self) -> Duration {
        self.policy.visibility_timeout
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "running" => stats.running = count,
                "dead" => stats.dead = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
