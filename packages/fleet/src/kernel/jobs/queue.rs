//! PostgreSQL-backed job queue.
//!
//! Producers insert rows, workers claim them under `FOR UPDATE SKIP LOCKED`,
//! and a periodic sweep returns stale-leased rows to the queue. The database
//! is the only coordination substrate between processes.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Job was enqueued, returns new job ID
    Created(Uuid),
    /// A live job already carries this external task id, returns its ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Trait for job queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for execution.
    ///
    /// If the job carries an `external_task_id` and a non-terminal job with
    /// the same id exists, returns `EnqueueResult::Duplicate`.
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult>;

    /// Claim the next runnable job for this worker, if any.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent claimers never return
    /// the same row.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Refresh the lease on an owned job; returns the current status so the
    /// caller observes external cancels. `None` means the row is no longer
    /// owned by this worker.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<Option<JobStatus>>;

    /// Cancel a non-terminal job. Running jobs stop at the owner's next
    /// cooperative checkpoint.
    async fn cancel(&self, job_id: Uuid, reason: Option<&str>) -> Result<bool>;

    /// Return jobs with stale leases to `pending`. Returns the released ids.
    async fn release_stuck(&self, released_by: &str) -> Result<Vec<Uuid>>;
}

/// PostgreSQL-backed job queue implementation.
pub struct PostgresJobQueue {
    pool: PgPool,
    lease_window_seconds: i64,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, lease_window_seconds: i64) -> Self {
        Self {
            pool,
            lease_window_seconds,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn lease_window_seconds(&self) -> i64 {
        self.lease_window_seconds
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult> {
        // Pre-check idempotency; the partial unique index on
        // external_task_id backs this up under races.
        if let Some(external_task_id) = &job.external_task_id {
            if let Some(existing) =
                Job::find_live_by_external_task_id(external_task_id, &self.pool).await?
            {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let inserted = job.insert(&self.pool).await?;
        info!(
            job_id = %inserted.id,
            job_type = %inserted.job_type,
            priority = inserted.priority,
            "enqueued job"
        );
        Ok(EnqueueResult::Created(inserted.id))
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        Job::claim(worker_id, &self.pool).await
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<Option<JobStatus>> {
        Job::heartbeat(job_id, worker_id, &self.pool).await
    }

    async fn cancel(&self, job_id: Uuid, reason: Option<&str>) -> Result<bool> {
        Job::mark_cancelled(job_id, reason, &self.pool).await
    }

    async fn release_stuck(&self, released_by: &str) -> Result<Vec<Uuid>> {
        let released =
            Job::release_stuck(released_by, self.lease_window_seconds, &self.pool).await?;
        if !released.is_empty() {
            info!(
                released_by = %released_by,
                count = released.len(),
                "released stuck jobs back to the queue"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_result_helpers() {
        let created = EnqueueResult::Created(Uuid::new_v4());
        assert!(created.is_created());

        let duplicate = EnqueueResult::Duplicate(Uuid::new_v4());
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job_id(), duplicate.job_id());
    }
}
