//! Job model: the single source of truth for one unit of work.
//!
//! Workers never hold locks. Ownership is a lease expressed by
//! `worker_id` + `last_heartbeat`, and every state transition is a
//! conditional UPDATE gated on the expected current status — a racing
//! transition loses by matching zero rows and re-reads.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::errors::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Column list shared by every query that materializes a full `Job`.
pub(crate) const JOB_COLUMNS: &str = "id, job_type, target_url, task_description, input_data, \
     metadata, user_id, timeout_seconds, max_retries, priority, scheduled_at, callback_url, \
     external_task_id, target_worker_id, tags, status, worker_id, retry_count, last_heartbeat, \
     started_at, completed_at, paused_at, interaction_type, interaction_data, status_message, \
     result_data, result_summary, error_code, error_details, screenshot_urls, llm_cost_cents, \
     action_count, total_tokens, execution_mode, final_mode, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Immutable on insert
    pub job_type: String,
    pub target_url: String,
    #[builder(default)]
    pub task_description: String,
    #[builder(default = serde_json::json!({}))]
    pub input_data: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,
    pub user_id: String,
    #[builder(default = 600)]
    pub timeout_seconds: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 100)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub callback_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub external_task_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub target_worker_id: Option<String>,
    #[builder(default)]
    pub tags: Vec<String>,

    // Mutable during the lifecycle
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub paused_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub interaction_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub interaction_data: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub status_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result_data: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub result_summary: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_details: Option<serde_json::Value>,
    #[builder(default)]
    pub screenshot_urls: Vec<String>,
    #[builder(default = 0)]
    pub llm_cost_cents: i64,
    #[builder(default = 0)]
    pub action_count: i64,
    #[builder(default = 0)]
    pub total_tokens: i64,
    #[builder(default, setter(strip_option))]
    pub execution_mode: Option<String>,
    #[builder(default, setter(strip_option))]
    pub final_mode: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn cost_usd(&self) -> f64 {
        self.llm_cost_cents as f64 / 100.0
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, target_url, task_description, input_data,
                metadata, user_id, timeout_seconds, max_retries, priority, scheduled_at,
                callback_url, external_task_id, target_worker_id, tags, status, worker_id,
                retry_count, last_heartbeat, started_at, completed_at, paused_at,
                interaction_type, interaction_data, status_message, result_data,
                result_summary, error_code, error_details, screenshot_urls, llm_cost_cents,
                action_count, total_tokens, execution_mode, final_mode, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32,
                $33, $34, $35, $36, $37
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(self.id)
            .bind(&self.job_type)
            .bind(&self.target_url)
            .bind(&self.task_description)
            .bind(&self.input_data)
            .bind(&self.metadata)
            .bind(&self.user_id)
            .bind(self.timeout_seconds)
            .bind(self.max_retries)
            .bind(self.priority)
            .bind(self.scheduled_at)
            .bind(&self.callback_url)
            .bind(&self.external_task_id)
            .bind(&self.target_worker_id)
            .bind(&self.tags)
            .bind(self.status)
            .bind(&self.worker_id)
            .bind(self.retry_count)
            .bind(self.last_heartbeat)
            .bind(self.started_at)
            .bind(self.completed_at)
            .bind(self.paused_at)
            .bind(&self.interaction_type)
            .bind(&self.interaction_data)
            .bind(&self.status_message)
            .bind(&self.result_data)
            .bind(&self.result_summary)
            .bind(&self.error_code)
            .bind(&self.error_details)
            .bind(&self.screenshot_urls)
            .bind(self.llm_cost_cents)
            .bind(self.action_count)
            .bind(self.total_tokens)
            .bind(&self.execution_mode)
            .bind(&self.final_mode)
            .bind(self.created_at)
            .bind(self.updated_at)
            .fetch_one(pool)
            .await?;

        Ok(job)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// Find a live (non-terminal) job carrying this orchestrator task id.
    pub async fn find_live_by_external_task_id(
        external_task_id: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE external_task_id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled')
            LIMIT 1
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(external_task_id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// Atomically claim the next runnable job for `worker_id`.
    ///
    /// One statement: lock a candidate with `FOR UPDATE SKIP LOCKED` so
    /// concurrent claimers never see the same row, then stamp the lease.
    pub async fn claim(worker_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                  AND (target_worker_id IS NULL OR target_worker_id = $1)
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'queued',
                worker_id = $1,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(worker_id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// Refresh the lease and report the current status so the owner
    /// observes external cancels.
    pub async fn heartbeat(id: Uuid, worker_id: &str, pool: &PgPool) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r#"
            UPDATE jobs
            SET last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;
        Ok(status)
    }

    /// queued -> running. Stamps a fresh `started_at` for this attempt.
    pub async fn mark_running(id: Uuid, worker_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = NOW(),
                status_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// running -> paused, recording the blocker.
    pub async fn mark_paused(
        id: Uuid,
        worker_id: &str,
        interaction_type: &str,
        interaction_data: &serde_json::Value,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'paused',
                paused_at = NOW(),
                interaction_type = $3,
                interaction_data = $4,
                status_message = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(interaction_type)
            .bind(interaction_data)
            .bind(format!("Waiting for human: {interaction_type}"))
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// paused -> running. Issued by whoever resolves the blocker; the
    /// `jobs_resume_notify` trigger fans the transition out on `job_resume`.
    pub async fn mark_resumed(
        id: Uuid,
        status_message: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                paused_at = NULL,
                status_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(status_message)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// running -> completed with the handler's result.
    pub async fn mark_completed(
        id: Uuid,
        worker_id: &str,
        result_data: Option<&serde_json::Value>,
        result_summary: Option<&str>,
        screenshot_urls: &[String],
        final_mode: Option<&str>,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                result_data = $3,
                result_summary = $4,
                screenshot_urls = screenshot_urls || $5,
                final_mode = COALESCE($6, final_mode),
                status_message = 'Completed',
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(result_data)
            .bind(result_summary)
            .bind(screenshot_urls)
            .bind(final_mode)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// running|paused -> failed. `from` selects the guard.
    pub async fn mark_failed(
        id: Uuid,
        worker_id: &str,
        from: JobStatus,
        code: ErrorCode,
        message: &str,
        details: &serde_json::Value,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                completed_at = NOW(),
                paused_at = NULL,
                error_code = $4,
                error_details = COALESCE(error_details, '{{}}'::jsonb) || $5,
                status_message = $6,
                updated_at = NOW()
            WHERE id = $1 AND status = $3 AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(from)
            .bind(code.as_str())
            .bind(details)
            .bind(message)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// running -> pending for another attempt, with exponential backoff
    /// expressed through `scheduled_at`.
    pub async fn retry_to_pending(
        id: Uuid,
        worker_id: &str,
        backoff_seconds: i64,
        code: ErrorCode,
        message: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                last_heartbeat = NULL,
                started_at = NULL,
                paused_at = NULL,
                retry_count = retry_count + 1,
                scheduled_at = NOW() + ($3 || ' seconds')::INTERVAL,
                error_code = $4,
                status_message = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND worker_id = $2
              AND retry_count < max_retries
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Self>(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(backoff_seconds.to_string())
            .bind(code.as_str())
            .bind(message)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// External cancel of any non-terminal row. The owning worker observes
    /// the new status at its next heartbeat and aborts cooperatively.
    pub async fn mark_cancelled(
        id: Uuid,
        status_message: Option<&str>,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                completed_at = NOW(),
                paused_at = NULL,
                status_message = COALESCE($2, status_message),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'queued', 'running', 'paused')
            "#,
        )
        .bind(id)
        .bind(status_message)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return stale-leased rows to the queue.
    ///
    /// Any worker may run this. `retry_count` is left untouched — a crash is
    /// not an attempt — and the release is recorded in `error_details`.
    pub async fn release_stuck(
        released_by: &str,
        lease_window_seconds: i64,
        pool: &PgPool,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                last_heartbeat = NULL,
                started_at = NULL,
                error_details = COALESCE(error_details, '{}'::jsonb) || jsonb_build_object(
                    'released_by', $1::text,
                    'reason', 'stuck_job',
                    'released_at', NOW()
                ),
                updated_at = NOW()
            WHERE status IN ('queued', 'running')
              AND last_heartbeat < NOW() - ($2 || ' seconds')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(released_by)
        .bind(lease_window_seconds.to_string())
        .fetch_all(pool)
        .await?;
        Ok(ids)
    }

    /// Accumulate cost counters. Allowed on terminal rows — costs are the
    /// one thing a late callback retry may still touch.
    pub async fn add_cost(
        id: Uuid,
        cents: i64,
        actions: i64,
        tokens: i64,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET llm_cost_cents = llm_cost_cents + $2,
                action_count = action_count + $3,
                total_tokens = total_tokens + $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(cents)
        .bind(actions)
        .bind(tokens)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .job_type("apply_form")
            .target_url("https://boards.example.com/jobs/1")
            .user_id("user-1")
            .build()
    }

    #[test]
    fn new_job_starts_pending() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn new_job_has_default_budgets() {
        let job = sample_job();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.timeout_seconds, 600);
        assert_eq!(job.priority, 100);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn cost_usd_converts_cents() {
        let mut job = sample_job();
        job.llm_cost_cents = 1234;
        assert!((job.cost_usd() - 12.34).abs() < f64::EPSILON);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Paused).unwrap(),
            "\"paused\""
        );
    }
}
