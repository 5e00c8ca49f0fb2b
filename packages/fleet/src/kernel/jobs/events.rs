//! Per-job progress log and cost metering.
//!
//! Events are append-only and totally ordered by `(job_id, sequence)`.
//! Each job has a single writer (the owning worker), so the sequence
//! counter is computed inline without a separate lock.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::job::Job;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobEventRow {
    pub job_id: Uuid,
    pub sequence: i64,
    pub event_type: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Write-side progress API handed to handlers.
#[derive(Clone)]
pub struct ProgressRecorder {
    pool: PgPool,
}

impl ProgressRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event to the job's log.
    pub async fn record(
        &self,
        job_id: Uuid,
        event_type: &str,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<JobEventRow> {
        let event = sqlx::query_as::<_, JobEventRow>(
            r#"
            INSERT INTO job_events (job_id, sequence, event_type, message, metadata)
            VALUES (
                $1,
                (SELECT COALESCE(MAX(sequence), 0) + 1 FROM job_events WHERE job_id = $1),
                $2, $3, $4
            )
            RETURNING job_id, sequence, event_type, message, metadata, created_at
            "#,
        )
        .bind(job_id)
        .bind(event_type)
        .bind(message)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(event)
    }

    /// Accumulate the job's cost counters.
    pub async fn add_cost(&self, job_id: Uuid, cents: i64, actions: i64, tokens: i64) -> Result<()> {
        Job::add_cost(job_id, cents, actions, tokens, &self.pool).await
    }

    /// All events for a job, in order. Used by progress feeds and tests.
    pub async fn events_for(&self, job_id: Uuid) -> Result<Vec<JobEventRow>> {
        let events = sqlx::query_as::<_, JobEventRow>(
            r#"
            SELECT job_id, sequence, event_type, message, metadata, created_at
            FROM job_events
            WHERE job_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
