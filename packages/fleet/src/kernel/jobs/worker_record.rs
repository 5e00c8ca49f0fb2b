//! Worker fleet registry rows.
//!
//! One row per worker identity, upserted on boot and kept forever for
//! audit. The row carries the process-level heartbeat; per-job leases live
//! on the job rows themselves.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Active,
    Draining,
    Offline,
}

const WORKER_COLUMNS: &str = "worker_id, status, current_job_id, registered_at, last_heartbeat, \
     ec2_ip, target_worker_id, metadata";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_job_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ec2_ip: Option<String>,
    pub target_worker_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl WorkerRecord {
    /// Register this worker, refreshing an existing row.
    ///
    /// `target_worker_id` is a pinning hint set out-of-band; a boot that
    /// passes null must not erase it.
    pub async fn register(
        worker_id: &str,
        ec2_ip: Option<&str>,
        target_worker_id: Option<&str>,
        metadata: &serde_json::Value,
        pool: &PgPool,
    ) -> Result<Self> {
        let sql = format!(
            r#"
            INSERT INTO workers (worker_id, status, current_job_id, registered_at,
                                 last_heartbeat, ec2_ip, target_worker_id, metadata)
            VALUES ($1, 'active', NULL, NOW(), NOW(), $2, $3, $4)
            ON CONFLICT (worker_id) DO UPDATE SET
                status = 'active',
                current_job_id = NULL,
                registered_at = NOW(),
                last_heartbeat = NOW(),
                ec2_ip = EXCLUDED.ec2_ip,
                target_worker_id = COALESCE(EXCLUDED.target_worker_id, workers.target_worker_id),
                metadata = EXCLUDED.metadata
            RETURNING {WORKER_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, Self>(&sql)
            .bind(worker_id)
            .bind(ec2_ip)
            .bind(target_worker_id)
            .bind(metadata)
            .fetch_one(pool)
            .await?;
        Ok(record)
    }

    pub async fn find(worker_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = $1");
        let record = sqlx::query_as::<_, Self>(&sql)
            .bind(worker_id)
            .fetch_optional(pool)
            .await?;
        Ok(record)
    }

    pub async fn heartbeat(worker_id: &str, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat = NOW() WHERE worker_id = $1")
            .bind(worker_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(worker_id: &str, status: WorkerStatus, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET status = $2, last_heartbeat = NOW() WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_current_job(
        worker_id: &str,
        job_id: Option<Uuid>,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query("UPDATE workers SET current_job_id = $2 WHERE worker_id = $1")
            .bind(worker_id)
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
