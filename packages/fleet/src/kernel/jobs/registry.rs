//! Handler registry and the execution context handed to handlers.
//!
//! The scheduler treats a handler as opaque: `execute(ctx) -> outcome`.
//! Handlers reach back into the core only through [`JobContext`] — progress
//! events, cost metering, session state, and human-intervention requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::errors::HandlerError;
use super::events::ProgressRecorder;
use super::hitl::{Blocker, HitlCoordinator, InterventionOutcome, PauseClock};
use super::job::Job;
use crate::kernel::rate_limit::RateLimiter;
use crate::kernel::sessions::SessionStore;

/// What a handler produced on success.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub result_data: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub screenshot_urls: Vec<String>,
    pub final_mode: Option<String>,
}

impl JobOutcome {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            result_summary: Some(summary.into()),
            ..Default::default()
        }
    }
}

/// Read-only view of the job plus the callbacks a handler may use to
/// mutate progress.
pub struct JobContext {
    job: Job,
    worker_id: String,
    pool: PgPool,
    recorder: ProgressRecorder,
    hitl: Arc<HitlCoordinator>,
    cancel: CancellationToken,
    pause_clock: PauseClock,
    sessions: Option<Arc<SessionStore>>,
    rate_limiter: Arc<RateLimiter>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: Job,
        worker_id: String,
        pool: PgPool,
        recorder: ProgressRecorder,
        hitl: Arc<HitlCoordinator>,
        cancel: CancellationToken,
        pause_clock: PauseClock,
        sessions: Option<Arc<SessionStore>>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            job,
            worker_id,
            pool,
            recorder,
            hitl,
            cancel,
            pause_clock,
            sessions,
            rate_limiter,
        }
    }

    /// Snapshot of the job row as claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once an external cancel or the wall-clock deadline fired.
    /// Handlers should check this at their cooperative checkpoints.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Session store, when this deployment carries an encryption key.
    pub fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_deref()
    }

    /// Shared admission counters for per-user and per-platform quotas.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Append a progress event to the job's log.
    pub async fn record(
        &self,
        event_type: &str,
        message: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.recorder
            .record(self.job.id, event_type, message, metadata)
            .await?;
        Ok(())
    }

    /// Accumulate LLM/action cost onto the job row.
    pub async fn add_cost(&self, cents: i64, actions: i64, tokens: i64) -> anyhow::Result<()> {
        self.recorder
            .add_cost(self.job.id, cents, actions, tokens)
            .await
    }

    /// Pause this job on a human-gated obstacle and wait for resolution.
    ///
    /// Pause time does not count against the job's wall-clock budget.
    pub async fn request_human_intervention(
        &self,
        blocker: Blocker,
    ) -> anyhow::Result<InterventionOutcome> {
        self.hitl
            .request_human_intervention(
                self.job.id,
                &self.worker_id,
                blocker,
                &self.pause_clock,
                &self.cancel,
            )
            .await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// The opaque per-job-type work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError>;
}

/// Static map from `job_type` to handler.
///
/// Unknown types fail the job rather than panicking the worker.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedHandlerRegistry = Arc<HandlerRegistry>;
