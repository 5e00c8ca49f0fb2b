//! Test fixtures: job builders and canned handlers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::kernel::jobs::{
    ErrorCode, HandlerError, HandlerRegistry, Job, JobContext, JobHandler, JobOutcome,
    SharedHandlerRegistry,
};
use sqlx::PgPool;

pub const APPLY: &str = "apply_form";

/// A pending job ready to be claimed.
pub fn job(user_id: &str) -> Job {
    Job::builder()
        .job_type(APPLY)
        .target_url("https://boards.greenhouse.io/acme/jobs/1")
        .task_description("Fill out the application form")
        .user_id(user_id)
        .build()
}

pub async fn insert_job(pool: &PgPool, job: Job) -> Job {
    job.insert(pool).await.expect("Failed to insert job")
}

/// Registry with a single handler for the standard test job type.
pub fn registry_with(handler: Arc<dyn JobHandler>) -> SharedHandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(APPLY, handler);
    Arc::new(registry)
}

/// Succeeds immediately.
pub struct OkHandler;

#[async_trait]
impl JobHandler for OkHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        ctx.record("form_submitted", "Submitted application", serde_json::json!({}))
            .await
            .map_err(HandlerError::Other)?;
        ctx.add_cost(12, 3, 450).await.map_err(HandlerError::Other)?;
        Ok(JobOutcome::with_summary("Application submitted"))
    }
}

/// Fails every time with the given code.
pub struct FailingHandler {
    pub code: ErrorCode,
    pub message: &'static str,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        Err(HandlerError::coded(self.code, self.message))
    }
}

/// Fails `failures` times with a transient error, then succeeds.
pub struct FlakyHandler {
    remaining: AtomicU32,
}

impl FlakyHandler {
    pub fn failing(failures: u32) -> Self {
        Self {
            remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::coded(
                ErrorCode::NetworkError,
                "connection reset by peer",
            ));
        }
        Ok(JobOutcome::with_summary("Recovered after retry"))
    }
}

/// Reports a captcha once; succeeds after the human clears it.
pub struct BlockOnceHandler {
    blocks: AtomicU32,
}

impl Default for BlockOnceHandler {
    fn default() -> Self {
        Self {
            blocks: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl JobHandler for BlockOnceHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        if self
            .blocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::coded(
                ErrorCode::CaptchaBlocked,
                "page presented a reCAPTCHA challenge",
            ));
        }
        Ok(JobOutcome::with_summary("Submitted after captcha"))
    }
}

/// Runs far longer than any test budget; aborts at its await point.
pub struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<JobOutcome, HandlerError> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(JobOutcome::with_summary("Should never get here"))
    }
}
