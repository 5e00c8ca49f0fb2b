//! Per-job execution lifecycle.
//!
//! One executor invocation owns a claimed job from `queued -> running`
//! through its terminal commit. Four concerns interleave here: the handler
//! itself, a heartbeat that doubles as the cancel observer, a wall-clock
//! deadline that excludes paused intervals, and HITL routing for
//! human-gated blockers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{ErrorCode, ErrorPolicy, HandlerError};
use super::events::ProgressRecorder;
use super::hitl::{Blocker, BlockerType, HitlCoordinator, InterventionOutcome, PauseClock};
use super::job::{Job, JobStatus};
use super::registry::{JobContext, JobOutcome, SharedHandlerRegistry};
use crate::kernel::callbacks::{CallbackPayload, CallbackStatus};
use crate::kernel::FleetDeps;

/// How one execution attempt ended, before the terminal commit.
enum Attempt {
    Success(JobOutcome),
    Retry(ErrorCode, String),
    Fatal(ErrorCode, String),
    /// The HITL coordinator already committed `failed`/`hitl_timeout`.
    HitlTimedOut,
    Cancelled,
    DeadlineExceeded,
}

pub struct JobExecutor {
    deps: FleetDeps,
    registry: SharedHandlerRegistry,
    hitl: Arc<HitlCoordinator>,
    recorder: ProgressRecorder,
    worker_id: String,
    heartbeat_interval: Duration,
}

impl JobExecutor {
    pub fn new(
        deps: FleetDeps,
        registry: SharedHandlerRegistry,
        hitl: Arc<HitlCoordinator>,
        worker_id: String,
        heartbeat_interval: Duration,
    ) -> Self {
        let recorder = ProgressRecorder::new(deps.db_pool.clone());
        Self {
            deps,
            registry,
            hitl,
            recorder,
            worker_id,
            heartbeat_interval,
        }
    }

    /// Execute one claimed job to a terminal state. Never panics the
    /// worker; failures are committed to the row and logged.
    pub async fn run(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        if let Err(e) = self.run_inner(job).await {
            // A commit error here means we may no longer own the row; the
            // lease expires and reclamation returns the job to the queue.
            error!(
                job_id = %job_id,
                job_type = %job_type,
                error = %e,
                "job execution aborted; lease left to expire"
            );
        }
    }

    async fn run_inner(&self, claimed: Job) -> Result<()> {
        let pool = &self.deps.db_pool;

        let Some(job) = Job::mark_running(claimed.id, &self.worker_id, pool).await? else {
            // Lost queued -> running: an external cancel beat us to the row.
            if let Some(job) = Job::find_by_id(claimed.id, pool).await? {
                if job.status == JobStatus::Cancelled {
                    self.emit_cancelled(&job).await;
                }
            }
            return Ok(());
        };

        info!(job_id = %job.id, job_type = %job.job_type, "job started");
        self.recorder
            .record(
                job.id,
                "job_started",
                "Execution started",
                serde_json::json!({ "worker_id": self.worker_id, "attempt": job.retry_count + 1 }),
            )
            .await?;

        let payload = CallbackPayload::for_job(&job, CallbackStatus::Running);
        self.deps.dispatcher.emit(&job, &payload).await;

        // Job-level abort switch: flipped by an external cancel (seen by the
        // heartbeat) or the wall-clock deadline.
        let cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job.id, cancel.clone());

        let pause_clock = PauseClock::new();
        let started = Instant::now();
        let budget = Duration::from_secs(job.timeout_seconds.max(0) as u64);

        let ctx = JobContext::new(
            job.clone(),
            self.worker_id.clone(),
            pool.clone(),
            self.recorder.clone(),
            Arc::clone(&self.hitl),
            cancel.clone(),
            pause_clock.clone(),
            self.deps.sessions.clone(),
            Arc::clone(&self.deps.rate_limiter),
        );

        let attempt = self
            .drive_handler(&job, &ctx, &pause_clock, &cancel, started, budget)
            .await;

        let result = self.commit(&job, attempt).await;

        heartbeat.stop().await;
        result
    }

    /// Run the handler to one of the [`Attempt`] ends, re-entering it after
    /// successful human interventions.
    async fn drive_handler(
        &self,
        job: &Job,
        ctx: &JobContext,
        pause_clock: &PauseClock,
        cancel: &CancellationToken,
        started: Instant,
        budget: Duration,
    ) -> Attempt {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Attempt::Fatal(
                ErrorCode::UnknownHandler,
                format!("no handler registered for job type '{}'", job.job_type),
            );
        };

        loop {
            let error = tokio::select! {
                res = handler.execute(ctx) => match res {
                    Ok(outcome) => return Attempt::Success(outcome),
                    Err(error) => error,
                },
                _ = deadline_expired(pause_clock, started, budget) => {
                    // Abort the handler at its next await point.
                    cancel.cancel();
                    return Attempt::DeadlineExceeded;
                }
                _ = cancel.cancelled() => return Attempt::Cancelled,
            };

            let code = error.code();
            let message = error.message();
            debug!(job_id = %job.id, code = code.as_str(), %message, "handler returned error");

            match code.policy() {
                ErrorPolicy::HitlEligible => {
                    let blocker_type = BlockerType::from_error_code(code)
                        .unwrap_or(BlockerType::Verification);
                    let blocker = Blocker {
                        blocker_type,
                        screenshot_url: None,
                        page_url: Some(job.target_url.clone()),
                        timeout: None,
                    };
                    match self
                        .hitl
                        .request_human_intervention(
                            job.id,
                            &self.worker_id,
                            blocker,
                            pause_clock,
                            cancel,
                        )
                        .await
                    {
                        Ok(InterventionOutcome::Resumed) => continue,
                        Ok(InterventionOutcome::TimedOut) => return Attempt::HitlTimedOut,
                        Ok(InterventionOutcome::Cancelled) => return Attempt::Cancelled,
                        Err(e) => {
                            return Attempt::Fatal(
                                ErrorCode::InternalError,
                                format!("human intervention failed: {e}"),
                            )
                        }
                    }
                }
                ErrorPolicy::Retryable => return Attempt::Retry(code, message),
                ErrorPolicy::Fatal => return Attempt::Fatal(code, message),
            }
        }
    }

    async fn commit(&self, job: &Job, attempt: Attempt) -> Result<()> {
        let pool = &self.deps.db_pool;

        match attempt {
            Attempt::Success(outcome) => {
                let committed = Job::mark_completed(
                    job.id,
                    &self.worker_id,
                    outcome.result_data.as_ref(),
                    outcome.result_summary.as_deref(),
                    &outcome.screenshot_urls,
                    outcome.final_mode.as_deref(),
                    pool,
                )
                .await?;

                match committed {
                    Some(done) => {
                        info!(job_id = %done.id, "job completed");
                        self.recorder
                            .record(done.id, "job_completed", "Execution succeeded", serde_json::json!({}))
                            .await?;
                        let payload = CallbackPayload::for_job(&done, CallbackStatus::Completed);
                        self.deps.dispatcher.emit(&done, &payload).await;
                    }
                    None => self.reconcile_lost_commit(job.id).await?,
                }
            }

            Attempt::Retry(code, message) => {
                // Exponential backoff through scheduled_at; the claim filter
                // enforces the delay.
                let backoff = 2i64.pow(job.retry_count.min(12) as u32).min(3600);
                let retried = Job::retry_to_pending(
                    job.id,
                    &self.worker_id,
                    backoff,
                    code,
                    &message,
                    pool,
                )
                .await?;

                match retried {
                    Some(retried) => {
                        warn!(
                            job_id = %retried.id,
                            code = code.as_str(),
                            retry_count = retried.retry_count,
                            backoff_seconds = backoff,
                            "job returned to queue for retry"
                        );
                        self.recorder
                            .record(
                                retried.id,
                                "job_retried",
                                &message,
                                serde_json::json!({
                                    "error_code": code.as_str(),
                                    "retry_count": retried.retry_count,
                                    "backoff_seconds": backoff,
                                }),
                            )
                            .await?;
                    }
                    // Retries exhausted (or the row moved); fail it.
                    None => self.fail(job, code, &message).await?,
                }
            }

            Attempt::Fatal(code, message) => self.fail(job, code, &message).await?,

            Attempt::HitlTimedOut => {
                // Terminal commit and callback already done by the
                // coordinator.
                self.recorder
                    .record(
                        job.id,
                        "job_failed",
                        "Human intervention window expired",
                        serde_json::json!({ "error_code": ErrorCode::HitlTimeout.as_str() }),
                    )
                    .await?;
            }

            Attempt::Cancelled => {
                if let Some(current) = Job::find_by_id(job.id, pool).await? {
                    if current.status == JobStatus::Cancelled {
                        self.recorder
                            .record(job.id, "job_cancelled", "Cancelled externally", serde_json::json!({}))
                            .await?;
                        self.emit_cancelled(&current).await;
                    }
                }
            }

            Attempt::DeadlineExceeded => {
                self.fail(
                    job,
                    ErrorCode::Timeout,
                    &format!("wall-clock budget of {}s exhausted", job.timeout_seconds),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn fail(&self, job: &Job, code: ErrorCode, message: &str) -> Result<()> {
        let details = serde_json::json!({ "message": message });
        let failed = Job::mark_failed(
            job.id,
            &self.worker_id,
            JobStatus::Running,
            code,
            message,
            &details,
            &self.deps.db_pool,
        )
        .await?;

        match failed {
            Some(failed) => {
                warn!(job_id = %failed.id, code = code.as_str(), %message, "job failed");
                self.recorder
                    .record(
                        failed.id,
                        "job_failed",
                        message,
                        serde_json::json!({ "error_code": code.as_str() }),
                    )
                    .await?;
                let payload = CallbackPayload::for_job(&failed, CallbackStatus::Failed)
                    .with_error(code.as_str(), message);
                self.deps.dispatcher.emit(&failed, &payload).await;
            }
            None => self.reconcile_lost_commit(job.id).await?,
        }
        Ok(())
    }

    /// A guarded terminal commit matched zero rows: the only writer that
    /// can take the row from us mid-run is an external cancel.
    async fn reconcile_lost_commit(&self, job_id: uuid::Uuid) -> Result<()> {
        match Job::find_by_id(job_id, &self.deps.db_pool).await? {
            Some(current) if current.status == JobStatus::Cancelled => {
                self.recorder
                    .record(job_id, "job_cancelled", "Cancelled externally", serde_json::json!({}))
                    .await?;
                self.emit_cancelled(&current).await;
            }
            Some(current) => {
                warn!(job_id = %job_id, status = ?current.status, "terminal commit lost a race");
            }
            None => warn!(job_id = %job_id, "job row disappeared before terminal commit"),
        }
        Ok(())
    }

    async fn emit_cancelled(&self, job: &Job) {
        let payload = CallbackPayload::for_job(job, CallbackStatus::Cancelled);
        self.deps.dispatcher.emit(job, &payload).await;
    }

    /// Heartbeat the job lease every interval. Doubles as the cancel
    /// observer: an externally written `cancelled` status flips the job's
    /// abort token at the next beat.
    fn spawn_heartbeat(&self, job_id: uuid::Uuid, cancel: CancellationToken) -> HeartbeatGuard {
        let pool = self.deps.db_pool.clone();
        let worker_id = self.worker_id.clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let interval = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        match Job::heartbeat(job_id, &worker_id, &pool).await {
                            Ok(Some(JobStatus::Cancelled)) => {
                                info!(job_id = %job_id, "observed external cancel");
                                cancel.cancel();
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                // The lease moved; stop touching the row and
                                // abort whatever is still running here.
                                warn!(job_id = %job_id, "lost job lease");
                                cancel.cancel();
                                break;
                            }
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "job heartbeat failed");
                            }
                        }
                    }
                }
            }
        });

        HeartbeatGuard {
            stop,
            handle: Some(handle),
        }
    }
}

struct HeartbeatGuard {
    stop: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatGuard {
    async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// The executor future can be dropped mid-job (drain abort); the heartbeat
// must stop with it or it would keep a dead job's lease fresh forever.
impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Resolves when the active (non-paused) execution time exceeds `budget`.
async fn deadline_expired(pause_clock: &PauseClock, started: Instant, budget: Duration) {
    loop {
        let active = started.elapsed().saturating_sub(pause_clock.paused_total());
        if active >= budget {
            return;
        }
        let remaining = budget - active;
        tokio::time::sleep(remaining.min(Duration::from_millis(500))).await;
    }
}
