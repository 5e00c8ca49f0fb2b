//! Human-in-the-loop coordination.
//!
//! When a handler hits a human-gated obstacle the job is parked in
//! `paused` and the coordinator waits for an external resume: a NOTIFY on
//! the `job_resume` channel (published by a trigger on every
//! `paused -> running` transition) raced against a 2s row poll. Either
//! path alone converges; deployments without LISTEN support simply degrade
//! to polling. The wait is bounded by the blocker's timeout, and a cancel
//! always wins over a resume.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::errors::ErrorCode;
use super::events::ProgressRecorder;
use super::job::{Job, JobStatus};
use crate::kernel::browser::BrowserAdapter;
use crate::kernel::callbacks::{
    CallbackDispatcher, CallbackInteraction, CallbackPayload, CallbackStatus,
};

pub const RESUME_CHANNEL: &str = "job_resume";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerType {
    Captcha,
    Login,
    #[serde(rename = "2fa")]
    TwoFactor,
    BotCheck,
    RateLimited,
    Verification,
}

impl BlockerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerType::Captcha => "captcha",
            BlockerType::Login => "login",
            BlockerType::TwoFactor => "2fa",
            BlockerType::BotCheck => "bot_check",
            BlockerType::RateLimited => "rate_limited",
            BlockerType::Verification => "verification",
        }
    }

    /// Blocker raised by a classified handler error, if the code is
    /// human-gated.
    pub fn from_error_code(code: ErrorCode) -> Option<Self> {
        match code {
            ErrorCode::CaptchaBlocked => Some(BlockerType::Captcha),
            ErrorCode::LoginRequired => Some(BlockerType::Login),
            ErrorCode::TwofaRequired => Some(BlockerType::TwoFactor),
            ErrorCode::BotCheck => Some(BlockerType::BotCheck),
            ErrorCode::RateLimited => Some(BlockerType::RateLimited),
            ErrorCode::VerificationRequired => Some(BlockerType::Verification),
            _ => None,
        }
    }
}

/// A human-gated obstacle reported by a handler.
#[derive(Debug, Clone)]
pub struct Blocker {
    pub blocker_type: BlockerType,
    pub screenshot_url: Option<String>,
    pub page_url: Option<String>,
    /// Overrides the coordinator's default pause budget.
    pub timeout: Option<Duration>,
}

impl Blocker {
    pub fn new(blocker_type: BlockerType) -> Self {
        Self {
            blocker_type,
            screenshot_url: None,
            page_url: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionOutcome {
    Resumed,
    TimedOut,
    Cancelled,
}

/// Tracks time spent paused so the wall-clock deadline can exclude it.
///
/// Shared between the executor's deadline watcher and the coordinator.
#[derive(Clone, Default)]
pub struct PauseClock {
    inner: Arc<Mutex<PauseClockState>>,
}

#[derive(Default)]
struct PauseClockState {
    paused_total: Duration,
    pause_started: Option<Instant>,
}

impl PauseClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.pause_started.is_none() {
            state.pause_started = Some(Instant::now());
        }
    }

    pub fn end(&self) {
        let mut state = self.inner.lock().unwrap();
        if let Some(started) = state.pause_started.take() {
            state.paused_total += started.elapsed();
        }
    }

    /// Total paused time, including an in-progress pause.
    pub fn paused_total(&self) -> Duration {
        let state = self.inner.lock().unwrap();
        let in_progress = state
            .pause_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        state.paused_total + in_progress
    }
}

/// Coordinates pause, resume-wait, and timeout for one worker process.
pub struct HitlCoordinator {
    pool: PgPool,
    browser: Arc<dyn BrowserAdapter>,
    dispatcher: Arc<CallbackDispatcher>,
    recorder: ProgressRecorder,
    default_timeout: Duration,
    poll_interval: Duration,
}

impl HitlCoordinator {
    pub fn new(
        pool: PgPool,
        browser: Arc<dyn BrowserAdapter>,
        dispatcher: Arc<CallbackDispatcher>,
        default_timeout: Duration,
    ) -> Self {
        let recorder = ProgressRecorder::new(pool.clone());
        Self {
            pool,
            browser,
            dispatcher,
            recorder,
            default_timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Shorten the poll cadence; integration tests use this.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Park the job and wait for a human.
    ///
    /// Returns `Resumed` when an external actor transitions the row back to
    /// `running`, `TimedOut` after committing `failed`/`hitl_timeout`, or
    /// `Cancelled` when a cancel pre-empts the wait (no `resumed` callback
    /// is emitted in that case).
    pub async fn request_human_intervention(
        &self,
        job_id: Uuid,
        worker_id: &str,
        blocker: Blocker,
        pause_clock: &PauseClock,
        cancel: &CancellationToken,
    ) -> Result<InterventionOutcome> {
        let timeout = blocker.timeout.unwrap_or(self.default_timeout);

        // Freeze the page before the row flips; a racing resume must not
        // act on a half-paused driver.
        self.browser.pause().await?;

        let interaction_data = serde_json::json!({
            "type": blocker.blocker_type.as_str(),
            "screenshot_url": blocker.screenshot_url,
            "page_url": blocker.page_url,
            "timeout_seconds": timeout.as_secs(),
        });

        let paused = Job::mark_paused(
            job_id,
            worker_id,
            blocker.blocker_type.as_str(),
            &interaction_data,
            &self.pool,
        )
        .await?;

        let Some(paused) = paused else {
            // Lost the running -> paused race; an external cancel is the
            // only writer that can win it.
            self.browser.resume().await?;
            return Ok(InterventionOutcome::Cancelled);
        };

        pause_clock.begin();
        info!(
            job_id = %job_id,
            blocker = blocker.blocker_type.as_str(),
            timeout_seconds = timeout.as_secs(),
            "job paused for human intervention"
        );
        self.recorder
            .record(
                job_id,
                "job_paused",
                &format!("Waiting for human: {}", blocker.blocker_type.as_str()),
                interaction_data.clone(),
            )
            .await?;

        let payload = CallbackPayload::for_job(&paused, CallbackStatus::NeedsHuman)
            .with_interaction(CallbackInteraction {
                interaction_type: blocker.blocker_type.as_str().to_string(),
                screenshot_url: blocker.screenshot_url.clone(),
                page_url: blocker.page_url.clone(),
                timeout_seconds: Some(timeout.as_secs()),
            });
        self.dispatcher.emit(&paused, &payload).await;

        let outcome = self
            .wait_for_resume(job_id, timeout, cancel)
            .await
            .context("resume wait failed")?;

        match outcome {
            WaitResult::Resumed(job) => {
                pause_clock.end();
                self.browser.resume().await?;
                self.recorder
                    .record(job_id, "job_resumed", "Resumed by human", serde_json::json!({}))
                    .await?;
                let payload = CallbackPayload::for_job(&job, CallbackStatus::Resumed);
                self.dispatcher.emit(&job, &payload).await;
                info!(job_id = %job_id, "job resumed by human");
                Ok(InterventionOutcome::Resumed)
            }
            WaitResult::Cancelled => {
                pause_clock.end();
                Ok(InterventionOutcome::Cancelled)
            }
            WaitResult::TimedOut => {
                pause_clock.end();
                let details = serde_json::json!({
                    "blocker_type": blocker.blocker_type.as_str(),
                });
                let failed = Job::mark_failed(
                    job_id,
                    worker_id,
                    JobStatus::Paused,
                    ErrorCode::HitlTimeout,
                    "Human intervention window expired",
                    &details,
                    &self.pool,
                )
                .await?;

                match failed {
                    Some(job) => {
                        let payload = CallbackPayload::for_job(&job, CallbackStatus::Failed)
                            .with_error(
                                ErrorCode::HitlTimeout.as_str(),
                                "Human intervention window expired",
                            );
                        self.dispatcher.emit(&job, &payload).await;
                        Ok(InterventionOutcome::TimedOut)
                    }
                    // The row left `paused` at the very edge of the window.
                    None => match Job::find_by_id(job_id, &self.pool).await? {
                        Some(job) if job.status == JobStatus::Running => {
                            self.browser.resume().await?;
                            let payload =
                                CallbackPayload::for_job(&job, CallbackStatus::Resumed);
                            self.dispatcher.emit(&job, &payload).await;
                            Ok(InterventionOutcome::Resumed)
                        }
                        _ => Ok(InterventionOutcome::Cancelled),
                    },
                }
            }
        }
    }

    /// Race LISTEN/NOTIFY against row polling until resume, cancel, or
    /// timeout. Duplicate notifications collapse into the idempotent row
    /// check.
    async fn wait_for_resume(
        &self,
        job_id: Uuid,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitResult> {
        let deadline = Instant::now() + timeout;
        let job_id_text = job_id.to_string();

        let mut listener = match PgListener::connect_with(&self.pool).await {
            Ok(mut l) => match l.listen(RESUME_CHANNEL).await {
                Ok(()) => Some(l),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "LISTEN failed; falling back to polling");
                    None
                }
            },
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "listener unavailable; falling back to polling");
                None
            }
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(WaitResult::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitResult::TimedOut);
            }

            // Sleep until a notification, the next poll tick, the deadline,
            // or a cancel — whichever comes first.
            let tick = deadline.min(now + self.poll_interval);
            let mut drop_listener = false;
            match listener.as_mut() {
                Some(l) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        received = tokio::time::timeout_at(tick, l.recv()) => {
                            match received {
                                Ok(Ok(notification)) => {
                                    if notification.payload() != job_id_text {
                                        // Someone else's resume; keep waiting
                                        // without burning a poll tick.
                                        continue;
                                    }
                                }
                                Ok(Err(e)) => {
                                    warn!(job_id = %job_id, error = %e,
                                        "listener dropped; polling only");
                                    drop_listener = true;
                                }
                                Err(_) => {}
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep_until(tick) => {}
                    }
                }
            }
            if drop_listener {
                listener = None;
            }

            // Row check covers both the push and poll paths.
            let job = Job::find_by_id(job_id, &self.pool)
                .await?
                .context("paused job disappeared")?;
            match job.status {
                JobStatus::Running => return Ok(WaitResult::Resumed(job)),
                JobStatus::Cancelled => return Ok(WaitResult::Cancelled),
                JobStatus::Paused => {}
                other => {
                    warn!(job_id = %job_id, status = ?other, "pause ended unexpectedly");
                    return Ok(WaitResult::Cancelled);
                }
            }
        }
    }
}

enum WaitResult {
    Resumed(Job),
    Cancelled,
    TimedOut,
}
