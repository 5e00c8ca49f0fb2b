//! Lifecycle callbacks to the external orchestrator.
//!
//! One POST per committed transition, at-least-once. The dispatcher is
//! invoked synchronously at the transition point, so per-job ordering
//! follows commit order and needs no extra machinery. Delivery failures
//! are logged and never change job state — the job row is canonical.

use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::jobs::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Running,
    NeedsHuman,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackCost {
    pub total_cost_usd: f64,
    pub action_count: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackInteraction {
    #[serde(rename = "type")]
    pub interaction_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Wire payload shared by every callback type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub status: CallbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CallbackCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction: Option<CallbackInteraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_mode: Option<String>,
}

impl CallbackPayload {
    /// Base payload for a job at a given transition. Callers fill in the
    /// transition-specific fields.
    pub fn for_job(job: &Job, status: CallbackStatus) -> Self {
        Self {
            job_id: job.id,
            external_task_id: job.external_task_id.clone(),
            worker_id: job.worker_id.clone(),
            status,
            completed_at: job.completed_at,
            result_summary: job.result_summary.clone(),
            cost: Some(CallbackCost {
                total_cost_usd: job.cost_usd(),
                action_count: job.action_count,
                total_tokens: job.total_tokens,
            }),
            interaction: None,
            error_code: job.error_code.clone(),
            error_message: None,
            execution_mode: job.execution_mode.clone(),
            final_mode: job.final_mode.clone(),
        }
    }

    pub fn with_interaction(mut self, interaction: CallbackInteraction) -> Self {
        self.interaction = Some(interaction);
        self
    }

    pub fn with_error(mut self, code: &str, message: &str) -> Self {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

/// HTTP dispatcher with capped-exponential retry.
pub struct CallbackDispatcher {
    client: Client,
    /// Prefix for relative callback URLs (test deployments).
    base_url: Option<String>,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl CallbackDispatcher {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }

    /// Shorten the retry schedule; integration tests use this to avoid
    /// multi-second waits.
    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    fn resolve_url(&self, callback_url: &str) -> String {
        if callback_url.starts_with("http://") || callback_url.starts_with("https://") {
            return callback_url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), callback_url.trim_start_matches('/')),
            None => callback_url.to_string(),
        }
    }

    /// Deliver one callback if the job has a callback URL.
    ///
    /// At-least-once: 5xx and transport errors are retried up to
    /// `max_attempts`, 4xx is final. A delivery failure is logged but does
    /// not surface to the caller's state machine.
    pub async fn emit(&self, job: &Job, payload: &CallbackPayload) {
        let Some(callback_url) = &job.callback_url else {
            return;
        };
        let url = self.resolve_url(callback_url);

        match self.post_with_retry(&url, payload).await {
            Ok(()) => {
                info!(job_id = %job.id, status = ?payload.status, "delivered callback");
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    status = ?payload.status,
                    error = %e,
                    "callback delivery failed; job state is unaffected"
                );
            }
        }
    }

    async fn post_with_retry(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        let mut backoff = self.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let sent = self
                .client
                .post(url)
                .json(payload)
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match sent {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_client_error() => {
                    // The receiver rejected the payload; retrying cannot help.
                    return Err(anyhow!("callback rejected with {}", response.status()));
                }
                Ok(response) => {
                    warn!(url, attempt, status = %response.status(), "callback attempt failed");
                    last_error = Some(anyhow!("server error {}", response.status()));
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "callback attempt failed");
                    last_error = Some(e.into());
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("callback delivery failed")))
    }
}
