//! Operator-facing job status reads and the resume/cancel write endpoints.
//!
//! The resume endpoint is the standard publisher for the `job_resume`
//! channel: its guarded `paused -> running` UPDATE fires the database
//! trigger, which is what waiting workers listen on.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::kernel::jobs::Job;
use crate::server::AppState;

/// Job row plus the `manual` provenance block carved out of `metadata`.
#[derive(Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    job: Job,
    manual: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

fn error_body(error: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: error.to_string(),
    })
}

/// GET /jobs/:id/status
pub async fn job_status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let job = Job::find_by_id(job_id, &state.db_pool).await.map_err(|e| {
        error!(job_id = %job_id, error = %e, "status read failed");
        (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal"))
    })?;

    let Some(job) = job else {
        return Err((StatusCode::NOT_FOUND, error_body("not_found")));
    };

    let manual = job.metadata.get("manual").cloned();
    Ok(Json(JobStatusResponse { job, manual }))
}

#[derive(Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub status_message: Option<String>,
}

#[derive(Serialize)]
pub struct ResumeResponse {
    resumed: bool,
}

/// POST /jobs/:id/resume
///
/// Conditional `paused -> running`; a second resume for the same job is a
/// no-op reported as a conflict.
pub async fn job_resume_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ResumeRequest>>,
) -> Result<Json<ResumeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let message = body
        .and_then(|Json(req)| req.status_message)
        .unwrap_or_else(|| "Resumed by operator".to_string());

    let resumed = Job::mark_resumed(job_id, &message, &state.db_pool)
        .await
        .map_err(|e| {
            error!(job_id = %job_id, error = %e, "resume failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal"))
        })?;

    match resumed {
        Some(_) => Ok(Json(ResumeResponse { resumed: true })),
        None => Err((StatusCode::CONFLICT, error_body("not_paused"))),
    }
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    cancelled: bool,
}

/// POST /jobs/:id/cancel
pub async fn job_cancel_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<CancelResponse>, (StatusCode, Json<ErrorResponse>)> {
    let reason = body.and_then(|Json(req)| req.reason);

    let cancelled = Job::mark_cancelled(job_id, reason.as_deref(), &state.db_pool)
        .await
        .map_err(|e| {
            error!(job_id = %job_id, error = %e, "cancel failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal"))
        })?;

    if cancelled {
        Ok(Json(CancelResponse { cancelled: true }))
    } else {
        Err((StatusCode::CONFLICT, error_body("not_cancellable")))
    }
}
