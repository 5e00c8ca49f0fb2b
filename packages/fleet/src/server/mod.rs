//! Status read API.
//!
//! Library-provided router consumed by a side process; the worker binary
//! itself never serves HTTP. Reads come straight off the job row — the
//! same fields the Progress Recorder maintains.

pub mod routes;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
}

/// Build the status API router.
pub fn router(db_pool: PgPool) -> Router {
    Router::new()
        .route("/health", get(routes::health_handler))
        .route("/jobs/:job_id/status", get(routes::job_status_handler))
        .route("/jobs/:job_id/resume", post(routes::job_resume_handler))
        .route("/jobs/:job_id/cancel", post(routes::job_cancel_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { db_pool })
}
