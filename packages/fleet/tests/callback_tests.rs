//! Callback dispatcher tests: per-job ordering across a full lifecycle,
//! retry on server errors, and giving up on client errors.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use common::{insert_job, job, registry_with, BlockOnceHandler, OkHandler, TestHarness};
use fleet_core::kernel::jobs::{Job, JobStatus, WorkerRuntime};
use fleet_core::kernel::{CallbackDispatcher, CallbackPayload, CallbackStatus};
use test_context::test_context;
use tokio::sync::Mutex;

/// Records every callback body it receives; can be told to fail the first
/// N requests with a given status.
#[derive(Clone)]
struct Receiver {
    received: Arc<Mutex<Vec<serde_json::Value>>>,
    attempts: Arc<AtomicU32>,
    fail_first: u32,
    fail_status: StatusCode,
}

impl Receiver {
    fn new(fail_first: u32, fail_status: StatusCode) -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicU32::new(0)),
            fail_first,
            fail_status,
        }
    }

    async fn statuses(&self) -> Vec<String> {
        self.received
            .lock()
            .await
            .iter()
            .map(|body| body["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

async fn hook(
    State(receiver): State<Receiver>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let attempt = receiver.attempts.fetch_add(1, Ordering::SeqCst);
    if attempt < receiver.fail_first {
        return receiver.fail_status;
    }
    receiver.received.lock().await.push(body);
    StatusCode::OK
}

/// Bind a recording receiver on an ephemeral port; returns its URL.
async fn spawn_receiver(receiver: Receiver) -> String {
    let app = Router::new()
        .route("/hooks/valet", post(hook))
        .with_state(receiver);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind receiver");
    let addr = listener.local_addr().expect("receiver addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve receiver");
    });
    format!("http://{addr}/hooks/valet")
}

async fn wait_for_status(ctx: &TestHarness, id: uuid::Uuid, status: JobStatus) -> bool {
    ctx.wait_for(Duration::from_secs(15), || async {
        Job::find_by_id(id, &ctx.db_pool)
            .await
            .expect("read job")
            .expect("job exists")
            .status
            == status
    })
    .await
}

// =============================================================================
// Lifecycle ordering
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn happy_path_emits_running_then_completed(ctx: &TestHarness) {
    let receiver = Receiver::new(0, StatusCode::OK);
    let url = spawn_receiver(receiver.clone()).await;

    let mut j = job("user-1");
    j.callback_url = Some(url);
    j.external_task_id = Some("valet-1".to_string());
    let inserted = insert_job(&ctx.db_pool, j).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(OkHandler)),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Completed).await);
    assert!(
        ctx.wait_for(Duration::from_secs(5), || async {
            receiver.statuses().await.len() >= 2
        })
        .await
    );

    assert_eq!(receiver.statuses().await, vec!["running", "completed"]);
    let bodies = receiver.received.lock().await;
    for body in bodies.iter() {
        assert_eq!(body["job_id"], inserted.id.to_string());
        assert_eq!(body["external_task_id"], "valet-1");
        assert_eq!(body["worker_id"], "w1");
    }
    // The terminal callback carries the cost block.
    let done = bodies.last().unwrap();
    assert!(done["cost"]["total_cost_usd"].is_number());
    assert_eq!(done["result_summary"], "Application submitted");
    drop(bodies);

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn hitl_lifecycle_emits_in_transition_order(ctx: &TestHarness) {
    let receiver = Receiver::new(0, StatusCode::OK);
    let url = spawn_receiver(receiver.clone()).await;

    let mut j = job("user-1");
    j.callback_url = Some(url);
    let inserted = insert_job(&ctx.db_pool, j).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(BlockOnceHandler::default())),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Paused).await);
    Job::mark_resumed(inserted.id, "solved", &ctx.db_pool)
        .await
        .unwrap()
        .expect("resumed");
    assert!(wait_for_status(ctx, inserted.id, JobStatus::Completed).await);
    assert!(
        ctx.wait_for(Duration::from_secs(5), || async {
            receiver.statuses().await.len() >= 4
        })
        .await
    );

    assert_eq!(
        receiver.statuses().await,
        vec!["running", "needs_human", "resumed", "completed"]
    );

    // The pause callback describes the blocker.
    let bodies = receiver.received.lock().await;
    let needs_human = &bodies[1];
    assert_eq!(needs_human["interaction"]["type"], "captcha");
    assert!(needs_human["interaction"]["timeout_seconds"].is_number());
    drop(bodies);

    handle.shutdown().await.expect("shutdown");
}

// =============================================================================
// Delivery semantics (dispatcher alone, no database)
// =============================================================================

fn callback_job(url: String) -> Job {
    let mut j = job("user-1");
    j.callback_url = Some(url);
    j.worker_id = Some("w1".to_string());
    j
}

#[tokio::test]
async fn server_errors_are_retried_until_delivery() {
    let receiver = Receiver::new(2, StatusCode::INTERNAL_SERVER_ERROR);
    let url = spawn_receiver(receiver.clone()).await;

    let dispatcher = CallbackDispatcher::new(None).with_backoff(Duration::from_millis(10));
    let j = callback_job(url);
    let payload = CallbackPayload::for_job(&j, CallbackStatus::Completed);
    dispatcher.emit(&j, &payload).await;

    // Two 500s burned, third attempt landed.
    assert_eq!(receiver.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(receiver.statuses().await, vec!["completed"]);
}

#[tokio::test]
async fn client_errors_are_final() {
    let receiver = Receiver::new(u32::MAX, StatusCode::NOT_FOUND);
    let url = spawn_receiver(receiver.clone()).await;

    let dispatcher = CallbackDispatcher::new(None).with_backoff(Duration::from_millis(10));
    let j = callback_job(url);
    let payload = CallbackPayload::for_job(&j, CallbackStatus::Failed);
    dispatcher.emit(&j, &payload).await;

    // One attempt, no retries.
    assert_eq!(receiver.attempts.load(Ordering::SeqCst), 1);
    assert!(receiver.statuses().await.is_empty());
}

#[tokio::test]
async fn retries_exhaust_without_panicking() {
    let receiver = Receiver::new(u32::MAX, StatusCode::INTERNAL_SERVER_ERROR);
    let url = spawn_receiver(receiver.clone()).await;

    let dispatcher = CallbackDispatcher::new(None).with_backoff(Duration::from_millis(10));
    let j = callback_job(url);
    let payload = CallbackPayload::for_job(&j, CallbackStatus::Completed);
    dispatcher.emit(&j, &payload).await;

    assert_eq!(receiver.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unreachable_receivers_do_not_affect_the_caller() {
    // Nothing listens on this port.
    let dispatcher = CallbackDispatcher::new(None).with_backoff(Duration::from_millis(10));
    let j = callback_job("http://127.0.0.1:1/hooks/valet".to_string());
    let payload = CallbackPayload::for_job(&j, CallbackStatus::Completed);
    // Must return, not panic or propagate.
    dispatcher.emit(&j, &payload).await;
}

#[tokio::test]
async fn jobs_without_callback_url_emit_nothing() {
    let receiver = Receiver::new(0, StatusCode::OK);
    let _url = spawn_receiver(receiver.clone()).await;

    let dispatcher = CallbackDispatcher::new(None);
    let j = job("user-1"); // no callback_url
    let payload = CallbackPayload::for_job(&j, CallbackStatus::Completed);
    dispatcher.emit(&j, &payload).await;

    assert_eq!(receiver.attempts.load(Ordering::SeqCst), 0);
}
