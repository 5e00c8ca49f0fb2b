//! Worker runtime lifecycle tests: happy path, contention across workers,
//! retries, fatal errors, cancellation, and wall-clock timeouts.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    insert_job, job, registry_with, FailingHandler, FlakyHandler, OkHandler, SlowHandler,
    TestHarness,
};
use fleet_core::kernel::jobs::{
    ErrorCode, HandlerRegistry, Job, JobStatus, ProgressRecorder, WorkerRecord, WorkerRuntime,
    WorkerStatus,
};
use test_context::test_context;
use uuid::Uuid;

async fn status_of(ctx: &TestHarness, id: Uuid) -> JobStatus {
    Job::find_by_id(id, &ctx.db_pool)
        .await
        .expect("read job")
        .expect("job exists")
        .status
}

async fn wait_for_status(ctx: &TestHarness, id: Uuid, status: JobStatus) -> bool {
    ctx.wait_for(Duration::from_secs(15), || async {
        status_of(ctx, id).await == status
    })
    .await
}

#[test_context(TestHarness)]
#[tokio::test]
async fn happy_path_completes_and_records(ctx: &TestHarness) {
    let inserted = insert_job(&ctx.db_pool, job("user-1")).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(OkHandler)),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Completed).await);

    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.worker_id.as_deref(), Some("w1"));
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_some());
    assert_eq!(row.result_summary.as_deref(), Some("Application submitted"));
    // Handler-reported cost landed on the row.
    assert_eq!(row.llm_cost_cents, 12);
    assert_eq!(row.action_count, 3);
    assert_eq!(row.total_tokens, 450);

    let recorder = ProgressRecorder::new(ctx.db_pool.clone());
    let events: Vec<String> = recorder
        .events_for(inserted.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(events, vec!["job_started", "form_submitted", "job_completed"]);

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn two_workers_split_three_jobs(ctx: &TestHarness) {
    let mut ids = Vec::new();
    for user in ["a", "b", "c"] {
        ids.push(insert_job(&ctx.db_pool, job(user)).await.id);
    }

    let registry = registry_with(Arc::new(OkHandler));
    let w1 = WorkerRuntime::start(ctx.deps(), Arc::clone(&registry), ctx.worker_config("w1"))
        .await
        .expect("start w1");
    let w2 = WorkerRuntime::start(ctx.deps(), registry, ctx.worker_config("w2"))
        .await
        .expect("start w2");

    for id in &ids {
        assert!(wait_for_status(ctx, *id, JobStatus::Completed).await);
    }

    let mut owners = HashSet::new();
    for id in &ids {
        let row = Job::find_by_id(*id, &ctx.db_pool).await.unwrap().unwrap();
        owners.insert(row.worker_id.expect("owner recorded"));
    }
    assert!(owners.is_subset(&HashSet::from(["w1".to_string(), "w2".to_string()])));

    w1.shutdown().await.expect("shutdown w1");
    w2.shutdown().await.expect("shutdown w2");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unknown_job_type_fails_cleanly(ctx: &TestHarness) {
    let mut unknown = job("user-1");
    unknown.job_type = "telepathy".to_string();
    let inserted = insert_job(&ctx.db_pool, unknown).await;
    // A healthy job behind it proves the worker survived.
    let healthy = insert_job(&ctx.db_pool, job("user-1")).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(OkHandler)),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Failed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.error_code.as_deref(), Some("unknown_handler"));
    assert_eq!(row.retry_count, 0);

    assert!(wait_for_status(ctx, healthy.id, JobStatus::Completed).await);
    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn transient_errors_retry_until_success(ctx: &TestHarness) {
    let inserted = insert_job(&ctx.db_pool, job("user-1")).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(FlakyHandler::failing(1))),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Completed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.result_summary.as_deref(), Some("Recovered after retry"));

    let recorder = ProgressRecorder::new(ctx.db_pool.clone());
    let events: Vec<String> = recorder
        .events_for(inserted.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&"job_retried".to_string()));

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn retries_exhaust_into_failure(ctx: &TestHarness) {
    let mut j = job("user-1");
    j.max_retries = 1;
    let inserted = insert_job(&ctx.db_pool, j).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(FailingHandler {
            code: ErrorCode::NetworkError,
            message: "connection reset by peer",
        })),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Failed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.error_code.as_deref(), Some("network_error"));

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn fatal_errors_do_not_retry(ctx: &TestHarness) {
    let inserted = insert_job(&ctx.db_pool, job("user-1")).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(FailingHandler {
            code: ErrorCode::BadInput,
            message: "profile is missing a resume",
        })),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Failed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.error_code.as_deref(), Some("bad_input"));

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn external_cancel_aborts_a_running_job(ctx: &TestHarness) {
    let inserted = insert_job(&ctx.db_pool, job("user-1")).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(SlowHandler)),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Running).await);
    assert!(Job::mark_cancelled(inserted.id, Some("operator cancel"), &ctx.db_pool)
        .await
        .unwrap());

    // The worker observes the cancel at a heartbeat and logs its side.
    let recorder = ProgressRecorder::new(ctx.db_pool.clone());
    assert!(
        ctx.wait_for(Duration::from_secs(10), || async {
            recorder
                .events_for(inserted.id)
                .await
                .unwrap()
                .iter()
                .any(|e| e.event_type == "job_cancelled")
        })
        .await
    );
    assert_eq!(status_of(ctx, inserted.id).await, JobStatus::Cancelled);

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn wall_clock_timeout_fails_the_job(ctx: &TestHarness) {
    let mut j = job("user-1");
    j.timeout_seconds = 1;
    let inserted = insert_job(&ctx.db_pool, j).await;

    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(SlowHandler)),
        ctx.worker_config("w1"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Failed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.error_code.as_deref(), Some("timeout"));

    handle.shutdown().await.expect("shutdown");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_rows_track_registration_and_drain(ctx: &TestHarness) {
    let handle = WorkerRuntime::start(
        ctx.deps(),
        Arc::new(HandlerRegistry::new()),
        ctx.worker_config("w-reg"),
    )
    .await
    .expect("start worker");

    let record = WorkerRecord::find("w-reg", &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Active);

    handle.shutdown().await.expect("shutdown");

    // Row survives shutdown for audit, marked offline.
    let record = WorkerRecord::find("w-reg", &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Offline);
    assert!(record.current_job_id.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reregistration_preserves_pinning_hint(ctx: &TestHarness) {
    WorkerRecord::register("w-pin", None, Some("w-pin"), &serde_json::json!({}), &ctx.db_pool)
        .await
        .unwrap();

    // Boot again without the hint: it must survive.
    let record =
        WorkerRecord::register("w-pin", Some("10.0.0.9"), None, &serde_json::json!({}), &ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(record.target_worker_id.as_deref(), Some("w-pin"));
    assert_eq!(record.ec2_ip.as_deref(), Some("10.0.0.9"));
    assert_eq!(record.status, WorkerStatus::Active);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn crashed_worker_job_is_reclaimed_and_finished_elsewhere(ctx: &TestHarness) {
    // Simulate the crash directly through the queue: claim and vanish.
    let inserted = insert_job(&ctx.db_pool, job("user-1")).await;
    let dead_claim = Job::claim("w-dead", &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(dead_claim.id, inserted.id);
    sqlx::query("UPDATE jobs SET last_heartbeat = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(inserted.id)
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    // A live worker's maintenance sweep reclaims it, then completes it.
    let handle = WorkerRuntime::start(
        ctx.deps(),
        registry_with(Arc::new(OkHandler)),
        ctx.worker_config("w-alive"),
    )
    .await
    .expect("start worker");

    assert!(wait_for_status(ctx, inserted.id, JobStatus::Completed).await);
    let row = Job::find_by_id(inserted.id, &ctx.db_pool).await.unwrap().unwrap();
    assert_eq!(row.worker_id.as_deref(), Some("w-alive"));
    assert_eq!(row.retry_count, 0);
    let details = row.error_details.expect("release recorded");
    assert_eq!(details["reason"], "stuck_job");

    handle.shutdown().await.expect("shutdown");
}
