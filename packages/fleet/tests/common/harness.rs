//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each test
//! gets its own database inside it. Queue tests exercise real claim
//! contention, so anything short of full database isolation would let
//! parallel tests steal each other's jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_core::kernel::jobs::WorkerConfig;
use fleet_core::kernel::{
    CallbackDispatcher, FleetDeps, RateLimiter, RecordingBrowser, SessionCrypto, SessionStore,
};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Connection URL prefix without a database name.
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG when debugging tests; try_init avoids panicking
        // when several suites race the subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{}:{}", host, port);

        Ok(Self {
            base_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test harness: a fresh database with migrations applied.
pub struct TestHarness {
    pub db_pool: PgPool,
    /// Browser seam shared with the worker under test.
    pub browser: Arc<RecordingBrowser>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("fleet_test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
            .await
            .context("Failed to connect for database creation")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{}""#, db_name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let db_pool = PgPool::connect(&format!("{}/{}", infra.base_url, db_name))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_pool,
            browser: Arc::new(RecordingBrowser::default()),
        })
    }

    /// Standard dependency set for a worker under test.
    pub fn deps(&self) -> FleetDeps {
        FleetDeps::new(
            self.db_pool.clone(),
            self.browser.clone(),
            Arc::new(CallbackDispatcher::new(None).with_backoff(Duration::from_millis(10))),
            Some(Arc::new(self.session_store())),
            Arc::new(RateLimiter::new()),
        )
    }

    /// Session store wired to this test's database.
    pub fn session_store(&self) -> SessionStore {
        let key = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode([42u8; 32])
        };
        let crypto = SessionCrypto::from_base64_key(&key, "primary").expect("test key");
        SessionStore::new(self.db_pool.clone(), crypto, Duration::from_secs(3600))
    }

    /// Worker settings tightened for test pacing.
    pub fn worker_config(&self, worker_id: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(worker_id);
        config.poll_interval = Duration::from_millis(50);
        config.heartbeat_interval = Duration::from_millis(100);
        config.lease_window = Duration::from_secs(2);
        config.hitl_timeout = Duration::from_secs(5);
        config.drain_deadline = Duration::from_secs(5);
        config
    }

    /// Wait for a condition to become true, polling every 50ms.
    pub async fn wait_for<F, Fut>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
