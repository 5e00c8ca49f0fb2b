//! Worker runtime: identity, poll loop, heartbeats, drain.
//!
//! Each process runs one worker that serves jobs strictly sequentially.
//! Workers coordinate only through the database: the poll loop claims,
//! the ticker keeps the worker row fresh, and a maintenance sweep
//! reclaims stuck jobs and expired browser sessions on behalf of the
//! whole fleet.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::executor::JobExecutor;
use super::hitl::HitlCoordinator;
use super::queue::{JobQueue, PostgresJobQueue};
use super::registry::SharedHandlerRegistry;
use super::worker_record::{WorkerRecord, WorkerStatus};
use crate::config::Config;
use crate::kernel::FleetDeps;

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How often to poll for a claim when idle.
    pub poll_interval: Duration,
    /// Job and worker heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Lease age beyond which another worker may reclaim a job.
    pub lease_window: Duration,
    /// Default HITL pause budget.
    pub hitl_timeout: Duration,
    /// How long shutdown waits for the in-flight job.
    pub drain_deadline: Duration,
    pub ec2_ip: Option<String>,
    pub metadata: serde_json::Value,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            lease_window: Duration::from_secs(120),
            hitl_timeout: Duration::from_secs(300),
            drain_deadline: Duration::from_secs(60),
            ec2_ip: None,
            metadata: serde_json::json!({}),
        }
    }

    /// Derive worker settings from the environment configuration.
    pub fn from_config(worker_id: impl Into<String>, config: &Config) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            lease_window: config.lease_window,
            hitl_timeout: config.hitl_timeout,
            drain_deadline: config.drain_deadline,
            ec2_ip: config.ec2_ip.clone(),
            metadata: serde_json::json!({}),
        }
    }
}

/// Long-lived worker service.
pub struct WorkerRuntime;

impl WorkerRuntime {
    /// Register the worker and start its cooperative tasks.
    pub async fn start(
        deps: FleetDeps,
        registry: SharedHandlerRegistry,
        config: WorkerConfig,
    ) -> Result<WorkerHandle> {
        WorkerRecord::register(
            &config.worker_id,
            config.ec2_ip.as_deref(),
            None,
            &config.metadata,
            &deps.db_pool,
        )
        .await
        .context("failed to register worker")?;

        info!(worker_id = %config.worker_id, "worker registered");

        let queue = Arc::new(PostgresJobQueue::new(
            deps.db_pool.clone(),
            config.lease_window.as_secs() as i64,
        ));
        let hitl = Arc::new(HitlCoordinator::new(
            deps.db_pool.clone(),
            Arc::clone(&deps.browser),
            Arc::clone(&deps.dispatcher),
            config.hitl_timeout,
        ));
        let executor = JobExecutor::new(
            deps.clone(),
            registry,
            hitl,
            config.worker_id.clone(),
            config.heartbeat_interval,
        );

        // `quit` only stops claiming; the in-flight job finishes (or is
        // aborted at the drain deadline).
        let quit = CancellationToken::new();

        let ticker = tokio::spawn(Self::ticker_loop(
            deps.clone(),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            config.clone(),
            quit.clone(),
        ));

        let main = tokio::spawn(Self::main_loop(
            deps.clone(),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            executor,
            config.clone(),
            quit.clone(),
        ));

        Ok(WorkerHandle {
            worker_id: config.worker_id,
            drain_deadline: config.drain_deadline,
            pool: deps.db_pool,
            quit,
            main,
            ticker,
        })
    }

    /// Start a worker and run it until ctrl-c, then drain.
    pub async fn run_until_shutdown(
        deps: FleetDeps,
        registry: SharedHandlerRegistry,
        config: WorkerConfig,
    ) -> Result<()> {
        let handle = Self::start(deps, registry, config).await?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("received shutdown signal");
        handle.shutdown().await
    }

    async fn main_loop(
        deps: FleetDeps,
        queue: Arc<dyn JobQueue>,
        executor: JobExecutor,
        config: WorkerConfig,
        quit: CancellationToken,
    ) {
        info!(
            worker_id = %config.worker_id,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "worker main loop starting"
        );

        loop {
            if quit.is_cancelled() {
                break;
            }

            let claimed = match queue.claim(&config.worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    // Database unavailable: back off without touching any
                    // job state.
                    error!(worker_id = %config.worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = quit.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            let Some(job) = claimed else {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            };

            if let Err(e) =
                WorkerRecord::set_current_job(&config.worker_id, Some(job.id), &deps.db_pool).await
            {
                warn!(worker_id = %config.worker_id, error = %e, "failed to record current job");
            }

            executor.run(job).await;

            if let Err(e) =
                WorkerRecord::set_current_job(&config.worker_id, None, &deps.db_pool).await
            {
                warn!(worker_id = %config.worker_id, error = %e, "failed to clear current job");
            }
        }

        info!(worker_id = %config.worker_id, "worker main loop stopped");
    }

    /// Worker-row heartbeat plus fleet maintenance.
    ///
    /// Reclamation may run on any worker; lease-window/2 keeps the sweep
    /// comfortably ahead of the reclaim threshold.
    async fn ticker_loop(
        deps: FleetDeps,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
        quit: CancellationToken,
    ) {
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        let maintenance_period = (config.lease_window / 2).max(Duration::from_secs(1));
        let mut maintenance = tokio::time::interval(maintenance_period);
        heartbeat.tick().await;
        maintenance.tick().await;

        loop {
            tokio::select! {
                _ = quit.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = WorkerRecord::heartbeat(&config.worker_id, &deps.db_pool).await {
                        warn!(worker_id = %config.worker_id, error = %e, "worker heartbeat failed");
                    }
                }
                _ = maintenance.tick() => {
                    match queue.release_stuck(&config.worker_id).await {
                        Ok(released) if !released.is_empty() => {
                            warn!(
                                worker_id = %config.worker_id,
                                count = released.len(),
                                "reclaimed stuck jobs"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(worker_id = %config.worker_id, error = %e, "stuck-job sweep failed");
                        }
                    }
                    if let Some(sessions) = &deps.sessions {
                        match sessions.sweep().await {
                            Ok(0) => {}
                            Ok(n) => info!(count = n, "swept expired browser sessions"),
                            Err(e) => warn!(error = %e, "session sweep failed"),
                        }
                    }
                }
            }
        }
    }
}

/// Handle to a running worker. Dropping it does NOT stop the worker; call
/// [`WorkerHandle::shutdown`] for a clean drain.
pub struct WorkerHandle {
    worker_id: String,
    drain_deadline: Duration,
    pool: sqlx::PgPool,
    quit: CancellationToken,
    main: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drain and stop: no new claims, finish the in-flight job within the
    /// drain deadline, then go offline.
    pub async fn shutdown(self) -> Result<()> {
        info!(worker_id = %self.worker_id, "worker draining");
        if let Err(e) =
            WorkerRecord::set_status(&self.worker_id, WorkerStatus::Draining, &self.pool).await
        {
            warn!(worker_id = %self.worker_id, error = %e, "failed to mark worker draining");
        }

        self.quit.cancel();

        let mut main = self.main;
        match tokio::time::timeout(self.drain_deadline, &mut main).await {
            Ok(_) => {}
            Err(_) => {
                // The in-flight job exceeded the drain budget; abandon it.
                // Its lease expires and another worker reclaims it.
                warn!(
                    worker_id = %self.worker_id,
                    "drain deadline exceeded; abandoning in-flight job"
                );
                main.abort();
            }
        }
        self.ticker.abort();

        WorkerRecord::set_status(&self.worker_id, WorkerStatus::Offline, &self.pool)
            .await
            .context("failed to mark worker offline")?;
        info!(worker_id = %self.worker_id, "worker offline");
        Ok(())
    }
}
