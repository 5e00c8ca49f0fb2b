//! Fleet CLI.
//!
//! One binary, three jobs: boot a worker, run schema migrations, or fire a
//! one-shot stuck-job sweep. Exit codes: 0 success, 1 misconfiguration,
//! 2 runtime failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::config::Config;
use fleet_core::kernel::jobs::{
    HandlerRegistry, JobQueue, PostgresJobQueue, WorkerConfig, WorkerRuntime,
};
use fleet_core::kernel::FleetDeps;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Distributed job scheduler for browser-automation workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a worker and serve jobs until shutdown
    Worker {
        /// Stable worker identity, e.g. "us-east-1a-7f3c"
        #[arg(long)]
        worker_id: String,
    },

    /// Run schema migrations
    Migrate,

    /// One-shot reclamation sweep of stale-leased jobs
    ReleaseStuck,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "misconfiguration");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Worker { worker_id } => cmd_worker(&config, worker_id).await,
        Commands::Migrate => cmd_migrate(&config).await,
        Commands::ReleaseStuck => cmd_release_stuck(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "runtime failure");
            ExitCode::from(2)
        }
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")
}

async fn cmd_worker(config: &Config, worker_id: String) -> Result<()> {
    let pool = connect(config).await?;

    let deps = FleetDeps::from_config(pool, config)?;
    // Handlers are registered by the deployment that embeds this crate;
    // the bare binary serves whatever is linked in (none by default, which
    // fails unknown job types cleanly instead of panicking).
    let registry = Arc::new(HandlerRegistry::new());
    let worker_config = WorkerConfig::from_config(worker_id, config);

    WorkerRuntime::run_until_shutdown(deps, registry, worker_config).await
}

async fn cmd_migrate(config: &Config) -> Result<()> {
    let pool = connect(config).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn cmd_release_stuck(config: &Config) -> Result<()> {
    let pool = connect(config).await?;
    let queue = PostgresJobQueue::new(pool, config.lease_window.as_secs() as i64);
    let released = queue.release_stuck("release-stuck-cli").await?;
    tracing::info!(count = released.len(), "released stuck jobs");
    for id in released {
        println!("{id}");
    }
    Ok(())
}
