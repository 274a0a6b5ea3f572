//! Service entrypoint: wires the scheduler and worker pool together and
//! runs until interrupted. Tracing setup follows `cli/src/main.rs`'s
//! `tracing_subscriber::registry()` + `EnvFilter::from_default_env()`
//! layering; there is no subcommand surface here, so `clap` is not
//! pulled in.

use anyhow::Context;
use idp_sync::{IdpSyncConfig, ReconciliationEngine, Worker, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = IdpSyncConfig::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.workers_concurrency as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;

    let engine = Arc::new(ReconciliationEngine::new(
        pool.clone(),
        config.batch_size_identities,
        config.batch_size_memberships,
        config.groups_per_membership_chunk,
        config.deletion_threshold_ratio,
        config.deletion_threshold_min_rows
    ));

    let worker = Worker::new(
        pool.clone(),
        engine,
        config.http_per_request_timeout(),
        config.http_max_concurrent_per_host,
        config.deletion_threshold_transient_to_fatal_hours
    );
    let worker_pool = Arc::new(WorkerPool::new(worker, config.workers_concurrency));

    let mut scheduler = idp_sync::SyncScheduler::new(
        pool,
        worker_pool,
        config.sync_scheduler_period(),
        config.sync_scheduler_period()
    )
    .await
    .context("starting scheduler")?;

    scheduler.start().await.context("starting scheduler job")?;
    tracing::info!("idp-syncd running");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    scheduler.stop().await.context("stopping scheduler")?;

    Ok(())
}
