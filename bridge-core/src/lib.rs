//! Producer/consumer replication pipeline that mirrors a public procurement
//! catalog from an authoritative upstream HTTP API into a local
//! CouchDB-style document store. This crate holds every piece of the
//! pipeline; the `edge-bridge` binary only parses the CLI argument, loads
//! configuration, and wires it together.

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod filter;
pub mod http;
pub mod model;
pub mod pool;
pub mod pool_manager;
pub mod queue;
pub mod stats;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MainConfig;
use crate::controller::ControllerConfig;
use crate::feed::FeedConfig;
use crate::http::StoreClient;
use crate::pool::{ClientPool, PoolConfig};
use crate::pool_manager::WorkerSet;
use crate::queue::WorkQueue;
use crate::stats::Stats;
use crate::supervisor::SupervisorConfig;
use crate::worker::WorkerConfig;

/// Builds every pipeline component and drives it until `shutdown` is
/// cancelled, then drains in-flight work for up to `shutdown_grace_period`
/// before returning.
pub async fn run(config: MainConfig, shutdown: CancellationToken) -> Result<(), error::StoreError> {
    let request_timeout = config.queue_timeout.max(Duration::from_secs(5));
    let pool = ClientPool::new(PoolConfig {
        user_agent_prefix: config.user_agent.clone(),
        request_timeout,
        ceiling: config.workers_max + config.retry_workers_max,
        inc_step: config.client_inc_step_timeout,
        dec_step: config.client_dec_step_timeout,
        cookie_threshold: config.drop_threshold_client_cookies,
        create_backoff_step: Duration::from_millis(100),
        create_backoff_max: Duration::from_secs(5),
    });

    let store_http = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| error::StoreError::Transport(e.to_string()))?;
    let store = Arc::new(StoreClient::new(store_http, &config.couch_url));

    ensure_database(&store, &config.public_db).await?;
    ensure_database(&store, &config.logs_db).await?;

    let primary = WorkQueue::new(config.primary_queue_bound());
    let retry = WorkQueue::new(config.retry_queue_bound());
    let stats = Stats::new();

    let feed_tasks = Arc::new(WorkerSet::new());
    let primary_workers = Arc::new(WorkerSet::new());
    let retry_workers = Arc::new(WorkerSet::new());

    let primary_worker_cfg = Arc::new(WorkerConfig {
        base: config.resources_api_server.clone(),
        version: config.resources_api_version.clone(),
        resource: config.resource.clone(),
        public_db: config.public_db.clone(),
        queue_timeout: config.queue_timeout,
        worker_sleep: config.worker_sleep,
        retry_default_timeout: config.retry_default_timeout,
        retries_count: config.retries_count,
        is_retry_worker: false,
    });
    let retry_worker_cfg = Arc::new(WorkerConfig {
        is_retry_worker: true,
        ..(*primary_worker_cfg).clone()
    });

    let feed_cfg = Arc::new(FeedConfig {
        base: config.resources_api_server.clone(),
        version: config.resources_api_version.clone(),
        resource: config.resource.clone(),
        limit: config.resource_items_limit,
        empty_page_wait: config.watch_interval,
        backoff_base: Duration::from_millis(200),
        backoff_max: Duration::from_secs(30),
    });

    let controller_cfg = ControllerConfig {
        tick: config.queues_controller_timeout,
        inc_threshold: config.workers_inc_threshold,
        dec_threshold: config.workers_dec_threshold,
        workers_min: config.workers_min,
        workers_max: config.workers_max,
    };

    let controller_handle = tokio::spawn(controller::run(
        controller_cfg,
        primary.clone(),
        retry.clone(),
        primary_workers.clone(),
        pool.clone(),
        store.clone(),
        primary_worker_cfg.clone(),
        stats.clone(),
        shutdown.clone(),
    ));

    let supervisor_cfg = SupervisorConfig {
        watch_interval: config.watch_interval,
        filter_workers_count: config.filter_workers_count,
        workers_min: config.workers_min,
        retry_workers_min: config.retry_workers_min,
        logs_db: config.logs_db.clone(),
        public_db: config.public_db.clone(),
        shutdown_grace_period: config.shutdown_grace_period,
    };

    let supervisor_handle = tokio::spawn(supervisor::run(
        supervisor_cfg,
        feed_cfg,
        primary.clone(),
        retry.clone(),
        feed_tasks,
        primary_workers,
        retry_workers,
        pool,
        store,
        primary_worker_cfg,
        retry_worker_cfg,
        stats,
        shutdown.clone(),
    ));

    info!(resource = %config.resource, "edge-bridge pipeline started");

    let _ = tokio::join!(controller_handle, supervisor_handle);
    info!("edge-bridge pipeline shut down");
    Ok(())
}

async fn ensure_database(store: &StoreClient, database_name: &str) -> Result<(), error::StoreError> {
    if !store.exists(database_name).await? {
        store.create(database_name).await?;
    }
    Ok(())
}

/// Re-exported for the binary crate's wiring.
pub use error::ConfigError;
