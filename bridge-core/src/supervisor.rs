//! The supervisor: on a fixed `watch_interval` tick, snapshots and
//! ships stats, tops up feed readers and both worker pools to their
//! configured minimums, and is the only place that re-hydrates workers a
//! panic has killed; workers themselves never self-restart.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::feed::{self, FeedConfig};
use crate::http::StoreClient;
use crate::pool::ClientPool;
use crate::pool_manager::WorkerSet;
use crate::queue::WorkQueue;
use crate::stats::Stats;
use crate::worker::{self, WorkerConfig};

pub struct SupervisorConfig {
    pub watch_interval: Duration,
    pub filter_workers_count: usize,
    pub workers_min: usize,
    pub retry_workers_min: usize,
    pub logs_db: String,
    pub public_db: String,
    pub shutdown_grace_period: Duration,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    cfg: SupervisorConfig,
    feed_cfg: Arc<FeedConfig>,
    primary: WorkQueue,
    retry: WorkQueue,
    feed_tasks: Arc<WorkerSet>,
    primary_workers: Arc<WorkerSet>,
    retry_workers: Arc<WorkerSet>,
    pool: ClientPool,
    store: Arc<StoreClient>,
    primary_worker_cfg: Arc<WorkerConfig>,
    retry_worker_cfg: Arc<WorkerConfig>,
    stats: Stats,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cfg.watch_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        snapshot_and_ship_stats(&cfg, &primary, &retry, &stats, &store).await;

        feed_tasks.reap_finished().await;
        top_up_feed_readers(&cfg, &feed_cfg, &feed_tasks, &pool, &store, &primary, &stats, &shutdown).await;

        primary_workers.reap_finished().await;
        top_up_workers(
            cfg.workers_min,
            &primary_workers,
            &primary,
            &retry,
            &pool,
            &store,
            &primary_worker_cfg,
            &stats,
            &shutdown,
        )
        .await;
        stats.set_primary_workers(primary_workers.count().await);

        retry_workers.reap_finished().await;
        // Each retry worker started here is not paired with an explicitly
        // created client; it draws one lazily from the shared pool on its
        // first take, the same as a primary worker started by the controller.
        top_up_workers(
            cfg.retry_workers_min,
            &retry_workers,
            &retry,
            &retry,
            &pool,
            &store,
            &retry_worker_cfg,
            &stats,
            &shutdown,
        )
        .await;
        stats.set_retry_workers(retry_workers.count().await);
    }

    feed_tasks.shutdown(cfg.shutdown_grace_period).await;
    primary_workers.shutdown(cfg.shutdown_grace_period).await;
    retry_workers.shutdown(cfg.shutdown_grace_period).await;
}

async fn snapshot_and_ship_stats(cfg: &SupervisorConfig, primary: &WorkQueue, retry: &WorkQueue, stats: &Stats, store: &Arc<StoreClient>) {
    let (rss, vms) = process_memory();
    let record = stats.snapshot_and_reset(primary.depth(), retry.depth(), rss, vms);
    info!(
        saved = record.saved,
        updated = record.updated,
        dropped = record.dropped,
        skipped = record.skipped,
        primary_depth = record.primary_queue_depth,
        retry_depth = record.retry_queue_depth,
        "supervisor tick"
    );

    let store = store.clone();
    let logs_db = cfg.logs_db.clone();
    tokio::spawn(async move {
        if let Err(e) = store.save_stats(&logs_db, &record).await {
            warn!(error = %e, "failed to ship stats to log sink, dropping");
        }
    });
}

fn process_memory() -> (u64, u64) {
    let mut sys = System::new();
    match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_process(pid);
            sys.process(pid).map(|p| (p.memory(), p.virtual_memory())).unwrap_or((0, 0))
        }
        Err(_) => (0, 0),
    }
}

#[allow(clippy::too_many_arguments)]
async fn top_up_feed_readers(
    cfg: &SupervisorConfig,
    feed_cfg: &Arc<FeedConfig>,
    feed_tasks: &WorkerSet,
    pool: &ClientPool,
    store: &Arc<StoreClient>,
    primary: &WorkQueue,
    stats: &Stats,
    shutdown: &CancellationToken,
) {
    while feed_tasks.count().await < cfg.filter_workers_count {
        let pool = pool.clone();
        let store = store.clone();
        let primary = primary.clone();
        let stats = stats.clone();
        let public_db = cfg.public_db.clone();
        let cfg_for_reader = (**feed_cfg).clone();
        feed_tasks
            .spawn(shutdown, move |token| {
                tokio::spawn(async move {
                    if let Err(e) = feed::run(cfg_for_reader, pool, store, public_db, primary, stats, token).await {
                        error!(error = %e, "changes feed reader exited, supervisor will restart it");
                    }
                })
            })
            .await;
        info!(count = feed_tasks.count().await, "spawned changes feed reader");
    }
}

#[allow(clippy::too_many_arguments)]
async fn top_up_workers(
    min: usize,
    workers: &WorkerSet,
    source: &WorkQueue,
    retry_target: &WorkQueue,
    pool: &ClientPool,
    store: &Arc<StoreClient>,
    worker_cfg: &Arc<WorkerConfig>,
    stats: &Stats,
    shutdown: &CancellationToken,
) {
    while workers.count().await < min {
        let source = source.clone();
        let retry_target = retry_target.clone();
        let pool = pool.clone();
        let store = store.clone();
        let worker_cfg = worker_cfg.clone();
        let stats = stats.clone();
        workers
            .spawn(shutdown, move |token| tokio::spawn(worker::run(worker_cfg, source, retry_target, pool, store, stats, token)))
            .await;
    }
}
