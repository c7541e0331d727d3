//! The queue controller scales the primary worker pool up or down from the
//! primary queue's fill percentage, one step per tick, damped at
//! `workers_min`/`workers_max`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::StoreClient;
use crate::pool::ClientPool;
use crate::pool_manager::WorkerSet;
use crate::queue::WorkQueue;
use crate::stats::Stats;
use crate::worker::{self, WorkerConfig};

pub struct ControllerConfig {
    pub tick: Duration,
    pub inc_threshold: f64,
    pub dec_threshold: f64,
    pub workers_min: usize,
    pub workers_max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Up,
    Down,
    Hold,
}

/// Pure decision function, one step per tick.
fn decide(fill: f64, count: usize, cfg: &ControllerConfig) -> Scale {
    if fill > cfg.inc_threshold && count < cfg.workers_max {
        Scale::Up
    } else if fill < cfg.dec_threshold && count > cfg.workers_min {
        Scale::Down
    } else {
        Scale::Hold
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    cfg: ControllerConfig,
    primary: WorkQueue,
    retry: WorkQueue,
    workers: Arc<WorkerSet>,
    pool: ClientPool,
    store: Arc<StoreClient>,
    worker_cfg: Arc<WorkerConfig>,
    stats: Stats,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cfg.tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        workers.reap_finished().await;
        let fill = primary.fill_percent();
        let count = workers.count().await;
        info!(fill_percent = fill, workers = count, "queue controller tick");

        match decide(fill, count, &cfg) {
            Scale::Up => {
                // Only a worker is spawned here; a matching client is not created
                // up front. The client pool creates clients lazily on first take,
                // up to its own ceiling, so the new worker's first request grows
                // the pool by one client on its own.
                spawn_one_primary_worker(&primary, &retry, &workers, &pool, &store, &worker_cfg, &stats, &shutdown).await;
                stats.set_primary_workers(workers.count().await);
                info!(workers = workers.count().await, "scaled primary workers up");
            }
            Scale::Down => {
                workers.stop_one().await;
                stats.set_primary_workers(workers.count().await);
                info!(workers = workers.count().await, "scaled primary workers down");
            }
            Scale::Hold => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn spawn_one_primary_worker(
    primary: &WorkQueue,
    retry: &WorkQueue,
    workers: &WorkerSet,
    pool: &ClientPool,
    store: &Arc<StoreClient>,
    worker_cfg: &Arc<WorkerConfig>,
    stats: &Stats,
    parent: &CancellationToken,
) {
    let primary = primary.clone();
    let retry = retry.clone();
    let pool = pool.clone();
    let store = store.clone();
    let worker_cfg = worker_cfg.clone();
    let stats = stats.clone();
    workers
        .spawn(parent, move |token| {
            tokio::spawn(worker::run(worker_cfg, primary, retry, pool, store, stats, token))
        })
        .await;
}
