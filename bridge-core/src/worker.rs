//! The resource worker: `TAKE → ACQUIRE_CLIENT → FETCH → DECIDE →
//! (WRITE | DROP | RETRY) → PACE → TAKE`. One state machine implementation
//! serves both the primary and the retry queue; the only difference is which
//! queue is the source (the retry queue worker behaves identically).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{FetchError, StoreError};
use crate::http::upstream::fetch_resource;
use crate::http::StoreClient;
use crate::model::{doc_date_modified, ResourceRef};
use crate::pool::ClientPool;
use crate::queue::WorkQueue;
use crate::stats::Stats;

#[derive(Clone)]
pub struct WorkerConfig {
    pub base: String,
    pub version: String,
    pub resource: String,
    pub public_db: String,
    pub queue_timeout: Duration,
    /// Delay applied before an item is handed to the retry queue, so a
    /// transient upstream failure gets a moment to clear before the next
    /// attempt (distinct from the client's own pacing interval).
    pub worker_sleep: Duration,
    /// Pacing used by the retry-queue worker in place of the client's
    /// `request_interval`, so retries run slower than the primary path.
    pub retry_default_timeout: Duration,
    pub retries_count: u32,
    pub is_retry_worker: bool,
}

/// Runs the TAKE loop until `shutdown` is set, checked at the top of each
/// TAKE.
pub async fn run(
    cfg: Arc<WorkerConfig>,
    source: WorkQueue,
    retry_target: WorkQueue,
    pool: ClientPool,
    store: Arc<StoreClient>,
    stats: Stats,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let Some(item) = source.take(cfg.queue_timeout).await else {
            continue;
        };
        process_one(&cfg, item, &pool, &store, &retry_target, &stats).await;
    }
}

async fn process_one(
    cfg: &WorkerConfig,
    item: ResourceRef,
    pool: &ClientPool,
    store: &StoreClient,
    retry_target: &WorkQueue,
    stats: &Stats,
) {
    let mut client = pool.take().await;

    let fetch_result = fetch_resource(&client, &cfg.base, &cfg.version, &cfg.resource, &item.id).await;

    let pace_for = match fetch_result {
        Ok((doc, cookie)) => {
            let retire = client.record_response(true, cookie, pool.inc_step(), pool.dec_step(), pool.cookie_threshold());
            let pace = client.request_interval;
            pool.put(client, retire).await;
            decide_and_resolve(cfg, item, doc, store, retry_target, stats).await;
            pace
        }
        Err(e) => {
            let retire = client.record_response(false, None, pool.inc_step(), pool.dec_step(), pool.cookie_threshold());
            let pace = client.request_interval;
            pool.put(client, retire).await;
            route_fetch_error(cfg, item, e, retry_target, stats).await;
            pace
        }
    };

    let pace = if cfg.is_retry_worker { cfg.retry_default_timeout } else { pace_for };
    tokio::time::sleep(pace).await;
}

async fn route_fetch_error(cfg: &WorkerConfig, item: ResourceRef, err: FetchError, retry_target: &WorkQueue, stats: &Stats) {
    match err {
        FetchError::NotFound => {
            stats.inc_not_found();
            debug!(id = %item.id, "resource gone upstream, dropping");
        }
        FetchError::Auth(status) => {
            stats.inc_exceptions();
            warn!(id = %item.id, status, "upstream rejected request, dropping");
        }
        FetchError::Malformed(msg) => {
            stats.inc_exceptions();
            warn!(id = %item.id, error = %msg, "malformed upstream response, dropping");
        }
        FetchError::Build(e) => {
            stats.inc_exceptions();
            error!(id = %item.id, error = %e, "failed to build upstream request, dropping");
        }
        FetchError::Transient(_) | FetchError::TransientStatus(_) => {
            enqueue_retry(cfg, item, retry_target, stats).await;
        }
    }
}

async fn decide_and_resolve(cfg: &WorkerConfig, item: ResourceRef, doc: serde_json::Value, store: &StoreClient, retry_target: &WorkQueue, stats: &Stats) {
    let Some(fetched_date) = doc_date_modified(&doc) else {
        stats.inc_exceptions();
        warn!(id = %item.id, "fetched document missing dateModified, dropping");
        return;
    };

    if fetched_date < item.date_modified {
        stats.inc_not_actual_docs();
        debug!(id = %item.id, "upstream returned a stale document for this client, re-enqueueing");
        enqueue_retry(cfg, item, retry_target, stats).await;
        return;
    }

    let current = match store.get(&cfg.public_db, &item.id).await {
        Ok(current) => current,
        Err(e) => {
            warn!(id = %item.id, error = %e, "store read failed before write, re-enqueueing");
            enqueue_retry(cfg, item, retry_target, stats).await;
            return;
        }
    };

    if let Some(record) = &current {
        if let Some(stored_date) = doc_date_modified(&record.doc) {
            if stored_date >= fetched_date {
                stats.inc_skipped();
                return;
            }
        }
    }

    write_with_conflict_retry(cfg, item, doc, current, store, retry_target, stats).await;
}

async fn write_with_conflict_retry(
    cfg: &WorkerConfig,
    item: ResourceRef,
    doc: serde_json::Value,
    current: Option<crate::model::LocalRecord>,
    store: &StoreClient,
    retry_target: &WorkQueue,
    stats: &Stats,
) {
    let is_update = current.is_some();
    let revision = current.as_ref().map(|r| &r.revision);

    match store.put(&cfg.public_db, &item.id, &doc, revision).await {
        Ok(_) => {
            if is_update {
                stats.inc_updated();
            } else {
                stats.inc_saved();
            }
        }
        Err(StoreError::Conflict) => {
            // One in-place retry: re-read the current revision and try once more.
            match store.get(&cfg.public_db, &item.id).await {
                Ok(Some(record)) => match store.put(&cfg.public_db, &item.id, &doc, Some(&record.revision)).await {
                    Ok(_) => stats.inc_updated(),
                    Err(_) => enqueue_retry(cfg, item, retry_target, stats).await,
                },
                _ => enqueue_retry(cfg, item, retry_target, stats).await,
            }
        }
        Err(_) => {
            enqueue_retry(cfg, item, retry_target, stats).await;
        }
    }
}

/// Bumps the attempt counter and re-enqueues to the retry queue, unless
/// `retries_count` is already exhausted, in which case the item is dropped
/// and forgotten.
async fn enqueue_retry(cfg: &WorkerConfig, mut item: ResourceRef, retry_target: &WorkQueue, stats: &Stats) {
    item.attempt += 1;
    if item.attempt >= cfg.retries_count {
        stats.inc_dropped();
        error!(id = %item.id, attempts = item.attempt, "retry attempts exhausted, dropping");
        return;
    }
    tokio::time::sleep(cfg.worker_sleep).await;
    stats.inc_retried();
    retry_target.put(item).await;
}
