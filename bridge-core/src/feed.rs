//! The changes-feed reader walks the upstream `?mode=_all_` feed, admits
//! each advertised item through the staleness filter, and enqueues
//! survivors onto the primary queue. A lazy, resumable sequence:
//! when the server reports "no more", the caller decides how long to wait
//! before resuming from the same cursor.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{FeedError, FetchError};
use crate::filter::{self, Admission};
use crate::http::upstream::fetch_changes_page;
use crate::http::StoreClient;
use crate::pool::ClientPool;
use crate::queue::WorkQueue;
use crate::stats::Stats;

#[derive(Clone)]
pub struct FeedConfig {
    pub base: String,
    pub version: String,
    pub resource: String,
    pub limit: u32,
    pub empty_page_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Converts an upstream `FetchError` into the feed's own taxonomy: transient
/// errors are retried internally, everything else is fatal and propagated
/// so the supervisor restarts the reader on the next tick.
fn classify(err: FetchError) -> FeedError {
    match err {
        FetchError::Transient(msg) => FeedError::Transient(msg),
        FetchError::TransientStatus(status) => FeedError::Transient(format!("status {status}")),
        FetchError::NotFound => FeedError::Fatal("unexpected 404 from changes feed".to_string()),
        FetchError::Auth(status) => FeedError::Fatal(format!("auth error {status}")),
        FetchError::Malformed(msg) => FeedError::Fatal(msg),
        FetchError::Build(e) => FeedError::Fatal(e.to_string()),
    }
}

/// Fetches one page, retrying internally on `FeedError::Transient` with
/// bounded exponential backoff. Returns `Err(FeedError::Fatal)` immediately
/// on a non-recoverable response.
async fn fetch_page_with_retry(
    pool: &ClientPool,
    cfg: &FeedConfig,
    offset: Option<&str>,
    shutdown: &CancellationToken,
) -> Result<crate::model::ChangesPage, FeedError> {
    let mut backoff = ExponentialBackoff::new(cfg.backoff_base, cfg.backoff_max);
    loop {
        let mut client = pool.take().await;
        let result = fetch_changes_page(&mut client, &cfg.base, &cfg.version, &cfg.resource, cfg.limit, offset).await;
        match result {
            Ok(page) => {
                pool.put(client, false).await;
                return Ok(page);
            }
            Err(e) => {
                pool.put(client, false).await;
                match classify(e) {
                    FeedError::Transient(msg) => {
                        let delay = backoff.next();
                        warn!(error = %msg, delay_ms = delay.as_millis() as u64, "changes feed transient error, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => return Err(FeedError::Fatal("shutdown during backoff".to_string())),
                        }
                    }
                    fatal => return Err(fatal),
                }
            }
        }
    }
}

/// Runs until cancelled or a fatal feed error occurs. Returns `Err` only on
/// `FeedFatal`; the supervisor restarts the reader at its next tick.
pub async fn run(
    cfg: FeedConfig,
    pool: ClientPool,
    store: Arc<StoreClient>,
    public_db: String,
    primary: WorkQueue,
    stats: Stats,
    shutdown: CancellationToken,
) -> Result<(), FeedError> {
    let mut cursor: Option<String> = None;
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let page = fetch_page_with_retry(&pool, &cfg, cursor.as_deref(), &shutdown).await?;
        if page.data.is_empty() {
            debug!(resource = %cfg.resource, "changes feed reports no more items, waiting");
            tokio::select! {
                _ = tokio::time::sleep(cfg.empty_page_wait) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            continue;
        }

        info!(count = page.data.len(), "changes feed page received");
        for item in &page.data {
            match filter::check(&store, &public_db, item, &stats).await {
                Admission::Admit => {
                    stats.inc_enqueued();
                    tokio::select! {
                        ok = primary.put(item.clone()) => { if !ok { return Ok(()); } }
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
                Admission::Drop => {}
            }
        }

        if let Some(offset) = page.next_page.offset {
            cursor = Some(offset);
        }
    }
}
