//! Counters reset every supervisor tick. Kept as plain atomics
//! grouped behind one `Arc` rather than a shared-lock dict, cheap,
//! lock-free increments from any worker, an acceptable (documented)
//! under-count race across a tick boundary.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    saved: AtomicU64,
    updated: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    exceptions: AtomicU64,
    not_found: AtomicU64,
    not_actual_docs: AtomicU64,
    enqueued: AtomicU64,
    primary_workers: AtomicUsize,
    retry_workers: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct Stats(Arc<Counters>);

macro_rules! inc {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.0.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    inc!(inc_saved, saved);
    inc!(inc_updated, updated);
    inc!(inc_dropped, dropped);
    inc!(inc_skipped, skipped);
    inc!(inc_retried, retried);
    inc!(inc_exceptions, exceptions);
    inc!(inc_not_found, not_found);
    inc!(inc_not_actual_docs, not_actual_docs);
    inc!(inc_enqueued, enqueued);

    pub fn set_primary_workers(&self, n: usize) {
        self.0.primary_workers.store(n, Ordering::Relaxed);
    }

    pub fn set_retry_workers(&self, n: usize) {
        self.0.retry_workers.store(n, Ordering::Relaxed);
    }

    /// Atomically reads and zeroes every counter, producing the record the
    /// log sink receives for this tick.
    pub fn snapshot_and_reset(&self, primary_queue_depth: usize, retry_queue_depth: usize, rss_bytes: u64, vms_bytes: u64) -> StatsRecord {
        let c = &self.0;
        StatsRecord {
            saved: c.saved.swap(0, Ordering::Relaxed),
            updated: c.updated.swap(0, Ordering::Relaxed),
            dropped: c.dropped.swap(0, Ordering::Relaxed),
            skipped: c.skipped.swap(0, Ordering::Relaxed),
            retried: c.retried.swap(0, Ordering::Relaxed),
            exceptions: c.exceptions.swap(0, Ordering::Relaxed),
            not_found: c.not_found.swap(0, Ordering::Relaxed),
            not_actual_docs: c.not_actual_docs.swap(0, Ordering::Relaxed),
            enqueued: c.enqueued.swap(0, Ordering::Relaxed),
            primary_queue_depth,
            retry_queue_depth,
            primary_workers: c.primary_workers.load(Ordering::Relaxed),
            retry_workers: c.retry_workers.load(Ordering::Relaxed),
            rss_bytes,
            vms_bytes,
        }
    }
}

/// Serialized and POSTed to the log sink once per `watch_interval` tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRecord {
    pub saved: u64,
    pub updated: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub retried: u64,
    pub exceptions: u64,
    pub not_found: u64,
    pub not_actual_docs: u64,
    pub enqueued: u64,
    pub primary_queue_depth: usize,
    pub retry_queue_depth: usize,
    pub primary_workers: usize,
    pub retry_workers: usize,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
}
