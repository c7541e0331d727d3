//! The primary and retry work queues. Backed by `async_channel` rather than
//! `tokio::sync::mpsc` because multiple worker tasks share one receiving end
//! (a capability `mpsc::Receiver` doesn't offer without wrapping it in a
//! mutex).

use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::model::ResourceRef;

#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<ResourceRef>,
    rx: Receiver<ResourceRef>,
    bound: Option<usize>,
}

impl WorkQueue {
    /// `bound = None` means unbounded (the `-1` sentinel from config).
    pub fn new(bound: Option<usize>) -> Self {
        let (tx, rx) = match bound {
            Some(n) => async_channel::bounded(n),
            None => async_channel::unbounded(),
        };
        Self { tx, rx, bound }
    }

    /// Blocks (backpressure) if the queue is at its bound.
    pub async fn put(&self, item: ResourceRef) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Waits up to `timeout` for an item; `None` means "empty, try again".
    pub async fn take(&self, timeout: Duration) -> Option<ResourceRef> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(item)) => Some(item),
            _ => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    /// Floating-point, clamped to `[0, 100]`. An unbounded queue is never
    /// "full", the controller must not scale on its depth.
    pub fn fill_percent(&self) -> f64 {
        match self.bound {
            None => 0.0,
            Some(0) => 0.0,
            Some(bound) => ((self.rx.len() as f64 / bound as f64) * 100.0).clamp(0.0, 100.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn fill_percent_clamps_and_handles_small_bounds() {
        let q = WorkQueue::new(Some(3));
        assert_eq!(q.fill_percent(), 0.0);
        for i in 0..3 {
            q.put(ResourceRef::new(i.to_string(), Utc::now())).await;
        }
        assert_eq!(q.fill_percent(), 100.0);
    }

    #[tokio::test]
    async fn unbounded_queue_never_full() {
        let q = WorkQueue::new(None);
        for i in 0..1000 {
            q.put(ResourceRef::new(i.to_string(), Utc::now())).await;
        }
        assert_eq!(q.fill_percent(), 0.0);
    }

    #[tokio::test]
    async fn take_times_out_on_empty_queue() {
        let q = WorkQueue::new(Some(1));
        let item = q.take(Duration::from_millis(10)).await;
        assert!(item.is_none());
    }
}
