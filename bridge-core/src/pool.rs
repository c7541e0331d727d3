//! The client pool: a FIFO of `ApiClient`s taken by workers before each
//! request and returned after. Empty pool and below-ceiling triggers a new
//! client, created with linear backoff on failure; at the ceiling, callers
//! wait for a client to be returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::backoff::LinearBackoff;
use crate::http::ApiClient;

pub struct PoolConfig {
    pub user_agent_prefix: String,
    pub request_timeout: Duration,
    pub ceiling: usize,
    pub inc_step: Duration,
    pub dec_step: Duration,
    pub cookie_threshold: u32,
    pub create_backoff_step: Duration,
    pub create_backoff_max: Duration,
}

struct Inner {
    clients: VecDeque<ApiClient>,
    outstanding: usize,
}

/// Shared, cloneable handle; take/return is mutex-guarded FIFO access plus an
/// atomic outstanding count so the pool knows when it is at its ceiling.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    config: Arc<PoolConfig>,
}

impl ClientPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { clients: VecDeque::new(), outstanding: 0 })),
            notify: Arc::new(Notify::new()),
            config: Arc::new(config),
        }
    }

    /// Takes a client from the FIFO, creating one (with retry) if the pool is
    /// empty and below `ceiling`. Waits for a return if already at ceiling.
    /// Never fails: client construction retries internally until it succeeds.
    pub async fn take(&self) -> ApiClient {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(client) = inner.clients.pop_front() {
                    inner.outstanding += 1;
                    return client;
                }
                if inner.outstanding < self.config.ceiling {
                    inner.outstanding += 1;
                    drop(inner);
                    return self.create_with_retry().await;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn create_with_retry(&self) -> ApiClient {
        let mut backoff = LinearBackoff::new(self.config.create_backoff_step, self.config.create_backoff_max);
        loop {
            match ApiClient::new(&self.config.user_agent_prefix, self.config.request_timeout) {
                Ok(client) => return client,
                Err(e) => {
                    warn!(error = %e, "failed to create upstream client, retrying");
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
    }

    /// Returns a client to the pool, or discards it (and wakes one waiter so
    /// the ceiling slot can be reused) when `retire` is set.
    pub async fn put(&self, client: ApiClient, retire: bool) {
        let mut inner = self.inner.lock().await;
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if retire {
            debug!(user_agent = %client.user_agent, "retiring client");
        } else {
            inner.clients.push_back(client);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn inc_step(&self) -> Duration {
        self.config.inc_step
    }

    pub fn dec_step(&self) -> Duration {
        self.config.dec_step
    }

    pub fn cookie_threshold(&self) -> u32 {
        self.config.cookie_threshold
    }

    /// Current pool size hint, used to decide whether the controller should
    /// grow the pool alongside the worker count.
    pub async fn outstanding(&self) -> usize {
        self.inner.lock().await.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ceiling: usize) -> PoolConfig {
        PoolConfig {
            user_agent_prefix: "test".to_string(),
            request_timeout: Duration::from_secs(5),
            ceiling,
            inc_step: Duration::from_millis(10),
            dec_step: Duration::from_millis(10),
            cookie_threshold: 3,
            create_backoff_step: Duration::from_millis(1),
            create_backoff_max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn take_creates_up_to_ceiling() {
        let pool = ClientPool::new(config(2));
        let a = pool.take().await;
        let b = pool.take().await;
        assert_eq!(pool.outstanding().await, 2);
        pool.put(a, false).await;
        pool.put(b, false).await;
        assert_eq!(pool.outstanding().await, 0);
    }

    #[tokio::test]
    async fn returned_client_is_reused() {
        let pool = ClientPool::new(config(1));
        let client = pool.take().await;
        let user_agent = client.user_agent.clone();
        pool.put(client, false).await;
        let reused = pool.take().await;
        assert_eq!(reused.user_agent, user_agent);
    }

    #[tokio::test]
    async fn retired_client_is_not_reused() {
        let pool = ClientPool::new(config(1));
        let client = pool.take().await;
        let user_agent = client.user_agent.clone();
        pool.put(client, true).await;
        let fresh = pool.take().await;
        assert_ne!(fresh.user_agent, user_agent);
    }

    #[tokio::test]
    async fn take_blocks_at_ceiling_until_return() {
        let pool = ClientPool::new(config(1));
        let client = pool.take().await;
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        pool.put(client, false).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(pool.outstanding().await, 1);
        drop(got);
    }
}
