//! A dynamically sized set of worker tasks, shared by the queue controller
//! (scale up/down) and the supervisor (top up to minimum). Each entry owns
//! a child of the pipeline's shutdown token,
//! so both a targeted "stop one worker" and a global shutdown terminate the
//! same way: cooperatively, at the worker's next TAKE boundary.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Entry {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct WorkerSet {
    entries: Mutex<Vec<Entry>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Spawns one worker bound to a fresh child of `parent`, via `spawn_fn`.
    pub async fn spawn(&self, parent: &CancellationToken, spawn_fn: impl FnOnce(CancellationToken) -> JoinHandle<()>) {
        let token = parent.child_token();
        let handle = spawn_fn(token.clone());
        self.entries.lock().await.push(Entry { token, handle });
    }

    /// Cancels and drops the most recently spawned worker (LIFO, so the
    /// steady-state minimum workers are the longest-lived).
    pub async fn stop_one(&self) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.pop() {
            entry.token.cancel();
        }
    }

    pub async fn cancel_all(&self) {
        let entries = self.entries.lock().await;
        for entry in entries.iter() {
            entry.token.cancel();
        }
    }

    /// Drops entries whose task already exited (panic, or finished after a
    /// targeted cancellation) so the supervisor can see the true live count
    /// and top back up to the configured minimum.
    pub async fn reap_finished(&self) {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| !e.handle.is_finished());
    }

    pub async fn join_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.drain(..) {
            let _ = entry.handle.await;
        }
    }

    /// Cancels every worker, then waits up to `grace` per task for it to exit
    /// cleanly before aborting the straggler.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_all().await;
        let mut entries = self.entries.lock().await;
        for entry in entries.drain(..) {
            let mut handle = entry.handle;
            tokio::select! {
                res = &mut handle => { let _ = res; }
                _ = tokio::time::sleep(grace) => { handle.abort(); }
            }
        }
    }
}
