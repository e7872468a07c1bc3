//! A bounded pool for fire-and-forget work.
//!
//! Spawned futures run off the caller's path and nobody awaits their result.
//! The pool caps how many are outstanding: when it is full a new task is
//! rejected immediately instead of waiting for a permit.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub struct DetachedTasks {
    label: &'static str,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DetachedTasks {
    pub fn new(label: &'static str, max_in_flight: usize) -> Self {
        Self {
            label,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn `task` if there is room. Returns `false` when the pool is full
    /// or shutting down; the task is dropped unrun in that case.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(pool = self.label, "Pool shutting down, task dropped");
            return false;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(pool = self.label, in_flight = self.in_flight(), "Pool full, task rejected");
            return false;
        };

        let cancel = self.cancel.clone();
        let label = self.label;
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = cancel.cancelled() => debug!(pool = label, "Detached task cancelled"),
                _ = task => {}
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task spawned so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel outstanding tasks and wait for them to unwind.
    pub async fn shutdown(&self) {
        let outstanding = self.in_flight();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(pool = self.label, cancelled = outstanding, "Detached pool stopped");
    }
}
