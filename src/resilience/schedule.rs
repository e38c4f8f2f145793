//! Delayed task scheduling with first-class cancellation.
//!
//! Every scheduled task is a spawned tokio task racing a sleep against its
//! cancellation token. Pending tasks are tracked until they fire or are
//! cancelled, so shutdown can cancel outstanding retry timers in one call.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to one scheduled task.
#[derive(Debug)]
pub struct ScheduleHandle {
    id: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
    pending: Arc<DashMap<u64, CancellationToken>>,
}

impl ScheduleHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Prevent the task from running. No effect once it has fired.
    pub fn cancel(&self) {
        self.token.cancel();
        self.pending.remove(&self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the task has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Runs futures after a delay.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, CancellationToken>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled first.
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F) -> ScheduleHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.pending.insert(id, token.clone());

        let pending = self.pending.clone();
        let child = token.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    pending.remove(&id);
                    task().await;
                }
            }
        });

        ScheduleHandle {
            id,
            token,
            join,
            pending: self.pending.clone(),
        }
    }

    /// Number of tasks waiting for their delay to elapse.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every task that has not fired yet. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, token)) = self.pending.remove(&id) {
                token.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled pending scheduled tasks");
        }
        cancelled
    }
}
