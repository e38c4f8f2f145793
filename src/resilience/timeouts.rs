//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap external calls with a timeout derived from a flat duration, a deadline, or both
//! - Cancel operations cleanly on timeout
//! - Track in-flight operations for introspection and manual cancellation
//! - Keep rolling duration/outcome statistics
//!
//! # Design Decisions
//! - Uses Tokio's timer facilities; the losing branch of the race is dropped,
//!   which aborts the underlying I/O rather than abandoning it
//! - Timeout errors are distinct from deadline errors: a deadline that ran out
//!   cannot be helped by a retry, an attempt timeout can
//! - Statistics keep a bounded history; oldest entries are evicted first
//! - An id already in flight is suffixed with `~<seq>` so both runs stay tracked

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::observability::metrics;
use crate::resilience::deadline::Deadline;
use crate::resilience::error::{ResilienceError, TimeoutError};
use crate::resilience::retries::deadline_spent;

/// How a single operation should be bounded.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub operation_id: Option<String>,
    pub parent_id: Option<String>,
    pub timeout: Option<Duration>,
    pub deadline: Option<Deadline>,
}

impl RunOptions {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// An operation currently running under the manager.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: String,
    pub parent_id: Option<String>,
    pub timeout: Duration,
    pub started_at: Instant,
    pub deadline: Deadline,
    cancel: CancellationToken,
    seq: u64,
}

impl OperationContext {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Rolling statistics over the most recent operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationStats {
    pub total: usize,
    pub timed_out: usize,
    pub average_duration: Duration,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct OperationRecord {
    duration: Duration,
    timed_out: bool,
}

/// Removes the operation from the in-flight map however the run ends,
/// including when the caller drops the future.
struct ActiveGuard<'a> {
    active: &'a DashMap<String, OperationContext>,
    operation_id: String,
    seq: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.operation_id, |_, ctx| ctx.seq == self.seq);
    }
}

/// Runs units of work under timeouts and deadlines.
#[derive(Debug)]
pub struct TimeoutManager {
    default_timeout: Duration,
    history_capacity: usize,
    active: DashMap<String, OperationContext>,
    next_seq: AtomicU64,
    history: Mutex<VecDeque<OperationRecord>>,
}

impl TimeoutManager {
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.default_ms),
            history_capacity: config.history_capacity.max(1),
            active: DashMap::new(),
            next_seq: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `work` bounded by `options`.
    ///
    /// The effective limit is the tighter of the operation timeout (falling back
    /// to the configured default when neither a timeout nor a deadline is given)
    /// and the deadline's remaining budget. `work` receives a token that is
    /// cancelled when the limit fires or the operation is cancelled by id.
    pub async fn run<T, E, F, Fut>(&self, options: RunOptions, work: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let operation_id = options
            .operation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(deadline) = options.deadline {
            if deadline.is_expired() {
                tracing::debug!(operation_id = %operation_id, "Deadline already spent, not starting");
                metrics::record_operation("deadline_exceeded");
                return Err(deadline_spent(&operation_id));
            }
        }

        let timeout = match (options.timeout, options.deadline) {
            (Some(timeout), _) => timeout,
            (None, Some(deadline)) => deadline.remaining(),
            (None, None) => self.default_timeout,
        };
        let started_at = Instant::now();
        let own_deadline = Deadline::at(started_at + timeout);
        let (deadline, deadline_binds) = match options.deadline {
            Some(parent) if parent <= own_deadline => (parent, true),
            _ => (own_deadline, false),
        };

        let cancel = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let context = |operation_id: String| OperationContext {
            operation_id,
            parent_id: options.parent_id.clone(),
            timeout,
            started_at,
            deadline,
            cancel: cancel.clone(),
            seq,
        };
        let operation_id = match self.active.entry(operation_id) {
            Entry::Vacant(slot) => {
                let id = slot.key().clone();
                slot.insert(context(id.clone()));
                id
            }
            Entry::Occupied(taken) => {
                let id = format!("{}~{seq}", taken.key());
                drop(taken);
                tracing::debug!(operation_id = %id, "Operation id already in flight, suffixed");
                self.active.insert(id.clone(), context(id.clone()));
                id
            }
        };
        let _guard = ActiveGuard {
            active: &self.active,
            operation_id: operation_id.clone(),
            seq,
        };

        let work = work(cancel.clone());
        tokio::pin!(work);

        let outcome = tokio::select! {
            biased;
            result = &mut work => Ok(result),
            _ = tokio::time::sleep_until(deadline.expires_at()) => Err(true),
            _ = cancel.cancelled() => Err(false),
        };

        let elapsed = started_at.elapsed();
        match outcome {
            Ok(result) => {
                self.record(elapsed, false);
                metrics::record_operation(if result.is_ok() { "ok" } else { "error" });
                result.map_err(ResilienceError::Inner)
            }
            Err(true) => {
                cancel.cancel();
                self.record(elapsed, true);
                if deadline_binds {
                    tracing::warn!(operation_id = %operation_id, elapsed_ms = elapsed.as_millis() as u64, "Deadline exceeded during operation");
                    metrics::record_operation("deadline_exceeded");
                    Err(deadline_spent(&operation_id))
                } else {
                    tracing::warn!(operation_id = %operation_id, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
                    metrics::record_operation("timeout");
                    Err(TimeoutError {
                        operation_id,
                        timeout,
                        elapsed,
                    }
                    .into())
                }
            }
            Err(false) => {
                self.record(elapsed, false);
                tracing::info!(operation_id = %operation_id, "Operation cancelled");
                metrics::record_operation("cancelled");
                Err(ResilienceError::Cancelled { operation_id })
            }
        }
    }

    /// Cancel an in-flight operation. Returns false if it is not running.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.active.get(operation_id) {
            Some(ctx) => {
                ctx.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of in-flight operations.
    pub fn active_operations(&self) -> Vec<OperationContext> {
        self.active.iter().map(|r| r.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> OperationStats {
        let history = self.history.lock();
        let total = history.len();
        if total == 0 {
            return OperationStats::default();
        }

        let sum: Duration = history.iter().map(|r| r.duration).sum();
        OperationStats {
            total,
            timed_out: history.iter().filter(|r| r.timed_out).count(),
            average_duration: sum / total as u32,
            max_duration: history.iter().map(|r| r.duration).max().unwrap_or_default(),
        }
    }

    fn record(&self, duration: Duration, timed_out: bool) {
        let mut history = self.history.lock();
        history.push_back(OperationRecord { duration, timed_out });
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(&TimeoutConfig::default())
    }
}
