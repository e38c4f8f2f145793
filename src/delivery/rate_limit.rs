//! Per-subscription fixed-window rate limiting.
//!
//! Windows are aligned to the wall clock (`epoch_ms / window_ms`), so a burst
//! straddling a boundary can see up to twice the limit. This is a soft limit.

use dashmap::DashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::observability::metrics;

#[derive(Debug, Clone, Copy)]
struct Window {
    index: u64,
    count: u32,
}

/// Counts deliveries per key in fixed windows.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            windows: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take one slot for `key` if fewer than `limit` were taken this window.
    pub fn try_acquire(&self, key: &str, limit: u32) -> bool {
        self.try_acquire_at(key, limit, now_ms())
    }

    fn try_acquire_at(&self, key: &str, limit: u32, now_ms: u64) -> bool {
        let index = now_ms / self.window.as_millis().max(1) as u64;
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(Window { index, count: 0 });

        if entry.index != index {
            *entry = Window { index, count: 0 };
        }
        if entry.count >= limit {
            metrics::record_rate_limited();
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop the counters for `key`.
    pub fn forget(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of keys with a live counter.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
