//! Fixed-window rate limiting.
//!
//! Each key (principal ID on the admin surface, client IP on the
//! public surface) gets a counter that resets at fixed window
//! boundaries. A burst straddling a window edge can admit up to twice
//! the configured limit in a short interval; that imprecision is
//! inherent to fixed windows and accepted here - switching to a
//! sliding window or token bucket would change client-visible
//! admission behavior.
//!
//! The window map is the only cross-request mutable state in the hot
//! path. Every `allow` call mutates the entry, so a write lock is
//! taken per call. A background sweeper evicts keys idle longer than
//! the retention threshold to bound memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Default interval between eviction sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
/// Default inactivity threshold before a key is evicted.
const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    window_reset_at: Instant,
    last_seen_at: Instant,
}

/// Per-key fixed-window counter with background eviction.
///
/// Constructed once at startup and shared via `Arc`. The admin and
/// public surfaces must not share an instance; their key spaces
/// (principal IDs vs. client IPs) are distinct.
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    limit: u32,
    window: Duration,
    sweep_interval: Duration,
    retention: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_eviction(limit, window, DEFAULT_SWEEP_INTERVAL, DEFAULT_RETENTION)
    }

    pub fn with_eviction(
        limit: u32,
        window: Duration,
        sweep_interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            limit,
            window,
            sweep_interval,
            retention,
            sweeper: Mutex::new(None),
        }
    }

    /// Check whether a request for `key` is admitted.
    ///
    /// First sighting creates a window with count 1. Once the current
    /// time passes the window boundary the count resets to 1.
    /// `last_seen_at` is updated on every call, admitted or not.
    pub async fn allow(&self, key: &str) -> bool {
        let mut windows = self.windows.write().await;
        let now = Instant::now();

        match windows.get_mut(key) {
            Some(win) => {
                win.last_seen_at = now;
                if now > win.window_reset_at {
                    win.count = 1;
                    win.window_reset_at = now + self.window;
                    true
                } else {
                    win.count += 1;
                    win.count <= self.limit
                }
            }
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        window_reset_at: now + self.window,
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove keys idle longer than the retention threshold.
    ///
    /// Keys are snapshotted under a read lock first so the write lock
    /// is not held for a full map scan.
    pub async fn sweep(&self) {
        // Saturates when the clock's origin is closer than the
        // retention threshold (nothing can be stale yet).
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return;
        };

        let stale: Vec<String> = {
            let windows = self.windows.read().await;
            windows
                .iter()
                .filter(|(_, w)| w.last_seen_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect()
        };

        if stale.is_empty() {
            return;
        }

        let mut windows = self.windows.write().await;
        for key in &stale {
            // Re-check: the key may have been touched between locks.
            if let Some(w) = windows.get(key) {
                if w.last_seen_at < cutoff {
                    windows.remove(key);
                }
            }
        }
        tracing::debug!(evicted = stale.len(), "Rate limiter sweep completed");
    }

    /// Start the background eviction task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.sweep_interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep().await;
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(old) = sweeper.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop the background eviction task.
    pub fn stop(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }

    /// Number of currently tracked keys.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.read().await.len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}
