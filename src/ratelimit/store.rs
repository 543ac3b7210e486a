//! Counter store abstraction for sliding window counters
//!
//! The limiter never touches window state directly; it asks a [`CounterStore`]
//! to prune, count and insert across every applicable window in one atomic
//! step. The in-process store below is authoritative for a single gateway;
//! the Redis store shares windows across instances.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Counter store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

/// One window taking part in an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    pub key: String,
    pub limit: u32,
    pub window: Duration,
}

impl WindowCheck {
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// State of one window after an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Entries in the window, including the current request when admitted
    pub count: u32,
    /// Timestamp (unix millis) of the oldest entry still in the window
    pub oldest_ms: Option<u64>,
}

/// Outcome of an atomic admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireResult {
    pub admitted: bool,
    /// Index of the first window at its limit, when rejected
    pub failed: Option<usize>,
    /// One entry per requested window, in request order
    pub windows: Vec<WindowState>,
}

/// Backing store for sliding window counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune every window, then record `now_ms` in all of them only if each
    /// has room. Rejected requests leave no entry behind.
    async fn acquire(&self, checks: &[WindowCheck], now_ms: u64) -> Result<AcquireResult, StoreError>;

    /// Entries currently inside the trailing window of `key`
    async fn usage(&self, key: &str, window: Duration, now_ms: u64) -> Result<u32, StoreError>;

    /// Drop expired entries and empty keys, returning the number of keys removed
    async fn prune(&self, now_ms: u64) -> Result<usize, StoreError>;

    /// Remove every counter
    async fn clear(&self) -> Result<(), StoreError>;

    /// Number of live counter keys
    async fn key_count(&self) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for status reports
    fn backend(&self) -> &'static str;
}

#[derive(Debug)]
struct Window {
    window_ms: u64,
    entries: VecDeque<u64>,
}

impl Window {
    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self.entries.front().is_some_and(|&ts| ts <= cutoff) {
            self.entries.pop_front();
        }
    }
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn acquire(&self, checks: &[WindowCheck], now_ms: u64) -> Result<AcquireResult, StoreError> {
        let mut windows = self.windows();
        let mut states = Vec::with_capacity(checks.len());
        let mut failed = None;

        for (i, check) in checks.iter().enumerate() {
            let window = windows.entry(check.key.clone()).or_insert_with(|| Window {
                window_ms: check.window_ms(),
                entries: VecDeque::new(),
            });
            window.window_ms = check.window_ms();
            window.prune(now_ms);

            let count = window.entries.len() as u32;
            if failed.is_none() && count >= check.limit {
                failed = Some(i);
            }
            states.push(WindowState {
                count,
                oldest_ms: window.entries.front().copied(),
            });
        }

        let admitted = failed.is_none();
        if admitted {
            for (check, state) in checks.iter().zip(states.iter_mut()) {
                if let Some(window) = windows.get_mut(&check.key) {
                    window.entries.push_back(now_ms);
                }
                state.count += 1;
                state.oldest_ms.get_or_insert(now_ms);
            }
        }

        Ok(AcquireResult {
            admitted,
            failed,
            windows: states,
        })
    }

    async fn usage(&self, key: &str, window: Duration, now_ms: u64) -> Result<u32, StoreError> {
        let windows = self.windows();
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        Ok(windows
            .get(key)
            .map(|w| w.entries.iter().filter(|&&ts| ts > cutoff).count() as u32)
            .unwrap_or(0))
    }

    async fn prune(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now_ms);
            !window.entries.is_empty()
        });
        Ok(before - windows.len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.windows().clear();
        Ok(())
    }

    async fn key_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .windows()
            .values()
            .filter(|w| !w.entries.is_empty())
            .count())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
