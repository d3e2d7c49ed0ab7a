// Utility functions and helpers

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of named async mutexes, created on first use and dropped once the
/// last holder releases them.
///
/// Used to serialize work per resume key and per node execution without a
/// global lock.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Guard for one key; releases (and garbage-collects) the key on drop.
pub struct KeyedGuard {
    key: String,
    map: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            map: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map still references the mutex: nobody holds or waits on it.
        if let Some(entry) = map.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

/// Longest timeout a plan may declare: one hundred years.
pub const MAX_TIMEOUT_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

/// Deadline `ms` milliseconds from `now`, clamped to [`MAX_TIMEOUT_MS`].
pub fn deadline_after(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    TimeDelta::try_milliseconds(ms.min(MAX_TIMEOUT_MS) as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds since the epoch; `i64::MAX` stands for "never".
pub fn epoch_millis(at: Option<DateTime<Utc>>) -> i64 {
    at.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX)
}
