// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTL-indexed map with heap-backed lazy eviction.
//!
//! Each entry carries a last-touch deadline; a binary min-heap of
//! `(deadline, key)` pairs makes the periodic sweep O(log n) per expired
//! entry. Deadline updates are lazy: `refresh` pushes a new heap entry
//! without removing the stale one, and the sweep discards entries whose
//! heap deadline no longer matches the recorded one.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::GatewayError;

/// Callback invoked after an entry is removed from the map.
///
/// Runs outside the map's mutex, so a hook may reenter this map or pop
/// from a paired one. Errors are logged and swallowed; they never stop a
/// sweep.
#[async_trait]
pub trait EvictHook<T>: Send + Sync {
    async fn on_evict(&self, key: &str, value: T) -> Result<(), GatewayError>;
}

struct Inner<T> {
    data: HashMap<String, T>,
    deadlines: HashMap<String, Instant>,
    // Min-heap of (deadline, key); stale entries are discarded at sweep time.
    heap: BinaryHeap<Reverse<(Instant, String)>>,
}

/// A mapping of key to value that tracks an idle deadline per key and
/// evicts entries that have not been touched within the timeout.
pub struct IdleMap<T, C: Clock = SystemClock> {
    inner: Mutex<Inner<T>>,
    idle_timeout: Duration,
    clock: C,
    hook: Option<Arc<dyn EvictHook<T>>>,
}

impl<T> IdleMap<T, SystemClock>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_clock(idle_timeout, SystemClock)
    }
}

impl<T, C> IdleMap<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Clock,
{
    pub fn with_clock(idle_timeout: Duration, clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: HashMap::new(),
                deadlines: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            idle_timeout,
            clock,
            hook: None,
        }
    }

    pub fn with_hook(idle_timeout: Duration, clock: C, hook: Arc<dyn EvictHook<T>>) -> Self {
        let mut map = Self::with_clock(idle_timeout, clock);
        map.hook = Some(hook);
        map
    }

    /// Add or update an entry, stamping the current time.
    pub async fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let deadline = self.clock.now() + self.idle_timeout;
        let mut inner = self.inner.lock().await;
        inner.data.insert(key.clone(), value);
        inner.deadlines.insert(key.clone(), deadline);
        inner.heap.push(Reverse((deadline, key)));
    }

    /// Return a clone of the value without touching the deadline.
    pub async fn get(&self, key: &str) -> Option<T> {
        self.inner.lock().await.data.get(key).cloned()
    }

    /// Extend the deadline for an existing key.
    pub async fn refresh(&self, key: &str) {
        let deadline = self.clock.now() + self.idle_timeout;
        let mut inner = self.inner.lock().await;
        if inner.data.contains_key(key) {
            inner.deadlines.insert(key.to_string(), deadline);
            inner.heap.push(Reverse((deadline, key.to_string())));
        }
    }

    /// Remove the key and return its value, if present.
    ///
    /// The evict hook is invoked exactly once per removed entry, after the
    /// lock is released.
    pub async fn pop(&self, key: &str) -> Option<T> {
        let value = {
            let mut inner = self.inner.lock().await;
            inner.deadlines.remove(key);
            inner.data.remove(key)
        };
        if let Some(ref v) = value {
            if let Some(hook) = &self.hook {
                if let Err(e) = hook.on_evict(key, v.clone()).await {
                    warn!(key, error = %e, "evict hook failed");
                }
            }
        }
        value
    }

    /// Snapshot of the current keys.
    pub async fn keys(&self) -> Vec<String> {
        self.inner.lock().await.data.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.data.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.data.contains_key(key)
    }

    /// Evict every entry whose recorded deadline has passed.
    ///
    /// Heap entries made stale by a later `refresh` are discarded; an entry
    /// whose key was refreshed past `now` is pushed back with its current
    /// deadline and the scan stops there, since everything deeper in the
    /// heap expires no earlier.
    pub async fn sweep(&self) {
        let now = self.clock.now();
        let mut expired: Vec<String> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            loop {
                match inner.heap.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= now => {}
                    _ => break,
                }
                let Some(Reverse((_, key))) = inner.heap.pop() else {
                    break;
                };
                match inner.deadlines.get(&key).copied() {
                    // Key already removed; discard the stale heap entry.
                    None => continue,
                    Some(current) if current <= now => expired.push(key),
                    Some(current) => {
                        inner.heap.push(Reverse((current, key)));
                        break;
                    }
                }
            }
        }
        for key in expired {
            self.pop(&key).await;
        }
    }

    /// Periodically run the sweep until the task is cancelled.
    pub async fn run_sweep_forever(&self, interval: Duration) {
        loop {
            self.sweep().await;
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
#[path = "idle_map_tests.rs"]
mod tests;
