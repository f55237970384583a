//! Registry of in-flight operation contexts keyed by local identifier.
//!
//! A start event registers its context before the remote create call has
//! returned, so dependents (cases under a group, finish calls for the item
//! itself) use [`OperationRegistry::wait_until_ready`] to block, with a bound,
//! until the remote id is known.
//!
//! Operations on distinct keys run in parallel; operations on the same key
//! are serialized by the underlying shard lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use tally_core::context::Tracked;
use tally_core::ReportError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct OperationRegistry<C: Tracked> {
    entries: DashMap<String, C>,
    active: AtomicUsize,
    peak: AtomicUsize,
    poll_interval: Duration,
}

impl<C: Tracked> OperationRegistry<C> {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            poll_interval,
        }
    }

    /// Register a new context. Returns false, leaving the existing entry
    /// untouched, if the key is already in flight.
    pub fn register(&self, key: impl Into<String>, context: C) -> bool {
        match self.entries.entry(key.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(context);
                // Counted under the shard lock, so unregister can never run first
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<C> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Replace the stored context. Never resurrects an unregistered key.
    pub fn update(&self, key: &str, context: C) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = context;
                true
            }
            None => false,
        }
    }

    /// Read-modify-write under the key's lock. Concurrent modifications of the
    /// same key are applied one after the other, none lost.
    pub fn modify<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut C),
    {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, key: &str) -> Option<C> {
        let (_, context) = self.entries.remove(key)?;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Some(context)
    }

    /// Wait until `key` is registered with a non-empty remote id.
    ///
    /// Fails with [`ReportError::RegistryTimeout`] once `timeout` has elapsed,
    /// never earlier and at most one poll interval later.
    pub async fn wait_until_ready(&self, key: &str, timeout: Duration) -> Result<C, ReportError> {
        self.wait_until(key, timeout, C::is_ready).await
    }

    /// Wait until `key` is registered and `settled` holds for its context.
    pub async fn wait_until<F>(&self, key: &str, timeout: Duration, settled: F) -> Result<C, ReportError>
    where
        F: Fn(&C) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(context) = self.get(key) {
                if settled(&context) {
                    return Ok(context);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReportError::RegistryTimeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Wait for every entry to be unregistered. Returns false on timeout.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// True if any registered context satisfies `pred`.
    pub fn any<F>(&self, pred: F) -> bool
    where
        F: Fn(&C) -> bool,
    {
        self.entries.iter().any(|entry| pred(entry.value()))
    }

    /// Wait until no registered context satisfies `pred`. Returns false on
    /// timeout.
    pub async fn wait_until_none<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&C) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.any(&pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously registered entries seen so far.
    pub fn peak_count(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl<C: Tracked> Default for OperationRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
