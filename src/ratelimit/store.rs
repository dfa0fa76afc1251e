//! Per-key state storage.
//!
//! States live in a sharded [`DashMap`], each behind its own mutex. A shard
//! lock is only held long enough to look up or insert a key's slot, so
//! decisions for unrelated keys never wait on each other, while decisions
//! for the same key are serialized on the slot's mutex.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{RatekeeperError, Result};

/// A key's state plus bookkeeping for idle eviction.
#[derive(Debug)]
struct Slot<S> {
    state: S,
    /// Latest reading at which a decision touched this slot
    last_seen: Duration,
    /// Set under the slot lock when the slot is removed from the map
    evicted: bool,
}

/// Concurrency-safe map from key to lazily created state.
#[derive(Debug)]
pub struct KeyedStateStore<S> {
    entries: DashMap<String, Arc<Mutex<Slot<S>>>>,
}

impl<S: Send + 'static> KeyedStateStore<S> {
    /// Create a store with the default shard amount.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create a store with an explicit shard amount.
    ///
    /// The amount must be a power of two greater than one.
    pub fn with_shards(shards: usize) -> Result<Self> {
        if shards < 2 || !shards.is_power_of_two() {
            return Err(RatekeeperError::invalid(format!(
                "shard amount must be a power of two greater than 1, got {}",
                shards
            )));
        }
        Ok(Self {
            entries: DashMap::with_shard_amount(shards),
        })
    }

    /// Run `f` with exclusive access to `key`'s state, creating it with
    /// `factory` on first use.
    pub fn with_state<R>(
        &self,
        key: &str,
        now: Duration,
        factory: impl Fn(Duration) -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let mut slot = loop {
            let slot = self.slot(key, now, &factory).lock_arc();
            // Lost a race with eviction; the key has to be looked up again
            if !slot.evicted {
                break slot;
            }
            trace!(key = %key, "Slot evicted while waiting, retrying");
        };

        slot.last_seen = slot.last_seen.max(now);
        f(&mut slot.state)
    }

    /// Read `key`'s state without creating it.
    pub fn peek<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        let slot = self.entries.get(key).map(|entry| Arc::clone(entry.value()))?;
        let slot = slot.lock();
        if slot.evicted {
            return None;
        }
        Some(f(&slot.state))
    }

    /// Remove every key not touched within `idle_timeout` of `now`.
    ///
    /// Keys with a decision in flight are skipped. Returns the number of
    /// keys removed.
    pub fn evict_idle(&self, now: Duration, idle_timeout: Duration) -> usize {
        let mut evicted = 0;
        self.entries.retain(|key, slot| {
            let Some(mut slot) = slot.try_lock() else {
                return true;
            };
            if slot.last_seen.saturating_add(idle_timeout) > now {
                return true;
            }
            trace!(key = %key, last_seen = ?slot.last_seen, "Evicting idle state");
            slot.evicted = true;
            evicted += 1;
            false
        });

        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted idle rate limit state");
        }
        evicted
    }

    /// Remove `key`'s state. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                slot.lock().evicted = true;
                true
            }
            None => false,
        }
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.entries.retain(|_, slot| {
            slot.lock().evicted = true;
            false
        });
    }

    /// Get the number of keys with state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has state.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(
        &self,
        key: &str,
        now: Duration,
        factory: &impl Fn(Duration) -> S,
    ) -> Arc<Mutex<Slot<S>>> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }

        let entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
            debug!(key = %key, "Creating new rate limit state");
            Arc::new(Mutex::new(Slot {
                state: factory(now),
                last_seen: now,
                evicted: false,
            }))
        });
        Arc::clone(entry.value())
    }
}

impl<S: Send + 'static> Default for KeyedStateStore<S> {
    fn default() -> Self {
        Self::new()
    }
}
