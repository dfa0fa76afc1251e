//! Pluggable backing stores for sharing state across processes.
//!
//! A [`StateBackend`] holds each key's serialized state together with a
//! version. [`BackedLimiter`] runs an optimistic read, decide and
//! compare-and-swap loop against it, so several processes can enforce one
//! limit through an external shared cache. The in-process [`Limiter`]
//! remains the default; this is an extension point.
//!
//! [`Limiter`]: super::Limiter

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use super::decision::Decision;
use super::engine::Engine;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{RatekeeperError, Result};

/// Default number of read-decide-swap rounds before giving up.
const DEFAULT_MAX_ATTEMPTS: usize = 8;

/// Errors reported by a backing store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for RatekeeperError {
    fn from(err: BackendError) -> Self {
        RatekeeperError::StoreUnavailable(err.to_string())
    }
}

/// Serialized state and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// Trait for external key-state stores.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Fetch the current state for a key.
    async fn get(&self, key: &str) -> std::result::Result<Option<Versioned>, BackendError>;

    /// Unconditionally overwrite a key's state. Returns the new version.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> std::result::Result<u64, BackendError>;

    /// Write `bytes` only if the key is still at `expected` (`None` meaning
    /// absent). Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        bytes: Vec<u8>,
    ) -> std::result::Result<bool, BackendError>;
}

/// Simple in-memory backend.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, Versioned>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> std::result::Result<Option<Versioned>, BackendError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> std::result::Result<u64, BackendError> {
        let mut entry = self.entries.entry(key.to_owned()).or_insert(Versioned {
            version: 0,
            bytes: Vec::new(),
        });
        entry.version += 1;
        entry.bytes = bytes;
        Ok(entry.version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        bytes: Vec<u8>,
    ) -> std::result::Result<bool, BackendError> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if expected != Some(current) {
                    return Ok(false);
                }
                occupied.insert(Versioned {
                    version: current + 1,
                    bytes,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(Versioned { version: 1, bytes });
                Ok(true)
            }
        }
    }
}

/// Limiter whose per-key state lives in a [`StateBackend`].
///
/// Backend failures surface as [`RatekeeperError::StoreUnavailable`] so the
/// caller can pick fail-open or fail-closed; losing every swap surfaces as
/// [`RatekeeperError::Contention`].
#[derive(Debug)]
pub struct BackedLimiter<E, B, C = MonotonicClock> {
    engine: E,
    backend: B,
    clock: C,
    max_attempts: usize,
}

impl<E, B, C> BackedLimiter<E, B, C>
where
    E: Engine,
    E::State: Serialize + DeserializeOwned,
    B: StateBackend,
    C: Clock,
{
    /// Create a new backed limiter.
    pub fn new(engine: E, backend: B, clock: C) -> Self {
        Self {
            engine,
            backend,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set how many read-decide-swap rounds to try per decision.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Result<Self> {
        if max_attempts == 0 {
            return Err(RatekeeperError::invalid("max_attempts must be greater than 0"));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    /// Decide on a request for `key` at the clock's current reading.
    pub async fn decide(&self, key: &str) -> Result<Decision> {
        self.decide_at(key, self.clock.now()).await
    }

    /// Decide on a request for `key` at an explicit reading.
    pub async fn decide_at(&self, key: &str, now: Duration) -> Result<Decision> {
        for attempt in 1..=self.max_attempts {
            let (mut state, expected) = match self.backend.get(key).await? {
                Some(current) => (
                    serde_json::from_slice::<E::State>(&current.bytes)?,
                    Some(current.version),
                ),
                None => (self.engine.new_state(now), None),
            };

            let decision = self.engine.decide(&mut state, now);
            let bytes = serde_json::to_vec(&state)?;

            if self.backend.compare_and_swap(key, expected, bytes).await? {
                trace!(
                    key = %key,
                    engine = self.engine.name(),
                    allowed = decision.allowed,
                    attempt,
                    "Admission decided"
                );
                return Ok(decision);
            }
            trace!(key = %key, attempt, "Lost compare-and-swap race, retrying");
        }

        debug!(key = %key, attempts = self.max_attempts, "Giving up on contended key");
        Err(RatekeeperError::Contention {
            key: key.to_owned(),
            attempts: self.max_attempts,
        })
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
