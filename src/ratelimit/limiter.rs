//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::decision::{Decision, Usage};
use super::engine::{Engine, Strategy};
use super::store::KeyedStateStore;
use crate::clock::{Clock, MonotonicClock};
use crate::config::LimiterConfig;
use crate::error::{RatekeeperError, Result};

/// Binds an engine to a per-key state store and a clock.
///
/// This struct is thread-safe and can be shared across threads and tasks.
#[derive(Debug)]
pub struct Limiter<E: Engine, C: Clock = MonotonicClock> {
    engine: E,
    store: KeyedStateStore<E::State>,
    clock: C,
}

impl<E: Engine> Limiter<E, MonotonicClock> {
    /// Create a limiter driven by the process's monotonic clock.
    pub fn monotonic(engine: E) -> Self {
        Self::new(engine, MonotonicClock::new())
    }
}

impl<E: Engine, C: Clock> Limiter<E, C> {
    /// Create a new limiter with an empty default store.
    pub fn new(engine: E, clock: C) -> Self {
        Self::with_store(engine, KeyedStateStore::new(), clock)
    }

    /// Create a new limiter over an existing store.
    pub fn with_store(engine: E, store: KeyedStateStore<E::State>, clock: C) -> Self {
        Self {
            engine,
            store,
            clock,
        }
    }

    /// Decide on a request for `key` at the clock's current reading.
    pub fn decide(&self, key: &str) -> Decision {
        self.decide_at(key, self.clock.now())
    }

    /// Decide on a request for `key` at an explicit reading.
    pub fn decide_at(&self, key: &str, now: Duration) -> Decision {
        let decision = self.store.with_state(
            key,
            now,
            |now| self.engine.new_state(now),
            |state| self.engine.decide(state, now),
        );

        trace!(
            key = %key,
            engine = self.engine.name(),
            allowed = decision.allowed,
            remaining = ?decision.remaining,
            "Admission decided"
        );
        if !decision.allowed {
            debug!(
                key = %key,
                engine = self.engine.name(),
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Decide on a request for `key` that weighs `cost` units.
    ///
    /// Only engines with weighted admission accept a cost other than one.
    pub fn decide_n(&self, key: &str, cost: u64) -> Result<Decision> {
        self.decide_n_at(key, cost, self.clock.now())
    }

    /// Weighted decision at an explicit reading.
    pub fn decide_n_at(&self, key: &str, cost: u64, now: Duration) -> Result<Decision> {
        let decision = self.store.with_state(
            key,
            now,
            |now| self.engine.new_state(now),
            |state| self.engine.decide_n(state, now, cost),
        )?;

        trace!(
            key = %key,
            engine = self.engine.name(),
            cost,
            allowed = decision.allowed,
            "Weighted admission decided"
        );
        if !decision.allowed {
            debug!(
                key = %key,
                engine = self.engine.name(),
                cost,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Current consumption for `key`, or `None` if it has no state.
    pub fn usage(&self, key: &str) -> Option<Usage> {
        let now = self.clock.now();
        self.store.peek(key, |state| self.engine.usage(state, now))
    }

    /// Forget `key`'s state. Returns whether it existed.
    pub fn reset(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    /// Remove state for keys idle for at least `idle_timeout`.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        self.store.evict_idle(self.clock.now(), idle_timeout)
    }

    /// Get the number of keys with state.
    pub fn key_count(&self) -> usize {
        self.store.len()
    }

    /// Get the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Get the clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<E: Engine + 'static, C: Clock + 'static> Limiter<E, C> {
    /// Sweep idle keys every `every` on the current tokio runtime.
    ///
    /// Sweeps never block in-flight decisions; keys being decided on are
    /// skipped until the next sweep. Abort the returned handle to stop.
    pub fn spawn_idle_eviction(
        self: Arc<Self>,
        idle_timeout: Duration,
        every: Duration,
    ) -> Result<JoinHandle<()>> {
        if every.is_zero() {
            return Err(RatekeeperError::invalid(
                "sweep interval must be greater than 0",
            ));
        }

        info!(
            engine = self.engine.name(),
            idle_timeout = ?idle_timeout,
            every = ?every,
            "Starting idle eviction"
        );

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(idle_timeout);
                if evicted > 0 {
                    info!(
                        evicted,
                        keys = self.key_count(),
                        "Idle eviction sweep completed"
                    );
                }
            }
        }))
    }
}

impl<C: Clock> Limiter<Strategy, C> {
    /// Build a limiter from configuration.
    pub fn from_config(config: &LimiterConfig, clock: C) -> Result<Self> {
        let engine = config.algorithm.build()?;
        let store = config.store.build_store()?;
        debug!(engine = engine.name(), "Limiter configured");
        Ok(Self::with_store(engine, store, clock))
    }
}
