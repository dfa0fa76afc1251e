//! Named policies, each enforced by its own limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::decision::{Decision, Usage};
use super::engine::{Engine, Strategy};
use super::limiter::Limiter;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{RatekeeperConfig, StoreConfig};
use crate::error::{RatekeeperError, Result};

/// A set of independently configured limiters sharing one clock.
#[derive(Debug)]
pub struct PolicyRegistry<C: Clock + Clone = MonotonicClock> {
    limiters: HashMap<String, Limiter<Strategy, C>>,
    store: StoreConfig,
}

impl<C: Clock + Clone> PolicyRegistry<C> {
    /// Build every configured policy. Fails on the first invalid one.
    pub fn from_config(config: &RatekeeperConfig, clock: C) -> Result<Self> {
        if config.policies.is_empty() {
            return Err(RatekeeperError::invalid("at least one policy must be configured"));
        }

        let mut limiters = HashMap::with_capacity(config.policies.len());
        for (name, algorithm) in &config.policies {
            let engine = algorithm.build().map_err(|e| match e {
                RatekeeperError::InvalidConfiguration(msg) => {
                    RatekeeperError::invalid(format!("policy '{}': {}", name, msg))
                }
                other => other,
            })?;
            let store = config.store.build_store()?;
            debug!(policy = %name, engine = engine.name(), "Policy configured");
            limiters.insert(name.clone(), Limiter::with_store(engine, store, clock.clone()));
        }

        info!(policies = limiters.len(), "Loaded rate limit policies");
        Ok(Self {
            limiters,
            store: config.store.clone(),
        })
    }

    /// Decide on a request for `key` under `policy`.
    pub fn decide(&self, policy: &str, key: &str) -> Result<Decision> {
        Ok(self.get(policy)?.decide(key))
    }

    /// Decide on a request for `key` under `policy` at an explicit reading.
    pub fn decide_at(&self, policy: &str, key: &str, now: Duration) -> Result<Decision> {
        Ok(self.get(policy)?.decide_at(key, now))
    }

    /// Weighted decision for `key` under `policy`.
    pub fn decide_n(&self, policy: &str, key: &str, cost: u64) -> Result<Decision> {
        self.get(policy)?.decide_n(key, cost)
    }

    /// Current consumption for `key` under `policy`.
    pub fn usage(&self, policy: &str, key: &str) -> Result<Option<Usage>> {
        Ok(self.get(policy)?.usage(key))
    }

    /// Get the limiter for a policy.
    pub fn limiter(&self, policy: &str) -> Option<&Limiter<Strategy, C>> {
        self.limiters.get(policy)
    }

    /// Names of all configured policies.
    pub fn policies(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Remove idle keys from every policy. Returns the total removed.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        self.limiters
            .values()
            .map(|limiter| limiter.evict_idle(idle_timeout))
            .sum()
    }

    fn get(&self, policy: &str) -> Result<&Limiter<Strategy, C>> {
        self.limiters
            .get(policy)
            .ok_or_else(|| RatekeeperError::UnknownPolicy(policy.to_string()))
    }
}

impl<C: Clock + Clone + 'static> PolicyRegistry<C> {
    /// Start the configured idle eviction sweep.
    ///
    /// Returns `None` when no idle timeout is configured.
    pub fn spawn_idle_eviction(self: Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        let Some(idle_timeout) = self.store.idle_timeout()? else {
            return Ok(None);
        };
        let every = self.store.sweep_interval()?;

        info!(
            policies = self.limiters.len(),
            idle_timeout = ?idle_timeout,
            every = ?every,
            "Starting idle eviction"
        );

        Ok(Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle(idle_timeout);
                if evicted > 0 {
                    info!(evicted, "Idle eviction sweep completed");
                }
            }
        })))
    }
}
