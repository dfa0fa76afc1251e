//! Token bucket.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decision::{Decision, Usage};
use super::engine::{require_count, require_rate, saturating_secs, Engine};
use crate::error::{RatekeeperError, Result};

/// Token level of a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens available, in `[0, capacity]`
    pub level: f64,
    /// Reading at which `level` was last brought up to date
    pub last_refill: Duration,
}

/// Admits bursts of up to `capacity` requests, refilling continuously at
/// `refill_rate` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucketEngine {
    capacity: u64,
    refill_rate: f64,
}

impl TokenBucketEngine {
    /// Create a new token bucket engine. Buckets start full.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self> {
        require_count("capacity", capacity)?;
        require_rate("refill_rate", refill_rate)?;
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Get the bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, state: &mut TokenBucketState, now: Duration) {
        if now < state.last_refill {
            debug!(
                now = ?now,
                last_refill = ?state.last_refill,
                "Clock regression, skipping refill"
            );
            return;
        }

        let elapsed = (now - state.last_refill).as_secs_f64();
        state.level = (state.level + elapsed * self.refill_rate).min(self.capacity as f64);
        state.last_refill = now;
    }

    fn take(&self, state: &mut TokenBucketState, now: Duration, cost: u64) -> Decision {
        self.refill(state, now);

        let cost = cost as f64;
        if state.level >= cost {
            state.level -= cost;
            Decision::allow(state.level.floor() as u64)
        } else {
            let missing = cost - state.level;
            Decision::deny(saturating_secs(missing / self.refill_rate))
        }
    }
}

impl Engine for TokenBucketEngine {
    type State = TokenBucketState;

    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn new_state(&self, now: Duration) -> TokenBucketState {
        TokenBucketState {
            level: self.capacity as f64,
            last_refill: now,
        }
    }

    fn decide(&self, state: &mut TokenBucketState, now: Duration) -> Decision {
        self.take(state, now, 1)
    }

    /// Take `cost` tokens at once. A cost above capacity could never be
    /// granted and is rejected before the bucket is touched.
    fn decide_n(
        &self,
        state: &mut TokenBucketState,
        now: Duration,
        cost: u64,
    ) -> Result<Decision> {
        if cost == 0 || cost > self.capacity {
            return Err(RatekeeperError::InvalidCost {
                cost,
                reason: format!("must be between 1 and capacity {}", self.capacity),
            });
        }
        Ok(self.take(state, now, cost))
    }

    fn usage(&self, state: &TokenBucketState, now: Duration) -> Usage {
        let mut state = *state;
        self.refill(&mut state, now);
        Usage::new(self.capacity, self.capacity as f64 - state.level)
    }
}
