//! Leaky bucket as a queue.
//!
//! Unlike the token bucket, which lets a full bucket's worth of requests
//! through at once, the leaky bucket admits requests into a FIFO queue that
//! drains at a constant `leak_rate`. Admitted requests carry the queueing
//! delay a caller would see if it actually held them until their turn.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decision::{Decision, Usage};
use super::engine::{require_count, require_rate, saturating_secs, Engine};
use crate::error::Result;

/// Queue of admitted requests waiting to drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    /// Enqueue readings, oldest first
    pub queue: VecDeque<Duration>,
    /// Reading up to which draining has been accounted for
    pub last_leak: Duration,
}

/// Constant-rate output shaper with a bounded queue.
#[derive(Debug, Clone)]
pub struct LeakyBucketEngine {
    leak_rate: f64,
    queue_capacity: u64,
}

impl LeakyBucketEngine {
    /// Create a new leaky bucket engine.
    pub fn new(leak_rate: f64, queue_capacity: u64) -> Result<Self> {
        require_rate("leak_rate", leak_rate)?;
        require_count("queue_capacity", queue_capacity)?;
        Ok(Self {
            leak_rate,
            queue_capacity,
        })
    }

    /// Get the leak rate in requests per second.
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    /// Get the queue capacity.
    pub fn queue_capacity(&self) -> u64 {
        self.queue_capacity
    }

    fn drain(&self, state: &mut LeakyBucketState, now: Duration) {
        if now < state.last_leak {
            debug!(
                now = ?now,
                last_leak = ?state.last_leak,
                "Clock regression, skipping leak"
            );
            return;
        }

        let elapsed = (now - state.last_leak).as_secs_f64();
        let freed = (elapsed * self.leak_rate).floor();
        if freed < 1.0 {
            return;
        }

        let leaving = (freed as usize).min(state.queue.len());
        state.queue.drain(..leaving);

        // Advance by whole slots only so fractional progress carries over
        let advanced = state
            .last_leak
            .saturating_add(saturating_secs(freed / self.leak_rate));
        state.last_leak = advanced.min(now);
    }
}

impl Engine for LeakyBucketEngine {
    type State = LeakyBucketState;

    fn name(&self) -> &'static str {
        "leaky_bucket"
    }

    fn new_state(&self, now: Duration) -> LeakyBucketState {
        LeakyBucketState {
            queue: VecDeque::new(),
            last_leak: now,
        }
    }

    fn decide(&self, state: &mut LeakyBucketState, now: Duration) -> Decision {
        self.drain(state, now);

        let queued = state.queue.len() as u64;
        if queued < self.queue_capacity {
            state.queue.push_back(now);
            let queued = queued + 1;
            let delay = saturating_secs(queued as f64 / self.leak_rate);
            Decision::allow(self.queue_capacity - queued).with_estimated_delay(delay)
        } else {
            Decision::deny(saturating_secs(1.0 / self.leak_rate))
        }
    }

    fn usage(&self, state: &LeakyBucketState, now: Duration) -> Usage {
        let mut state = state.clone();
        self.drain(&mut state, now);
        Usage::new(self.queue_capacity, state.queue.len() as f64)
    }
}
