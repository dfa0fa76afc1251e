//! Fixed window counter.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decision::{Decision, Usage};
use super::engine::{require_count, require_window, Engine};
use crate::clock::align_down;
use crate::error::Result;

/// Counter for the aligned window a key is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounterState {
    /// Start of the current window, a multiple of the window size
    pub window_start: Duration,
    /// Requests admitted in the current window
    pub count: u64,
}

/// Admits up to `max_requests` per aligned window of `window` length.
///
/// Counters reset at window boundaries, so up to `2 * max_requests` requests
/// can be admitted within any rolling interval that straddles a boundary.
#[derive(Debug, Clone)]
pub struct FixedWindowEngine {
    window: Duration,
    max_requests: u64,
}

impl FixedWindowEngine {
    /// Create a new fixed window engine.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        require_window(window)?;
        require_count("max_requests", max_requests)?;
        Ok(Self {
            window,
            max_requests,
        })
    }

    /// Get the window size.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the per-window limit.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

impl Engine for FixedWindowEngine {
    type State = WindowCounterState;

    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn new_state(&self, now: Duration) -> WindowCounterState {
        WindowCounterState {
            window_start: align_down(now, self.window),
            count: 0,
        }
    }

    fn decide(&self, state: &mut WindowCounterState, now: Duration) -> Decision {
        let bucket = align_down(now, self.window);
        if bucket > state.window_start {
            state.window_start = bucket;
            state.count = 0;
        } else if bucket < state.window_start {
            debug!(
                now = ?now,
                window_start = ?state.window_start,
                "Clock regression, keeping current window"
            );
        }

        if state.count < self.max_requests {
            state.count += 1;
            Decision::allow(self.max_requests - state.count)
        } else {
            let reset_at = state.window_start.saturating_add(self.window);
            Decision::deny(reset_at.saturating_sub(now))
        }
    }

    fn usage(&self, state: &WindowCounterState, now: Duration) -> Usage {
        let used = if align_down(now, self.window) > state.window_start {
            0
        } else {
            state.count
        };
        Usage::new(self.max_requests, used as f64)
    }
}
