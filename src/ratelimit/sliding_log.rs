//! Sliding window log.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decision::{Decision, Usage};
use super::engine::{require_count, require_window, Engine};
use crate::error::Result;

/// Timestamps of admitted requests, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogState {
    /// Admission times inside the window, non-decreasing
    pub entries: VecDeque<Duration>,
}

/// Exact rolling-window limiter.
///
/// Keeps one timestamp per admitted request. Denied requests are never
/// logged, so a key holds at most `max_requests` entries.
#[derive(Debug, Clone)]
pub struct SlidingWindowLogEngine {
    window: Duration,
    max_requests: u64,
}

impl SlidingWindowLogEngine {
    /// Create a new sliding log engine.
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

    /// Get the rolling-window limit.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    fn prune(&self, state: &mut LogState, now: Duration) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while state.entries.front().is_some_and(|&oldest| oldest < cutoff) {
            state.entries.pop_front();
        }
    }
}

impl Engine for SlidingWindowLogEngine {
    type State = LogState;

    fn name(&self) -> &'static str {
        "sliding_log"
    }

    fn new_state(&self, _now: Duration) -> LogState {
        LogState {
            entries: VecDeque::with_capacity(self.max_requests.min(1024) as usize),
        }
    }

    fn decide(&self, state: &mut LogState, now: Duration) -> Decision {
        // Appends must stay ordered even if a caller's reading is stale
        let now = match state.entries.back() {
            Some(&newest) if now < newest => {
                debug!(now = ?now, newest = ?newest, "Clock regression, clamping to newest entry");
                newest
            }
            _ => now,
        };

        self.prune(state, now);

        let len = state.entries.len() as u64;
        if len < self.max_requests {
            state.entries.push_back(now);
            return Decision::allow(self.max_requests - len - 1);
        }

        let oldest = state.entries.front().copied().unwrap_or(now);
        Decision::deny(oldest.saturating_add(self.window).saturating_sub(now))
    }

    fn usage(&self, state: &LogState, now: Duration) -> Usage {
        let cutoff = now.checked_sub(self.window).unwrap_or(Duration::ZERO);
        let live = state.entries.iter().filter(|&&t| t >= cutoff).count();
        Usage::new(self.max_requests, live as f64)
    }
}
