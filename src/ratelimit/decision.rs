//! Admission decisions and usage snapshots.

use std::time::Duration;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Quota left in the current accounting period, if meaningful
    pub remaining: Option<u64>,
    /// How long to wait before retrying; present when denied
    pub retry_after: Option<Duration>,
    /// Advisory queueing delay; present for queueing engines when allowed
    pub estimated_delay: Option<Duration>,
}

impl Decision {
    /// An admitted request with `remaining` quota left.
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining),
            retry_after: None,
            estimated_delay: None,
        }
    }

    /// A rejected request that may be retried after `retry_after`.
    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            retry_after: Some(retry_after),
            estimated_delay: None,
        }
    }

    /// Attach a queueing delay to an admitted request.
    pub fn with_estimated_delay(mut self, delay: Duration) -> Self {
        self.estimated_delay = Some(delay);
        self
    }

    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Read-only view of a key's consumption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    /// Configured bound (max requests, capacity, or queue capacity)
    pub limit: u64,
    /// Amount of the bound currently consumed
    pub used: f64,
    /// Whole units still available
    pub remaining: u64,
}

impl Usage {
    pub(crate) fn new(limit: u64, used: f64) -> Self {
        let used = used.clamp(0.0, limit as f64);
        let remaining = (limit as f64 - used).floor() as u64;
        Self {
            limit,
            used,
            remaining,
        }
    }
}
