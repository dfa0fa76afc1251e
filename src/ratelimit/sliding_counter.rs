//! Sliding window counter.
//!
//! Approximates a rolling window with two aligned counters. The previous
//! window's count is weighted by the share of it that still overlaps the
//! rolling window, assuming its requests were spread evenly:
//!
//! ```text
//! estimate = current_count + previous_count * (1 - overlap)
//! ```
//!
//! Against an exact log of the same arrivals the estimate overshoots by at
//! most `previous_count * (1 - overlap)`, which is bounded by `max_requests`.
//! Because a single aligned window never admits more than `max_requests`, no
//! rolling interval of one window length admits more than `2 * max_requests`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::decision::{Decision, Usage};
use super::engine::{require_count, require_window, Engine};
use crate::clock::align_down;
use crate::error::Result;

/// Counters for the current aligned window and the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualWindowState {
    /// Start of the window before the current one
    pub previous_window_start: Duration,
    /// Requests admitted in the previous window
    pub previous_count: u64,
    /// Start of the aligned window containing the latest reading
    pub current_window_start: Duration,
    /// Requests admitted in the current window so far
    pub current_count: u64,
}

/// Weighted two-window approximation of a sliding log.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounterEngine {
    window: Duration,
    max_requests: u64,
}

impl SlidingWindowCounterEngine {
    /// Create a new sliding counter engine.
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

    /// Weighted request count for `state` as of `now`.
    pub fn estimate(&self, state: &DualWindowState, now: Duration) -> f64 {
        let rolled = self.rolled(state, now);
        let weight = 1.0 - self.overlap(&rolled, now);
        rolled.current_count as f64 + rolled.previous_count as f64 * weight
    }

    /// `state` shifted forward to the window containing `now`.
    fn rolled(&self, state: &DualWindowState, now: Duration) -> DualWindowState {
        let bucket = align_down(now, self.window);
        if bucket <= state.current_window_start {
            return *state;
        }

        // A gap of more than one window leaves nothing to carry over
        let previous_count = if bucket - state.current_window_start > self.window {
            0
        } else {
            state.current_count
        };
        DualWindowState {
            previous_window_start: bucket - self.window,
            previous_count,
            current_window_start: bucket,
            current_count: 0,
        }
    }

    /// Elapsed fraction of the current window, in `[0, 1)`.
    fn overlap(&self, state: &DualWindowState, now: Duration) -> f64 {
        let elapsed = now.saturating_sub(state.current_window_start);
        (elapsed.as_secs_f64() / self.window.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Best-effort wait until the estimate falls below the limit, assuming no
    /// further arrivals. Rounded up to whole milliseconds, plus one so the
    /// retry lands strictly past the crossing point.
    fn retry_after(&self, state: &DualWindowState, now: Duration) -> Duration {
        let window = self.window.as_secs_f64();
        let max = self.max_requests as f64;
        let current = state.current_count as f64;
        let previous = state.previous_count as f64;
        let elapsed = now.saturating_sub(state.current_window_start).as_secs_f64();

        let wait = if current < max && previous > 0.0 {
            // Decay of the previous window's weight is enough
            let overlap_needed = 1.0 - (max - current) / previous;
            overlap_needed * window - elapsed
        } else {
            // The current count alone is at the limit; it has to become the
            // previous window and decay from there
            let overlap_needed = (1.0 - max / current).max(0.0);
            (window - elapsed) + overlap_needed * window
        };

        Duration::from_millis(((wait.max(0.0) * 1000.0).ceil() as u64).saturating_add(1))
    }
}

impl Engine for SlidingWindowCounterEngine {
    type State = DualWindowState;

    fn name(&self) -> &'static str {
        "sliding_counter"
    }

    fn new_state(&self, now: Duration) -> DualWindowState {
        let bucket = align_down(now, self.window);
        DualWindowState {
            previous_window_start: bucket.saturating_sub(self.window),
            previous_count: 0,
            current_window_start: bucket,
            current_count: 0,
        }
    }

    fn decide(&self, state: &mut DualWindowState, now: Duration) -> Decision {
        *state = self.rolled(state, now);

        let estimate = state.current_count as f64
            + state.previous_count as f64 * (1.0 - self.overlap(state, now));
        let max = self.max_requests as f64;

        if estimate < max {
            state.current_count += 1;
            let remaining = (max - estimate - 1.0).max(0.0).floor() as u64;
            Decision::allow(remaining)
        } else {
            Decision::deny(self.retry_after(state, now))
        }
    }

    fn usage(&self, state: &DualWindowState, now: Duration) -> Usage {
        Usage::new(self.max_requests, self.estimate(state, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::sliding_log::SlidingWindowLogEngine;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(SlidingWindowCounterEngine::new(Duration::ZERO, 3).is_err());
        assert!(SlidingWindowCounterEngine::new(secs(10), 0).is_err());
    }

    #[test]
    fn test_limit_within_first_window() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 3).unwrap();
        let mut state = engine.new_state(Duration::ZERO);

        for _ in 0..3 {
            assert!(engine.decide(&mut state, secs(1)).is_allowed());
        }
        let denied = engine.decide(&mut state, secs(2));
        assert!(!denied.is_allowed());
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_previous_window_is_weighted() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 10).unwrap();
        let mut state = engine.new_state(Duration::ZERO);
        for _ in 0..10 {
            assert!(engine.decide(&mut state, secs(1)).is_allowed());
        }

        // Halfway through the next window the previous ten weigh as five
        let now = secs(15);
        assert_eq!(engine.estimate(&state, now), 5.0);

        let admitted = (0..10)
            .filter(|_| engine.decide(&mut state, now).is_allowed())
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(state.previous_count, 10);
        assert_eq!(state.current_count, 5);
    }

    #[test]
    fn test_skipped_window_drops_previous_count() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 5).unwrap();
        let mut state = engine.new_state(Duration::ZERO);
        for _ in 0..5 {
            engine.decide(&mut state, secs(2));
        }

        engine.decide(&mut state, secs(31));
        assert_eq!(state.previous_count, 0);
        assert_eq!(state.previous_window_start, secs(20));
        assert_eq!(state.current_window_start, secs(30));
        assert_eq!(state.current_count, 1);
    }

    #[test]
    fn test_windows_stay_adjacent() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 5).unwrap();
        let mut state = engine.new_state(secs(13));
        for t in [13, 14, 27, 28, 61, 75] {
            engine.decide(&mut state, secs(t));
            assert_eq!(
                state.current_window_start,
                state.previous_window_start + engine.window()
            );
        }
    }

    #[test]
    fn test_stale_reading_keeps_window_starts() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 5).unwrap();
        let mut state = engine.new_state(secs(21));
        engine.decide(&mut state, secs(21));
        engine.decide(&mut state, secs(22));

        assert!(engine.decide(&mut state, secs(5)).is_allowed());
        assert_eq!(state.previous_window_start, secs(10));
        assert_eq!(state.current_window_start, secs(20));
        assert_eq!(state.current_count, 3);

        // Back on the real clock, the stale admission counts like any other
        assert!(engine.decide(&mut state, secs(23)).is_allowed());
        assert!(engine.decide(&mut state, secs(23)).is_allowed());
        assert!(!engine.decide(&mut state, secs(23)).is_allowed());
    }

    #[test]
    fn test_huge_window_saturates_retry_after() {
        let engine = SlidingWindowCounterEngine::new(Duration::MAX, 1).unwrap();
        let mut state = engine.new_state(secs(1));
        assert!(engine.decide(&mut state, secs(1)).is_allowed());

        let denied = engine.decide(&mut state, secs(1));
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after, Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn test_retry_after_is_enough() {
        let engine = SlidingWindowCounterEngine::new(secs(10), 4).unwrap();
        let mut state = engine.new_state(Duration::ZERO);
        for _ in 0..4 {
            engine.decide(&mut state, secs(8));
        }
        for now in [secs(9), Duration::from_millis(13_500), secs(16)] {
            while engine.decide(&mut state, now).is_allowed() {}

            let denied = engine.decide(&mut state, now);
            assert!(!denied.is_allowed(), "Request at {:?} should be denied", now);

            let retry_at = now + denied.retry_after.unwrap();
            let mut probe = state;
            assert!(
                engine.decide(&mut probe, retry_at).is_allowed(),
                "Retrying at {:?} should be allowed",
                retry_at
            );
        }
    }

    #[test]
    fn test_estimate_tracks_exact_log() {
        let window = secs(10);
        let max = 20;
        let counter = SlidingWindowCounterEngine::new(window, max).unwrap();
        // Unbounded log of the counter's own admissions
        let log = SlidingWindowLogEngine::new(window, u64::MAX).unwrap();

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut state = counter.new_state(Duration::ZERO);
        let mut exact = log.new_state(Duration::ZERO);
        let mut admitted: Vec<Duration> = Vec::new();
        let mut now = Duration::ZERO;

        for _ in 0..5_000 {
            now += Duration::from_millis(rng.gen_range(0..400));

            let estimate = counter.estimate(&state, now);
            let exact_count = log.usage(&exact, now).used;
            let tolerance = counter.rolled(&state, now).previous_count as f64;
            assert!(
                estimate <= exact_count + tolerance,
                "estimate {} exceeds exact {} + {} at {:?}",
                estimate,
                exact_count,
                tolerance,
                now
            );

            if counter.decide(&mut state, now).is_allowed() {
                admitted.push(now);
                log.decide(&mut exact, now);
            }
        }

        // No interval of one window length admits more than twice the limit
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t < start + window)
                .count() as u64;
            assert!(in_window <= 2 * max, "{} admitted from {:?}", in_window, start);
        }
        assert!(!admitted.is_empty());
    }

    #[test]
    fn test_remaining_never_exceeds_limit() {
        let engine = SlidingWindowCounterEngine::new(secs(1), 3).unwrap();
        let mut state = engine.new_state(Duration::ZERO);
        for i in 0..50 {
            let decision = engine.decide(&mut state, Duration::from_millis(i * 70));
            assert!(decision.remaining.unwrap() <= 3);
            assert!(state.current_count <= 3);
        }
    }
}
