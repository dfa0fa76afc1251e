//! The admission engine contract and its configuration-selected variant.

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::decision::{Decision, Usage};
use super::fixed_window::{FixedWindowEngine, WindowCounterState};
use super::leaky_bucket::{LeakyBucketEngine, LeakyBucketState};
use super::sliding_counter::{DualWindowState, SlidingWindowCounterEngine};
use super::sliding_log::{LogState, SlidingWindowLogEngine};
use super::token_bucket::{TokenBucketEngine, TokenBucketState};
use crate::error::{RatekeeperError, Result};

/// An admission-control algorithm.
///
/// Engines are stateless with respect to keys: all per-key data lives in
/// `Self::State`, which the caller owns and hands in under exclusive access
/// for the duration of one call.
pub trait Engine: Send + Sync + Debug {
    /// Per-key state this engine mutates.
    type State: Send + 'static;

    /// Short algorithm name used in logs.
    fn name(&self) -> &'static str;

    /// Fresh state for a key first seen at `now`.
    fn new_state(&self, now: Duration) -> Self::State;

    /// Apply the algorithm to `state` and decide on one request.
    fn decide(&self, state: &mut Self::State, now: Duration) -> Decision;

    /// Decide on a request weighing `cost` units.
    ///
    /// Engines without weighted admission accept only a cost of one.
    fn decide_n(&self, state: &mut Self::State, now: Duration, cost: u64) -> Result<Decision> {
        if cost != 1 {
            return Err(RatekeeperError::InvalidCost {
                cost,
                reason: format!("{} admits one request at a time", self.name()),
            });
        }
        Ok(self.decide(state, now))
    }

    /// Consumption of `state` as of `now`, without mutating it.
    fn usage(&self, state: &Self::State, now: Duration) -> Usage;
}

pub(crate) fn require_window(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(RatekeeperError::invalid("window size must be greater than 0"));
    }
    Ok(())
}

pub(crate) fn require_count(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(RatekeeperError::invalid(format!(
            "{} must be greater than 0",
            field
        )));
    }
    Ok(())
}

pub(crate) fn require_rate(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RatekeeperError::invalid(format!(
            "{} must be a finite number greater than 0, got {}",
            field, value
        )));
    }
    Ok(())
}

/// Seconds as a [`Duration`], saturating at [`Duration::MAX`].
///
/// Hints such as `deficit / rate` overflow a `Duration` for tiny rates.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// One of the five engines, selected at construction time.
#[derive(Debug, Clone)]
pub enum Strategy {
    FixedWindow(FixedWindowEngine),
    SlidingLog(SlidingWindowLogEngine),
    SlidingCounter(SlidingWindowCounterEngine),
    TokenBucket(TokenBucketEngine),
    LeakyBucket(LeakyBucketEngine),
}

/// Per-key state matching a [`Strategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrategyState {
    FixedWindow(WindowCounterState),
    SlidingLog(LogState),
    SlidingCounter(DualWindowState),
    TokenBucket(TokenBucketState),
    LeakyBucket(LeakyBucketState),
}

impl Engine for Strategy {
    type State = StrategyState;

    fn name(&self) -> &'static str {
        match self {
            Strategy::FixedWindow(engine) => engine.name(),
            Strategy::SlidingLog(engine) => engine.name(),
            Strategy::SlidingCounter(engine) => engine.name(),
            Strategy::TokenBucket(engine) => engine.name(),
            Strategy::LeakyBucket(engine) => engine.name(),
        }
    }

    fn new_state(&self, now: Duration) -> StrategyState {
        match self {
            Strategy::FixedWindow(engine) => StrategyState::FixedWindow(engine.new_state(now)),
            Strategy::SlidingLog(engine) => StrategyState::SlidingLog(engine.new_state(now)),
            Strategy::SlidingCounter(engine) => {
                StrategyState::SlidingCounter(engine.new_state(now))
            }
            Strategy::TokenBucket(engine) => StrategyState::TokenBucket(engine.new_state(now)),
            Strategy::LeakyBucket(engine) => StrategyState::LeakyBucket(engine.new_state(now)),
        }
    }

    fn decide(&self, state: &mut StrategyState, now: Duration) -> Decision {
        match (self, &mut *state) {
            (Strategy::FixedWindow(engine), StrategyState::FixedWindow(s)) => engine.decide(s, now),
            (Strategy::SlidingLog(engine), StrategyState::SlidingLog(s)) => engine.decide(s, now),
            (Strategy::SlidingCounter(engine), StrategyState::SlidingCounter(s)) => {
                engine.decide(s, now)
            }
            (Strategy::TokenBucket(engine), StrategyState::TokenBucket(s)) => engine.decide(s, now),
            (Strategy::LeakyBucket(engine), StrategyState::LeakyBucket(s)) => engine.decide(s, now),
            _ => {
                // State written by a differently configured engine
                *state = self.new_state(now);
                self.decide(state, now)
            }
        }
    }

    fn decide_n(&self, state: &mut StrategyState, now: Duration, cost: u64) -> Result<Decision> {
        match (self, &mut *state) {
            (Strategy::TokenBucket(engine), StrategyState::TokenBucket(s)) => {
                engine.decide_n(s, now, cost)
            }
            (Strategy::TokenBucket(_), _) => {
                *state = self.new_state(now);
                self.decide_n(state, now, cost)
            }
            _ if cost == 1 => Ok(self.decide(state, now)),
            _ => Err(RatekeeperError::InvalidCost {
                cost,
                reason: format!("{} admits one request at a time", self.name()),
            }),
        }
    }

    fn usage(&self, state: &StrategyState, now: Duration) -> Usage {
        match (self, state) {
            (Strategy::FixedWindow(engine), StrategyState::FixedWindow(s)) => engine.usage(s, now),
            (Strategy::SlidingLog(engine), StrategyState::SlidingLog(s)) => engine.usage(s, now),
            (Strategy::SlidingCounter(engine), StrategyState::SlidingCounter(s)) => {
                engine.usage(s, now)
            }
            (Strategy::TokenBucket(engine), StrategyState::TokenBucket(s)) => engine.usage(s, now),
            (Strategy::LeakyBucket(engine), StrategyState::LeakyBucket(s)) => engine.usage(s, now),
            _ => self.usage(&self.new_state(now), now),
        }
    }
}

impl From<FixedWindowEngine> for Strategy {
    fn from(engine: FixedWindowEngine) -> Self {
        Strategy::FixedWindow(engine)
    }
}

impl From<SlidingWindowLogEngine> for Strategy {
    fn from(engine: SlidingWindowLogEngine) -> Self {
        Strategy::SlidingLog(engine)
    }
}

impl From<SlidingWindowCounterEngine> for Strategy {
    fn from(engine: SlidingWindowCounterEngine) -> Self {
        Strategy::SlidingCounter(engine)
    }
}

impl From<TokenBucketEngine> for Strategy {
    fn from(engine: TokenBucketEngine) -> Self {
        Strategy::TokenBucket(engine)
    }
}

impl From<LeakyBucketEngine> for Strategy {
    fn from(engine: LeakyBucketEngine) -> Self {
        Strategy::LeakyBucket(engine)
    }
}
