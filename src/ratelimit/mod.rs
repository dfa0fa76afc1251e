//! Admission engines, per-key state, and the limiters that bind them.

mod backend;
mod decision;
mod engine;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod registry;
mod sliding_counter;
mod sliding_log;
mod store;
mod token_bucket;

pub use backend::{BackedLimiter, BackendError, InMemoryBackend, StateBackend, Versioned};
pub use decision::{Decision, Usage};
pub use engine::{Engine, Strategy, StrategyState};
pub use fixed_window::{FixedWindowEngine, WindowCounterState};
pub use leaky_bucket::{LeakyBucketEngine, LeakyBucketState};
pub use limiter::Limiter;
pub use registry::PolicyRegistry;
pub use sliding_counter::{DualWindowState, SlidingWindowCounterEngine};
pub use sliding_log::{LogState, SlidingWindowLogEngine};
pub use store::KeyedStateStore;
pub use token_bucket::{TokenBucketEngine, TokenBucketState};
