//! Ratekeeper - Per-Key Admission Control
//!
//! This crate decides, for each incoming request tagged with a key (a user,
//! client or endpoint), whether it may proceed now or must be rejected. Five
//! interchangeable algorithms are provided: fixed window, sliding window log,
//! sliding window counter, token bucket and leaky bucket.
//!
//! State is kept per key in a sharded concurrent map and created lazily on
//! the first request. Decisions for one key are serialized; decisions for
//! different keys proceed in parallel.
//!
//! ```no_run
//! use std::time::Duration;
//! use ratekeeper::ratelimit::{FixedWindowEngine, Limiter};
//!
//! # fn main() -> ratekeeper::Result<()> {
//! let limiter = Limiter::monotonic(FixedWindowEngine::new(Duration::from_secs(60), 100)?);
//! let decision = limiter.decide("client-42");
//! if !decision.is_allowed() {
//!     println!("retry in {:?}", decision.retry_after);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{RatekeeperError, Result};
