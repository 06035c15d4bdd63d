//! Fixed-window rate limiting
//!
//! Each request is counted against a per-minute and a per-hour window for
//! its (subject, endpoint) pair. The check and the increment happen in one
//! atomic counter-store call, so concurrent requests from the same subject
//! cannot overshoot a ceiling.

pub mod limiter;
pub mod middleware;
pub mod store;
pub mod window;

pub use limiter::{RateDecision, RateLimiter, DEFAULT_PER_HOUR, DEFAULT_PER_MINUTE};
pub use middleware::rate_limit_middleware;
pub use store::{CounterStore, MemoryCounterStore, SqliteCounterStore, WindowLimit, WindowOutcome};
pub use window::{Granularity, RateWindowKey};
