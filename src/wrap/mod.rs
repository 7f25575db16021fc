//! Invocation wrappers: rate-limited calls, queued calls, circuit breaking,
//! retry with exponential backoff, and batch collection.

mod batch;
mod breaker;
mod queued;
mod rate_limited;
mod retry;

pub use batch::{batch_map, BatchCollector};
pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use queued::Queued;
pub use rate_limited::{RateLimited, RejectionMode};
pub use retry::{retry, Backoff};
