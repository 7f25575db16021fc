//! fluxq — async concurrency-control toolkit.
//!
//! Regulates the rate at which work enters a system and orchestrates how it
//! is scheduled, batched, deduplicated, and dispatched to worker pools:
//!
//! - **Limiters** (token bucket, sliding window, leaky bucket, adaptive
//!   AIMD, composite) over pluggable storage, so one budget can span a
//!   whole fleet.
//! - **Queues** (priority, batching FIFO, delay, dedupe, broadcast) with
//!   dispatcher workers and graceful shutdown.
//! - **Storage** backends: in-process memory, Redis, and a two-tier hybrid.
//! - **Coordinator** for leader election with heartbeat over shared
//!   storage.
//! - **Wrappers**: rate-limited and queued invocation, circuit breaker,
//!   retry with exponential backoff, batch collection.
//! - **Metrics** recorder with counters, gauges, and bounded histograms,
//!   renderable in the Prometheus text format.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fluxq::limiter::{Limiter, TokenBucket};
//! use fluxq::storage::MemoryStorage;
//!
//! # async fn demo() -> fluxq::Result<()> {
//! let limiter = TokenBucket::new(100.0, Duration::from_secs(1), Arc::new(MemoryStorage::new()))
//!     .scope("api");
//! if limiter.acquire("user-42", 1.0).await? {
//!     // proceed with the call
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod flux;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod wrap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use flux::{Flux, FluxConfig, FluxStats};
pub use limiter::{
    AdaptiveConfig, AdaptiveLimiter, CompositeLimiter, LeakyBucket, Limiter, LimiterStats,
    QuickBucket, SlidingWindow, TokenBucket,
};
pub use metrics::{Metrics, Timer};
pub use pool::{JobHandle, PoolConfig, WorkerPool};
pub use queue::{
    BroadcastQueue, DedupeQueue, DelayQueue, FifoQueue, PriorityQueue, Queue, Subscription,
};
pub use scheduler::Scheduler;
pub use storage::{HybridStorage, MemoryStorage, RedisStorage, Storage};
pub use wrap::{
    batch_map, retry, Backoff, BatchCollector, BreakerError, BreakerState, CircuitBreaker, Queued,
    RateLimited, RejectionMode,
};
