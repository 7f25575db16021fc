//! Queue family.
//!
//! Five variants behind one `put`/`get`/`size`/`start`/`stop` contract.
//! Every queue owns an optional dispatcher: `start()` spawns `workers`
//! tasks that pull items and run the handler registered at construction.
//! Without a handler the queue is a plain data structure driven through
//! `get()`.
//!
//! Shutdown is graceful: `stop(deadline)` refuses further `put`s, lets the
//! workers drain what is queued, and aborts whatever is still in flight
//! once the deadline passes.

mod broadcast;
mod dedupe;
mod delay;
mod fifo;
mod priority;

pub use broadcast::{BroadcastQueue, Subscription};
pub use dedupe::{DedupeQueue, KeyFn};
pub use delay::DelayQueue;
pub use fifo::{batch_fn, BatchFn, FifoQueue};
pub use priority::PriorityQueue;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Item handler run by dispatcher workers.
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a plain async closure into a [`Handler`].
pub fn handler<T, F, Fut>(f: F) -> Handler<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |item| Box::pin(f(item)))
}

/// Common queue contract. Variant-specific `put` flavors (priority, delay,
/// dedupe verdicts) are inherent methods on each type.
#[async_trait]
pub trait Queue<T: Send + 'static>: Send + Sync {
    /// Enqueue with the variant's defaults.
    async fn put(&self, item: T) -> Result<()>;

    /// Take the next item, waiting if none is ready. Errors with
    /// `QueueStopped` once the queue is draining and empty.
    async fn get(&self) -> Result<T>;

    /// Items currently queued.
    fn size(&self) -> usize;

    /// Spawn the dispatcher workers.
    async fn start(&self) -> Result<()>;

    /// Drain and shut down; see module docs.
    async fn stop(&self, deadline: Option<Duration>) -> Result<()>;
}

/// Queue lifecycle. `Open` accepts puts, `Draining` lets workers empty the
/// backlog, `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueState {
    Open,
    Draining,
    Stopped,
}

/// Join worker tasks, aborting whatever is still running once the deadline
/// passes. No deadline means wait for a full drain.
pub(crate) async fn join_workers(handles: Vec<JoinHandle<()>>, deadline: Option<Duration>) {
    match deadline {
        None => {
            for handle in handles {
                let _ = handle.await;
            }
        }
        Some(deadline) => {
            let cutoff = Instant::now() + deadline;
            for mut handle in handles {
                let remaining = cutoff.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }
    }
}
