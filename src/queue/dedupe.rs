//! Dedupe queue.
//!
//! FIFO delivery plus a membership table of content keys: an item whose key
//! was already enqueued within `ttl` is silently dropped, so repeated
//! requests for the same work run once. Expired keys are purged lazily and
//! by a periodic full pass.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{join_workers, Handler, Queue, QueueState};
use crate::clock::{system_clock, Clock};
use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics};

const DEFAULT_MAX_SIZE: usize = 10_000;

/// Full purge of the seen-table every this many offers.
const SWEEP_EVERY: u64 = 256;

pub type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

struct Core<T> {
    items: VecDeque<T>,
    seen: AHashMap<String, u64>,
    state: QueueState,
    offers: u64,
}

struct Inner<T> {
    core: Mutex<Core<T>>,
    not_empty: Notify,
    workers: usize,
    max_size: usize,
    ttl: Duration,
    key_fn: KeyFn<T>,
    handler: Option<Handler<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

pub struct DedupeQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DedupeQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Hash + Send + 'static> DedupeQueue<T> {
    /// Default key: content hash of the item.
    pub fn new(workers: usize, ttl: Duration) -> Self {
        Self::with_key_fn(workers, ttl, |item: &T| {
            let mut hasher = ahash::AHasher::default();
            item.hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        })
    }
}

impl<T: Send + 'static> DedupeQueue<T> {
    pub fn with_key_fn(
        workers: usize,
        ttl: Duration,
        key_fn: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    items: VecDeque::new(),
                    seen: AHashMap::new(),
                    state: QueueState::Open,
                    offers: 0,
                }),
                not_empty: Notify::new(),
                workers,
                max_size: DEFAULT_MAX_SIZE,
                ttl,
                key_fn: Arc::new(key_fn),
                handler: None,
                tasks: Mutex::new(Vec::new()),
                clock: system_clock(),
                metrics: default_metrics(),
            }),
        }
    }

    pub fn max_size(self, max_size: usize) -> Self {
        self.update(|inner| inner.max_size = max_size.max(1))
    }

    pub fn handler(self, handler: Handler<T>) -> Self {
        self.update(|inner| inner.handler = Some(handler))
    }

    pub fn clock(self, clock: Arc<dyn Clock>) -> Self {
        self.update(|inner| inner.clock = clock)
    }

    pub fn metrics(self, metrics: Arc<Metrics>) -> Self {
        self.update(|inner| inner.metrics = metrics)
    }

    fn update(mut self, f: impl FnOnce(&mut Inner<T>)) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }

    /// Enqueue unless a matching key is already live. Returns whether the
    /// item was accepted (false = duplicate, dropped).
    pub async fn offer(&self, item: T) -> Result<bool> {
        let key = (self.inner.key_fn)(&item);
        let now = self.inner.clock.now_ms();
        {
            let mut core = self.inner.core.lock();
            match core.state {
                QueueState::Open => {}
                _ => return Err(Error::QueueStopped),
            }

            core.offers += 1;
            if core.offers % SWEEP_EVERY == 0 {
                core.seen.retain(|_, expiry| *expiry > now);
            }

            match core.seen.get(&key) {
                Some(&expiry) if expiry > now => {
                    self.inner.metrics.incr("queue.dedupe.duplicates", 1);
                    return Ok(false);
                }
                _ => {}
            }
            if core.items.len() >= self.inner.max_size {
                return Err(Error::QueueFull);
            }

            let expiry = now + self.inner.ttl.as_millis() as u64;
            core.seen.insert(key, expiry);
            core.items.push_back(item);
            self.inner
                .metrics
                .gauge("queue.dedupe.size", core.items.len() as f64);
        }
        self.inner.metrics.incr("queue.dedupe.put", 1);
        self.inner.not_empty.notify_one();
        Ok(true)
    }

    async fn worker(inner: Arc<Inner<T>>, worker_id: usize) {
        let handler = match &inner.handler {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let queue = DedupeQueue {
            inner: Arc::clone(&inner),
        };
        loop {
            let item = match queue.get().await {
                Ok(item) => item,
                Err(_) => break,
            };
            match handler(item).await {
                Ok(()) => inner
                    .metrics
                    .incr(&format!("queue.dedupe.worker.{worker_id}.processed"), 1),
                Err(err) => {
                    warn!(worker_id, error = %err, "dedupe worker handler failed");
                    inner
                        .metrics
                        .incr(&format!("queue.dedupe.worker.{worker_id}.errors"), 1);
                }
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for DedupeQueue<T> {
    /// Duplicates are dropped and counted, not surfaced as errors; use
    /// [`DedupeQueue::offer`] for the verdict.
    async fn put(&self, item: T) -> Result<()> {
        self.offer(item).await.map(|_| ())
    }

    async fn get(&self) -> Result<T> {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut core = self.inner.core.lock();
                if let Some(item) = core.items.pop_front() {
                    if !core.items.is_empty() {
                        self.inner.not_empty.notify_one();
                    }
                    self.inner
                        .metrics
                        .gauge("queue.dedupe.size", core.items.len() as f64);
                    self.inner.metrics.incr("queue.dedupe.get", 1);
                    return Ok(item);
                }
                if core.state != QueueState::Open {
                    return Err(Error::QueueStopped);
                }
            }
            notified.await;
        }
    }

    fn size(&self) -> usize {
        self.inner.core.lock().items.len()
    }

    async fn start(&self) -> Result<()> {
        if self.inner.handler.is_none() {
            return Ok(());
        }
        let mut tasks = self.inner.tasks.lock();
        for worker_id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(Self::worker(inner, worker_id)));
        }
        Ok(())
    }

    async fn stop(&self, deadline: Option<Duration>) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.state == QueueState::Stopped {
                return Err(Error::QueueStopped);
            }
            core.state = QueueState::Draining;
        }
        self.inner.not_empty.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        join_workers(handles, deadline).await;

        self.inner.core.lock().state = QueueState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue_at(clock: &Arc<ManualClock>, ttl_ms: u64) -> DedupeQueue<String> {
        DedupeQueue::new(0, Duration::from_millis(ttl_ms))
            .clock(clock.clone() as Arc<dyn Clock>)
    }

    #[tokio::test]
    async fn test_duplicates_within_ttl_dropped() {
        let clock = ManualClock::new(1_000);
        let q = queue_at(&clock, 500);

        assert!(q.offer("index-user-7".to_string()).await.unwrap());
        assert!(!q.offer("index-user-7".to_string()).await.unwrap());
        assert!(q.offer("index-user-8".to_string()).await.unwrap());
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn test_key_expires_after_ttl() {
        let clock = ManualClock::new(1_000);
        let q = queue_at(&clock, 500);

        assert!(q.offer("job".to_string()).await.unwrap());
        clock.advance(501);
        assert!(q.offer("job".to_string()).await.unwrap());
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn test_key_survives_dequeue() {
        let clock = ManualClock::new(1_000);
        let q = queue_at(&clock, 10_000);

        assert!(q.offer("job".to_string()).await.unwrap());
        assert_eq!(q.get().await.unwrap(), "job");
        // Still within ttl: at most one of the pair runs.
        assert!(!q.offer("job".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_key_fn() {
        let clock = ManualClock::new(1_000);
        let q: DedupeQueue<(u32, String)> =
            DedupeQueue::with_key_fn(0, Duration::from_secs(60), |(id, _): &(u32, String)| id.to_string())
                .clock(clock.clone() as Arc<dyn Clock>);

        assert!(q.offer((1, "first".into())).await.unwrap());
        // Same id, different payload: duplicate.
        assert!(!q.offer((1, "second".into())).await.unwrap());
        assert!(q.offer((2, "other".into())).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_hides_the_verdict() {
        let clock = ManualClock::new(1_000);
        let q = queue_at(&clock, 500);

        q.put("x".to_string()).await.unwrap();
        q.put("x".to_string()).await.unwrap();
        assert_eq!(q.size(), 1);
    }
}
