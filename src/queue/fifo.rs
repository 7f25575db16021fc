//! FIFO queue with batching.
//!
//! Items drain in arrival order. Dispatcher workers either run the per-item
//! handler, or, when a `batch_fn` is registered, collect up to `batch_size`
//! items and flush early once the first buffered item has waited
//! `batch_timeout`. An empty batch is never flushed. A bounded queue makes
//! `put` wait for room instead of rejecting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::{join_workers, Handler, Queue, QueueState};
use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics, Timer};
use crate::wrap::Backoff;

const DEFAULT_MAX_SIZE: usize = 10_000;

/// Failed batches are retried this many times with exponential delay
/// before they are dropped and counted.
const BATCH_RETRIES: u32 = 3;

pub type BatchFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a plain async closure into a [`BatchFn`].
pub fn batch_fn<T, F, Fut>(f: F) -> BatchFn<T>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |batch| Box::pin(f(batch)))
}

struct Core<T> {
    items: VecDeque<T>,
    state: QueueState,
}

struct Inner<T> {
    core: Mutex<Core<T>>,
    not_empty: Notify,
    not_full: Notify,
    workers: usize,
    max_size: usize,
    batch_size: usize,
    batch_timeout: Duration,
    batch: Option<BatchFn<T>>,
    handler: Option<Handler<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct FifoQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FifoQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> FifoQueue<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    items: VecDeque::new(),
                    state: QueueState::Open,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                workers,
                max_size: DEFAULT_MAX_SIZE,
                batch_size: 1,
                batch_timeout: Duration::from_secs(1),
                batch: None,
                handler: None,
                tasks: Mutex::new(Vec::new()),
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

    /// Process items in batches of up to `batch_size`; a partial batch
    /// flushes once its first item has waited `batch_timeout`.
    pub fn batching(self, batch_size: usize, batch_timeout: Duration, f: BatchFn<T>) -> Self {
        self.update(|inner| {
            inner.batch_size = batch_size.max(1);
            inner.batch_timeout = batch_timeout;
            inner.batch = Some(f);
        })
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

    /// Pop without waiting.
    fn try_pop(&self) -> Option<T> {
        let mut core = self.inner.core.lock();
        let item = core.items.pop_front();
        if item.is_some() {
            if !core.items.is_empty() {
                self.inner.not_empty.notify_one();
            }
            self.inner
                .metrics
                .gauge("queue.fifo.size", core.items.len() as f64);
            self.inner.not_full.notify_one();
        }
        item
    }

    /// Collect a batch: wait for the first item, then top up until
    /// `batch_size` or until the first item has waited `batch_timeout`.
    async fn collect_batch(&self) -> Result<Vec<T>> {
        let first = self.get().await?;
        let mut batch = Vec::with_capacity(self.inner.batch_size);
        batch.push(first);

        let deadline = tokio::time::Instant::now() + self.inner.batch_timeout;
        while batch.len() < self.inner.batch_size {
            if let Some(item) = self.try_pop() {
                batch.push(item);
                continue;
            }
            let wait = self.inner.not_empty.notified();
            tokio::select! {
                _ = wait => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
            // Re-check state so a draining queue flushes what it has.
            {
                let core = self.inner.core.lock();
                if core.state != QueueState::Open && core.items.is_empty() {
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn run_batch(inner: &Arc<Inner<T>>, f: &BatchFn<T>, batch: Vec<T>) {
        let size = batch.len();
        let backoff = Backoff::new(Duration::from_millis(100), 2.0);
        let mut remaining = Some(batch);

        for attempt in 0..=BATCH_RETRIES {
            let current = remaining.take().expect("retry state lost");
            let payload = if attempt < BATCH_RETRIES {
                remaining = Some(current.clone());
                current
            } else {
                current
            };
            match f(payload).await {
                Ok(()) => {
                    inner.metrics.incr("queue.fifo.batches", 1);
                    inner.metrics.incr("queue.fifo.processed", size as u64);
                    return;
                }
                Err(err) if attempt < BATCH_RETRIES => {
                    warn!(attempt, size, error = %err, "batch handler failed, retrying");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
                Err(err) => {
                    error!(size, error = %err, "batch handler failed, dropping batch");
                    inner.metrics.incr("queue.fifo.batch_failures", 1);
                    return;
                }
            }
        }
    }

    async fn worker(inner: Arc<Inner<T>>, worker_id: usize) {
        let queue = FifoQueue {
            inner: Arc::clone(&inner),
        };
        loop {
            if let Some(batch) = inner.batch.as_ref() {
                let items = match queue.collect_batch().await {
                    Ok(items) => items,
                    Err(_) => break,
                };
                let _timer = Timer::new(
                    Arc::clone(&inner.metrics),
                    format!("queue.fifo.worker.{worker_id}"),
                );
                Self::run_batch(&inner, batch, items).await;
                continue;
            }

            let item = match queue.get().await {
                Ok(item) => item,
                Err(_) => break,
            };
            let handler = match &inner.handler {
                Some(handler) => Arc::clone(handler),
                None => break,
            };
            let _timer = Timer::new(
                Arc::clone(&inner.metrics),
                format!("queue.fifo.worker.{worker_id}"),
            );
            match handler(item).await {
                Ok(()) => inner
                    .metrics
                    .incr(&format!("queue.fifo.worker.{worker_id}.processed"), 1),
                Err(err) => {
                    warn!(worker_id, error = %err, "fifo worker handler failed");
                    inner
                        .metrics
                        .incr(&format!("queue.fifo.worker.{worker_id}.errors"), 1);
                }
            }
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Queue<T> for FifoQueue<T> {
    async fn put(&self, item: T) -> Result<()> {
        let mut item = Some(item);
        loop {
            let room = self.inner.not_full.notified();
            tokio::pin!(room);
            room.as_mut().enable();
            {
                let mut core = self.inner.core.lock();
                match core.state {
                    QueueState::Open => {}
                    _ => return Err(Error::QueueStopped),
                }
                if core.items.len() < self.inner.max_size {
                    core.items.push_back(item.take().expect("item already enqueued"));
                    self.inner
                        .metrics
                        .gauge("queue.fifo.size", core.items.len() as f64);
                    self.inner.metrics.incr("queue.fifo.put", 1);
                    self.inner.not_empty.notify_one();
                    return Ok(());
                }
            }
            // Full: wait for a consumer to make room.
            room.await;
        }
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
                        .gauge("queue.fifo.size", core.items.len() as f64);
                    self.inner.metrics.incr("queue.fifo.get", 1);
                    self.inner.not_full.notify_one();
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
        if self.inner.handler.is_none() && self.inner.batch.is_none() {
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
        self.inner.not_full.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        join_workers(handles, deadline).await;

        self.inner.core.lock().state = QueueState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fifo_order() {
        let q: FifoQueue<u32> = FifoQueue::new(0);
        for i in 0..5 {
            q.put(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.get().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_bounded_put_waits_for_room() {
        let q: FifoQueue<u32> = FifoQueue::new(0).max_size(1);
        q.put(1).await.unwrap();

        let q2 = q.clone();
        let blocked = tokio::spawn(async move { q2.put(2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert_eq!(q.get().await.unwrap(), 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(q.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_size() {
        let batches: Arc<PlMutex<Vec<Vec<u32>>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let q: FifoQueue<u32> = FifoQueue::new(1).batching(
            3,
            Duration::from_secs(30),
            batch_fn(move |batch| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(batch);
                    Ok(())
                }
            }),
        );
        q.start().await.unwrap();

        for i in 0..6 {
            q.put(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        q.stop(Some(Duration::from_secs(1))).await.unwrap();

        let collected = batches.lock();
        let total: usize = collected.iter().map(|b| b.len()).sum();
        assert_eq!(total, 6);
        assert!(collected.iter().all(|b| b.len() <= 3));
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_on_timeout() {
        let batches: Arc<PlMutex<Vec<Vec<u32>>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let q: FifoQueue<u32> = FifoQueue::new(1).batching(
            100,
            Duration::from_millis(100),
            batch_fn(move |batch| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(batch);
                    Ok(())
                }
            }),
        );
        q.start().await.unwrap();

        q.put(7).await.unwrap();
        q.put(8).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        {
            let collected = batches.lock();
            assert_eq!(collected.len(), 1);
            assert_eq!(collected[0], vec![7, 8]);
        }
        q.stop(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_per_item_handler() {
        let processed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&processed);
        let q: FifoQueue<u32> = FifoQueue::new(2).handler(handler(move |_| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        q.start().await.unwrap();
        for i in 0..20 {
            q.put(i).await.unwrap();
        }
        q.stop(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_puts() {
        let q: FifoQueue<u32> = FifoQueue::new(0);
        q.stop(None).await.unwrap();
        assert!(matches!(q.put(1).await, Err(Error::QueueStopped)));
    }
}
