//! Priority queue.
//!
//! Binary heap drained strictly by priority, FIFO among equal priorities.
//! `put` rejects with `QueueFull` at `max_size` rather than blocking.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{join_workers, Handler, Queue, QueueState};
use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics, Timer};

const DEFAULT_MAX_SIZE: usize = 10_000;

struct PrioItem<T> {
    priority: i64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for PrioItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for PrioItem<T> {}

impl<T> PartialOrd for PrioItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioItem<T> {
    // Max-heap: larger priority first, earlier sequence first on ties.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Core<T> {
    heap: BinaryHeap<PrioItem<T>>,
    state: QueueState,
    seq: u64,
}

struct Inner<T> {
    core: Mutex<Core<T>>,
    not_empty: Notify,
    workers: usize,
    max_size: usize,
    handler: Option<Handler<T>>,
    priority_fn: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct PriorityQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> PriorityQueue<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    heap: BinaryHeap::new(),
                    state: QueueState::Open,
                    seq: 0,
                }),
                not_empty: Notify::new(),
                workers,
                max_size: DEFAULT_MAX_SIZE,
                handler: None,
                priority_fn: None,
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

    /// Priority computed from the item when `put` is called without one.
    pub fn priority_fn(self, f: impl Fn(&T) -> i64 + Send + Sync + 'static) -> Self {
        self.update(|inner| inner.priority_fn = Some(Arc::new(f)))
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

    pub async fn put_with_priority(&self, item: T, priority: i64) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            match core.state {
                QueueState::Open => {}
                _ => return Err(Error::QueueStopped),
            }
            if core.heap.len() >= self.inner.max_size {
                return Err(Error::QueueFull);
            }
            core.seq += 1;
            let seq = core.seq;
            core.heap.push(PrioItem {
                priority,
                seq,
                item,
            });
            self.inner
                .metrics
                .gauge("queue.priority.size", core.heap.len() as f64);
        }
        self.inner.metrics.incr("queue.priority.put", 1);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    async fn worker(inner: Arc<Inner<T>>, worker_id: usize) {
        let handler = match &inner.handler {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let queue = PriorityQueue {
            inner: Arc::clone(&inner),
        };
        loop {
            let item = match queue.get().await {
                Ok(item) => item,
                Err(_) => break,
            };

            let _timer = Timer::new(
                Arc::clone(&inner.metrics),
                format!("queue.priority.worker.{worker_id}"),
            );
            match handler(item).await {
                Ok(()) => inner
                    .metrics
                    .incr(&format!("queue.priority.worker.{worker_id}.processed"), 1),
                Err(err) => {
                    warn!(worker_id, error = %err, "priority worker handler failed");
                    inner
                        .metrics
                        .incr(&format!("queue.priority.worker.{worker_id}.errors"), 1);
                }
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for PriorityQueue<T> {
    async fn put(&self, item: T) -> Result<()> {
        let priority = self
            .inner
            .priority_fn
            .as_ref()
            .map(|f| f(&item))
            .unwrap_or(0);
        self.put_with_priority(item, priority).await
    }

    async fn get(&self) -> Result<T> {
        loop {
            // Register as a waiter before checking, so a notify landing
            // between the check and the await is not lost.
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut core = self.inner.core.lock();
                if let Some(entry) = core.heap.pop() {
                    self.inner
                        .metrics
                        .gauge("queue.priority.size", core.heap.len() as f64);
                    // Wake another waiter if there is still work.
                    if !core.heap.is_empty() {
                        self.inner.not_empty.notify_one();
                    }
                    self.inner.metrics.incr("queue.priority.get", 1);
                    return Ok(entry.item);
                }
                if core.state != QueueState::Open {
                    return Err(Error::QueueStopped);
                }
            }
            notified.await;
        }
    }

    fn size(&self) -> usize {
        self.inner.core.lock().heap.len()
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
    use crate::queue::handler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_drains_by_priority_fifo_on_ties() {
        let q: PriorityQueue<i64> = PriorityQueue::new(0);
        for (n, p) in [(1, 1), (2, 5), (3, 3), (4, 5), (5, 2)] {
            q.put_with_priority(n, p).await.unwrap();
        }

        let mut drained = Vec::new();
        for _ in 0..5 {
            drained.push(q.get().await.unwrap());
        }
        // Priorities [1,5,3,5,2] drain as [5,5,3,2,1]; the two priority-5
        // items keep their enqueue order.
        assert_eq!(drained, vec![2, 4, 3, 5, 1]);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_until_get() {
        let q: PriorityQueue<u32> = PriorityQueue::new(0).max_size(2);
        q.put(1).await.unwrap();
        q.put(2).await.unwrap();
        assert!(matches!(q.put(3).await, Err(Error::QueueFull)));

        q.get().await.unwrap();
        q.put(3).await.unwrap();
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn test_priority_fn_applies_to_plain_put() {
        let q: PriorityQueue<i64> = PriorityQueue::new(0).priority_fn(|n| *n);
        q.put(1).await.unwrap();
        q.put(9).await.unwrap();
        q.put(5).await.unwrap();

        assert_eq!(q.get().await.unwrap(), 9);
        assert_eq!(q.get().await.unwrap(), 5);
        assert_eq!(q.get().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_workers_process_items() {
        let processed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&processed);
        let q: PriorityQueue<u32> = PriorityQueue::new(2).handler(handler(move |_| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        q.start().await.unwrap();
        for i in 0..10 {
            q.put(i).await.unwrap();
        }
        q.stop(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_everything() {
        let q: PriorityQueue<u32> = PriorityQueue::new(0);
        q.put(1).await.unwrap();
        q.stop(None).await.unwrap();

        assert!(matches!(q.put(2).await, Err(Error::QueueStopped)));
        assert!(matches!(q.stop(None).await, Err(Error::QueueStopped)));
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let q: PriorityQueue<u32> = PriorityQueue::new(0);
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        q.put(42).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }
}
