//! Delay queue.
//!
//! Items become visible at their `execute_at` instant. The min-heap keeps
//! the nearest deadline on top; a waiting consumer sleeps until it and is
//! woken early when a `put` schedules something sooner.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

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

struct DelayedItem<T> {
    execute_at: u64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for DelayedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at && self.seq == other.seq
    }
}

impl<T> Eq for DelayedItem<T> {}

impl<T> PartialOrd for DelayedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedItem<T> {
    // Min-heap through reversed comparison: nearest deadline pops first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .execute_at
            .cmp(&self.execute_at)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Core<T> {
    heap: BinaryHeap<DelayedItem<T>>,
    state: QueueState,
    seq: u64,
}

struct Inner<T> {
    core: Mutex<Core<T>>,
    changed: Notify,
    workers: usize,
    max_size: usize,
    handler: Option<Handler<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

pub struct DelayQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DelayQueue<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    heap: BinaryHeap::new(),
                    state: QueueState::Open,
                    seq: 0,
                }),
                changed: Notify::new(),
                workers,
                max_size: DEFAULT_MAX_SIZE,
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

    /// Schedule `item` to become visible after `delay`.
    pub async fn put_after(&self, item: T, delay: Duration) -> Result<()> {
        let execute_at = self.inner.clock.now_ms() + delay.as_millis() as u64;
        self.put_at(item, execute_at).await
    }

    /// Schedule `item` for an absolute millisecond timestamp.
    pub async fn put_at(&self, item: T, execute_at: u64) -> Result<()> {
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
            core.heap.push(DelayedItem {
                execute_at,
                seq,
                item,
            });
            self.inner
                .metrics
                .gauge("queue.delay.size", core.heap.len() as f64);
        }
        self.inner.metrics.incr("queue.delay.put", 1);
        // Wake sleepers: the new item may precede their current target.
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn worker(inner: Arc<Inner<T>>, worker_id: usize) {
        let handler = match &inner.handler {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let queue = DelayQueue {
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
                    .incr(&format!("queue.delay.worker.{worker_id}.processed"), 1),
                Err(err) => {
                    warn!(worker_id, error = %err, "delay worker handler failed");
                    inner
                        .metrics
                        .incr(&format!("queue.delay.worker.{worker_id}.errors"), 1);
                }
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for DelayQueue<T> {
    /// Immediate item: visible as soon as a consumer asks.
    async fn put(&self, item: T) -> Result<()> {
        self.put_after(item, Duration::ZERO).await
    }

    async fn get(&self) -> Result<T> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let wait_ms = {
                let mut core = self.inner.core.lock();
                let now = self.inner.clock.now_ms();
                match core.heap.peek() {
                    Some(head) if head.execute_at <= now => {
                        let entry = core.heap.pop().expect("peeked entry vanished");
                        self.inner
                            .metrics
                            .gauge("queue.delay.size", core.heap.len() as f64);
                        self.inner.metrics.incr("queue.delay.get", 1);
                        if !core.heap.is_empty() {
                            self.inner.changed.notify_one();
                        }
                        return Ok(entry.item);
                    }
                    Some(head) => Some(head.execute_at - now),
                    None => {
                        if core.state != QueueState::Open {
                            return Err(Error::QueueStopped);
                        }
                        // Nothing scheduled; wait for a put.
                        None
                    }
                }
            };

            match wait_ms {
                None => changed.await,
                Some(wait_ms) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                        _ = &mut changed => {}
                    }
                }
            }
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
        self.inner.changed.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        join_workers(handles, deadline).await;

        self.inner.core.lock().state = QueueState::Stopped;
        Ok(())
    }
}
