//! Broadcast queue.
//!
//! Every subscriber receives a copy of every item through its own bounded
//! inbox. A subscriber that falls behind loses its own oldest items; it
//! never stalls the publisher or its peers. Delivery is via
//! [`BroadcastQueue::subscribe`], not `get`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Queue, QueueState};
use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics};

const DEFAULT_CAPACITY: usize = 10_000;

struct Inbox<T> {
    buf: Mutex<VecDeque<T>>,
    ready: Notify,
    closed: AtomicBool,
}

struct SubEntry<T> {
    id: u64,
    inbox: Arc<Inbox<T>>,
}

struct Inner<T> {
    subscribers: Mutex<Vec<SubEntry<T>>>,
    state: Mutex<QueueState>,
    capacity: usize,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

pub struct BroadcastQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BroadcastQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One subscriber's view of a [`BroadcastQueue`]. Dropping it
/// unsubscribes.
pub struct Subscription<T> {
    inbox: Arc<Inbox<T>>,
    queue: std::sync::Weak<Inner<T>>,
    id: u64,
}

impl<T: Send + 'static> Subscription<T> {
    /// Next broadcast item, waiting if the inbox is empty. Errors with
    /// `QueueStopped` once the queue shut down and the inbox drained.
    pub async fn recv(&self) -> Result<T> {
        loop {
            let ready = self.inbox.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut buf = self.inbox.buf.lock();
                if let Some(item) = buf.pop_front() {
                    return Ok(item);
                }
            }
            if self.inbox.closed.load(Ordering::Acquire) {
                return Err(Error::QueueStopped);
            }
            ready.await;
        }
    }

    /// Items waiting in this subscriber's inbox.
    pub fn pending(&self) -> usize {
        self.inbox.buf.lock().len()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.queue.upgrade() {
            inner.subscribers.lock().retain(|s| s.id != self.id);
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds each subscriber's inbox.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                state: Mutex::new(QueueState::Open),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(0),
                metrics: default_metrics(),
            }),
        }
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        }
        self
    }

    /// Register a new subscriber. It only sees items published after this
    /// call.
    pub fn subscribe(&self) -> Subscription<T> {
        let inbox = Arc::new(Inbox {
            buf: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.push(SubEntry {
            id,
            inbox: Arc::clone(&inbox),
        });
        self.inner
            .metrics
            .gauge("queue.broadcast.subscribers", subscribers.len() as f64);
        Subscription {
            inbox,
            queue: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<T: Clone + Send + 'static> Default for BroadcastQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Queue<T> for BroadcastQueue<T> {
    /// Fan the item out to every subscriber. A full inbox drops its oldest
    /// item to make room.
    async fn put(&self, item: T) -> Result<()> {
        if *self.inner.state.lock() != QueueState::Open {
            return Err(Error::QueueStopped);
        }

        let subscribers = self.inner.subscribers.lock();
        for entry in subscribers.iter() {
            let mut buf = entry.inbox.buf.lock();
            if buf.len() >= self.inner.capacity {
                buf.pop_front();
                self.inner.metrics.incr("queue.broadcast.dropped", 1);
            }
            buf.push_back(item.clone());
            entry.inbox.ready.notify_one();
        }
        self.inner.metrics.incr("queue.broadcast.put", 1);
        Ok(())
    }

    /// Not supported; consume through [`BroadcastQueue::subscribe`].
    async fn get(&self) -> Result<T> {
        Err(Error::Task(
            "broadcast queues deliver via subscribe()".to_string(),
        ))
    }

    /// Number of active subscribers.
    fn size(&self) -> usize {
        self.subscriber_count()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _deadline: Option<Duration>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == QueueState::Stopped {
                return Err(Error::QueueStopped);
            }
            *state = QueueState::Stopped;
        }
        let subscribers = self.inner.subscribers.lock();
        for entry in subscribers.iter() {
            entry.inbox.closed.store(true, Ordering::Release);
            entry.inbox.ready.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_a_copy() {
        let q: BroadcastQueue<u32> = BroadcastQueue::new();
        let a = q.subscribe();
        let b = q.subscribe();

        q.put(1).await.unwrap();
        q.put(2).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(a.recv().await.unwrap(), 2);
        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let q: BroadcastQueue<u32> = BroadcastQueue::with_capacity(2);
        let slow = q.subscribe();

        q.put(1).await.unwrap();
        q.put(2).await.unwrap();
        q.put(3).await.unwrap();

        // Oldest item was displaced; the rest arrive in order.
        assert_eq!(slow.recv().await.unwrap(), 2);
        assert_eq!(slow.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_stall_others() {
        let q: BroadcastQueue<u32> = BroadcastQueue::with_capacity(1);
        let slow = q.subscribe();
        let fast = q.subscribe();

        for i in 0..10 {
            q.put(i).await.unwrap();
            assert_eq!(fast.recv().await.unwrap(), i);
        }
        // The slow inbox only holds the latest item.
        assert_eq!(slow.recv().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let q: BroadcastQueue<u32> = BroadcastQueue::new();
        let sub = q.subscribe();
        assert_eq!(q.subscriber_count(), 1);
        drop(sub);
        assert_eq!(q.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_subscribers_after_drain() {
        let q: BroadcastQueue<u32> = BroadcastQueue::new();
        let sub = q.subscribe();

        q.put(5).await.unwrap();
        q.stop(None).await.unwrap();

        assert!(matches!(q.put(6).await, Err(Error::QueueStopped)));
        // Already-delivered items drain before the close is observed.
        assert_eq!(sub.recv().await.unwrap(), 5);
        assert!(matches!(sub.recv().await, Err(Error::QueueStopped)));
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let q: BroadcastQueue<u32> = BroadcastQueue::new();
        let sub = q.subscribe();

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        q.put(42).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }
}
