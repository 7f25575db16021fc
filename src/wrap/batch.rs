//! Batch collection helpers.
//!
//! [`BatchCollector`] buffers items and flushes them to a callback when the
//! batch fills, when the oldest buffered item has waited `timeout`, or on
//! close. [`batch_map`] runs a chunked workload with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::metrics::{default_metrics, Metrics};

type FlushFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner<T> {
    buf: Mutex<Vec<T>>,
    batch_size: usize,
    timeout: Duration,
    flush: FlushFn<T>,
    timer: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct BatchCollector<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchCollector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BatchCollector<T> {
    pub fn new<F, Fut>(batch_size: usize, timeout: Duration, callback: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                buf: Mutex::new(Vec::new()),
                batch_size: batch_size.max(1),
                timeout,
                flush: Arc::new(move |batch| Box::pin(callback(batch))),
                timer: Mutex::new(None),
                metrics: default_metrics(),
            }),
        }
    }

    /// Buffer an item; flushes inline when the batch fills.
    pub async fn add(&self, item: T) {
        let full_batch = {
            let mut buf = self.inner.buf.lock();
            buf.push(item);
            if buf.len() >= self.inner.batch_size {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };

        match full_batch {
            Some(batch) => {
                self.cancel_timer();
                self.flush_batch(batch).await;
            }
            None => self.arm_timer(),
        }
    }

    /// Flush whatever is buffered, regardless of size.
    pub async fn flush(&self) {
        self.cancel_timer();
        let batch = std::mem::take(&mut *self.inner.buf.lock());
        if !batch.is_empty() {
            self.flush_batch(batch).await;
        }
    }

    /// Final flush; the collector stays usable but idle afterwards.
    pub async fn close(&self) {
        self.flush().await;
    }

    pub fn pending(&self) -> usize {
        self.inner.buf.lock().len()
    }

    async fn flush_batch(&self, batch: Vec<T>) {
        self.inner.metrics.incr("batch.flushes", 1);
        self.inner.metrics.incr("batch.items", batch.len() as u64);
        (self.inner.flush)(batch).await;
    }

    /// Start the timeout clock at the first buffered item.
    fn arm_timer(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let batch = std::mem::take(&mut *inner.buf.lock());
            if !batch.is_empty() {
                inner.metrics.incr("batch.flushes", 1);
                inner.metrics.incr("batch.items", batch.len() as u64);
                (inner.flush)(batch).await;
            }
        }));
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
    }
}

/// Split `items` into chunks of `batch_size` and map `f` over them with at
/// most `concurrency` chunks in flight. Results keep chunk order.
pub async fn batch_map<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    concurrency: usize,
    f: F,
) -> Vec<R>
where
    T: Send,
    F: Fn(Vec<T>) -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let semaphore = Semaphore::new(concurrency.max(1));

    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut items = items.into_iter();
    loop {
        let chunk: Vec<T> = items.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let futures = chunks.into_iter().map(|chunk| {
        let semaphore = &semaphore;
        let f = &f;
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            f(chunk).await
        }
    });
    futures::future::join_all(futures).await
}
