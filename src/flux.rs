//! Flux: a queue processor tying the pieces together.
//!
//! Items are submitted with a priority, workers drain them through a
//! handler, an optional limiter gates the draw rate, failures retry with
//! exponential delay under a budget, and the processor keeps
//! processed/failed/rejected counts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};
use crate::limiter::Limiter;
use crate::metrics::{default_metrics, Metrics};
use crate::queue::{PriorityQueue, Queue};
use crate::wrap::Backoff;

type FluxHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FluxConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Per-item handler timeout; `None` waits as long as it takes.
    pub timeout: Option<Duration>,
    pub queue_size: usize,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            timeout: None,
            queue_size: 10_000,
        }
    }
}

/// Lifetime counters for one processor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FluxStats {
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
}

struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Inner<T> {
    name: String,
    queue: PriorityQueue<T>,
    handler: FluxHandler<T>,
    limiter: Option<Arc<dyn Limiter>>,
    config: FluxConfig,
    running: AtomicBool,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct Flux<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Flux<T> {
    pub fn new<F, Fut>(name: impl Into<String>, config: FluxConfig, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let queue = PriorityQueue::new(0).max_size(config.queue_size);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                queue,
                handler: Arc::new(move |item| Box::pin(handler(item))),
                limiter: None,
                config,
                running: AtomicBool::new(false),
                counters: Counters {
                    processed: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                },
                tasks: Mutex::new(Vec::new()),
                metrics: default_metrics(),
            }),
        }
    }

    /// Gate the draw rate behind a limiter keyed by the processor name.
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.limiter = Some(limiter);
        }
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = metrics;
        }
        self
    }

    /// Queue an item for processing.
    pub async fn submit(&self, item: T, priority: i64) -> Result<()> {
        self.inner.queue.put_with_priority(item, priority).await?;
        self.inner
            .metrics
            .incr(&format!("flux.{}.submitted", self.inner.name), 1);
        Ok(())
    }

    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        for _ in 0..self.inner.config.workers.max(1) {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(Self::worker(inner)));
        }
    }

    /// Drain queued items, then stop the workers.
    pub async fn stop(&self, deadline: Option<Duration>) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.queue.stop(deadline).await?;
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        crate::queue::join_workers(handles, deadline).await;
        Ok(())
    }

    pub fn stats(&self) -> FluxStats {
        FluxStats {
            processed: self.inner.counters.processed.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            rejected: self.inner.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn backlog(&self) -> usize {
        self.inner.queue.size()
    }

    async fn worker(inner: Arc<Inner<T>>) {
        let backoff = Backoff::new(Duration::from_millis(10), 2.0)
            .max_delay(Duration::from_secs(1))
            .without_jitter();
        loop {
            let item = match inner.queue.get().await {
                Ok(item) => item,
                Err(_) => break,
            };

            // Gate on the limiter; count each denial and back off.
            if let Some(limiter) = &inner.limiter {
                let mut attempt = 0u32;
                loop {
                    match limiter.acquire(&inner.name, 1.0).await {
                        Ok(true) => break,
                        Ok(false) => {
                            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(backoff.delay(attempt)).await;
                            attempt = attempt.saturating_add(1);
                        }
                        Err(err) => {
                            warn!(flux = %inner.name, error = %err, "limiter unavailable");
                            tokio::time::sleep(backoff.delay(attempt)).await;
                            attempt = attempt.saturating_add(1);
                        }
                    }
                }
            }

            Self::process(&inner, item).await;
        }
    }

    async fn process(inner: &Arc<Inner<T>>, item: T) {
        let retries = inner.config.max_retries.max(1);
        for attempt in 0..retries {
            let run = (inner.handler)(item.clone());
            let outcome = match inner.config.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Cancelled),
                },
                None => run.await,
            };

            match outcome {
                Ok(()) => {
                    inner.counters.processed.fetch_add(1, Ordering::Relaxed);
                    inner
                        .metrics
                        .incr(&format!("flux.{}.processed", inner.name), 1);
                    return;
                }
                Err(err) if attempt + 1 < retries => {
                    warn!(flux = %inner.name, attempt, error = %err, "handler failed, retrying");
                    let delay =
                        inner.config.retry_delay.as_millis() as u64 * (1u64 << attempt.min(16));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => {
                    warn!(flux = %inner.name, error = %err, "handler failed, giving up");
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    inner
                        .metrics
                        .incr(&format!("flux.{}.failed", inner.name), 1);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::TokenBucket;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::AtomicU32;

    fn config(workers: usize) -> FluxConfig {
        FluxConfig {
            workers,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            timeout: None,
            queue_size: 100,
        }
    }

    #[tokio::test]
    async fn test_processes_submitted_items() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let flux = Flux::new("test", config(2), move |n: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        });
        flux.start().await;

        for _ in 0..10 {
            flux.submit(1, 0).await.unwrap();
        }
        flux.stop(Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(flux.stats().processed, 10);
    }

    #[tokio::test]
    async fn test_retries_then_counts_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flux = Flux::new("flaky", config(1), move |_: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Task("always fails".to_string()))
            }
        });
        flux.start().await;
        flux.submit(1, 0).await.unwrap();
        flux.stop(Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = flux.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flux = Flux::new("transient", config(1), move |_: u32| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::StorageUnavailable("hiccup".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        flux.start().await;
        flux.submit(1, 0).await.unwrap();
        flux.stop(Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(flux.stats().processed, 1);
        assert_eq!(flux.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let flux = Flux::new(
            "slow",
            FluxConfig {
                workers: 1,
                max_retries: 1,
                timeout: Some(Duration::from_millis(20)),
                ..config(1)
            },
            |_: u32| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        );
        flux.start().await;
        flux.submit(1, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        flux.stop(Some(Duration::from_millis(100))).await.unwrap();

        assert_eq!(flux.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_limiter_throttles_draw_rate() {
        let limiter: Arc<dyn Limiter> = Arc::new(TokenBucket::new(
            50.0,
            Duration::from_secs(1),
            Arc::new(MemoryStorage::new()),
        ));
        let flux = Flux::new("gated", config(1), |_: u32| async { Ok(()) }).limiter(limiter);
        flux.start().await;

        // 50-token burst covers the first items, then refills gate the rest.
        for _ in 0..60 {
            flux.submit(1, 0).await.unwrap();
        }
        flux.stop(Some(Duration::from_secs(5))).await.unwrap();
        let stats = flux.stats();
        assert_eq!(stats.processed, 60);
        assert!(stats.rejected > 0);
    }
}
