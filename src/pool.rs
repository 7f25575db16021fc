//! Auto-scaling worker pool.
//!
//! Tasks go into an internal queue; between `min_workers` and `max_workers`
//! tasks drain it. A monitor samples `pending / workers` every
//! `check_interval` and scales one step at a time. Shrinking is graceful: a
//! worker exits between tasks, never mid-task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics};

type PoolTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Scale up when pending-per-worker exceeds this.
    pub scale_up_threshold: f64,
    /// Scale down when pending-per-worker falls below this.
    pub scale_down_threshold: f64,
    pub check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Resolves to the submitted task's result. Dropping the pool (or stopping
/// it with tasks still queued) resolves pending handles to `Cancelled`.
pub struct JobHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> JobHandle<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { rx }
    }

    pub async fn join(self) -> Result<R> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

struct Inner {
    queue: Mutex<VecDeque<PoolTask>>,
    not_empty: Notify,
    running: AtomicBool,
    alive: AtomicUsize,
    /// Workers that should exit at their next idle point.
    surplus: AtomicUsize,
    config: PoolConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                not_empty: Notify::new(),
                running: AtomicBool::new(false),
                alive: AtomicUsize::new(0),
                surplus: AtomicUsize::new(0),
                config,
                workers: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
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

    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        for _ in 0..self.inner.config.min_workers.max(1) {
            Self::add_worker(&self.inner);
        }

        let inner = Arc::clone(&self.inner);
        *self.inner.monitor.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.check_interval);
            ticker.tick().await;
            while inner.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                Self::rebalance(&inner);
            }
        }));
    }

    /// Drain signal: workers finish their current task, then exit.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
        self.inner.not_empty.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        // Anything left in the queue never ran; dropping it resolves the
        // callers' handles to Cancelled.
        self.inner.queue.lock().clear();
    }

    /// Queue a task; the returned handle resolves to its result.
    pub async fn submit<F, Fut, R>(&self, f: F) -> JobHandle<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let metrics = Arc::clone(&self.inner.metrics);
        let task: PoolTask = Box::new(move || {
            Box::pin(async move {
                let result = f().await;
                match &result {
                    Ok(_) => metrics.incr("pool.processed", 1),
                    Err(_) => metrics.incr("pool.errors", 1),
                }
                let _ = tx.send(result);
            })
        });

        self.inner.queue.lock().push_back(task);
        self.inner.metrics.incr("pool.submit", 1);
        self.inner.not_empty.notify_one();
        JobHandle::new(rx)
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.alive.load(Ordering::SeqCst)
    }

    fn add_worker(inner: &Arc<Inner>) {
        inner.alive.fetch_add(1, Ordering::SeqCst);
        inner
            .metrics
            .gauge("pool.workers", inner.alive.load(Ordering::SeqCst) as f64);
        let worker_inner = Arc::clone(inner);
        inner
            .workers
            .lock()
            .push(tokio::spawn(Self::worker(worker_inner)));
    }

    fn rebalance(inner: &Arc<Inner>) {
        let pending = inner.queue.lock().len();
        let alive = inner.alive.load(Ordering::SeqCst);
        if alive == 0 {
            return;
        }
        let load = pending as f64 / alive as f64;

        if load > inner.config.scale_up_threshold && alive < inner.config.max_workers {
            debug!(pending, alive, load, "scaling pool up");
            Self::add_worker(inner);
            inner.metrics.incr("pool.scaled_up", 1);
        } else if load < inner.config.scale_down_threshold && alive > inner.config.min_workers {
            debug!(pending, alive, load, "scaling pool down");
            inner.surplus.fetch_add(1, Ordering::SeqCst);
            inner.not_empty.notify_one();
            inner.metrics.incr("pool.scaled_down", 1);
        }
    }

    /// Take the exit ticket if one is posted.
    fn should_exit(inner: &Inner) -> bool {
        inner
            .surplus
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| s.checked_sub(1))
            .is_ok()
    }

    async fn worker(inner: Arc<Inner>) {
        loop {
            // Register for wakeups before the checks so a stop or submit
            // landing in between is not lost.
            let notified = inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if Self::should_exit(&inner) {
                break;
            }
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            let task = inner.queue.lock().pop_front();
            match task {
                Some(task) => {
                    task().await;
                }
                None => notified.await,
            }
        }
        inner.alive.fetch_sub(1, Ordering::SeqCst);
        inner
            .metrics
            .gauge("pool.workers", inner.alive.load(Ordering::SeqCst) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> WorkerPool {
        WorkerPool::new(PoolConfig {
            min_workers: 2,
            max_workers: 4,
            check_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn test_submit_resolves_result() {
        let pool = small_pool();
        pool.start().await;

        let handle = pool.submit(|| async { Ok(21 * 2) }).await;
        assert_eq!(handle.join().await.unwrap(), 42);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_propagates_failure() {
        let pool = small_pool();
        pool.start().await;

        let handle = pool
            .submit(|| async { Err::<(), _>(Error::Task("boom".to_string())) })
            .await;
        assert!(matches!(handle.join().await, Err(Error::Task(_))));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_many_tasks_all_complete() {
        let pool = small_pool();
        pool.start().await;

        let mut handles = Vec::new();
        for i in 0..50u64 {
            handles.push(pool.submit(move || async move { Ok(i * 2) }).await);
        }
        let mut sum = 0;
        for handle in handles {
            sum += handle.join().await.unwrap();
        }
        assert_eq!(sum, (0..50u64).map(|i| i * 2).sum::<u64>());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_scales_up_under_load() {
        let pool = WorkerPool::new(PoolConfig {
            min_workers: 1,
            max_workers: 3,
            scale_up_threshold: 0.5,
            check_interval: Duration::from_millis(30),
            ..PoolConfig::default()
        });
        pool.start().await;
        assert_eq!(pool.worker_count(), 1);

        // Slow tasks pile the queue up past the threshold.
        for _ in 0..20 {
            let _ = pool
                .submit(|| async {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(())
                })
                .await;
        }
        // Sample while the backlog is still hot, before scale-down kicks in.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.worker_count() > 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_unstarted_tasks() {
        let pool = WorkerPool::new(PoolConfig {
            min_workers: 1,
            max_workers: 1,
            check_interval: Duration::from_secs(60),
            ..PoolConfig::default()
        });
        pool.start().await;

        let slow = pool
            .submit(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        let starved = pool.submit(|| async { Ok(()) }).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop().await;

        assert!(slow.join().await.is_ok());
        assert!(matches!(starved.join().await, Err(Error::Cancelled)));
    }
}
