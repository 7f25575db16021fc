//! Periodic task dispatcher.
//!
//! One loop sleeps until the nearest `next_run`, fires every due entry as
//! its own task, and advances each entry by its interval. Registering a new
//! entry wakes the loop so a short interval never waits behind a long one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Upper bound on one sleep so the loop re-syncs even without wakeups.
const MAX_SLEEP: Duration = Duration::from_secs(60);

struct ScheduledJob {
    name: String,
    interval_ms: u64,
    next_run_ms: u64,
    job: JobFn,
}

/// Registered entry description, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub interval_ms: u64,
    pub next_run_ms: u64,
}

struct Inner {
    jobs: Mutex<Vec<ScheduledJob>>,
    changed: Notify,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(Vec::new()),
                changed: Notify::new(),
                running: AtomicBool::new(false),
                handle: Mutex::new(None),
                clock,
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

    /// Run `job` every `interval`, first firing one interval from now.
    /// Re-registering a name replaces the entry.
    pub fn every<F, Fut>(&self, interval: Duration, name: impl Into<String>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let interval_ms = interval.as_millis().max(1) as u64;
        let entry = ScheduledJob {
            next_run_ms: self.inner.clock.now_ms() + interval_ms,
            interval_ms,
            job: Arc::new(move || Box::pin(job())),
            name: name.clone(),
        };
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|j| j.name != name);
        jobs.push(entry);
        drop(jobs);
        self.inner.changed.notify_one();
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        before != jobs.len()
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner
            .jobs
            .lock()
            .iter()
            .map(|j| JobInfo {
                name: j.name.clone(),
                interval_ms: j.interval_ms,
                next_run_ms: j.next_run_ms,
            })
            .collect()
    }

    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *self.inner.handle.lock() = Some(tokio::spawn(Self::run(inner)));
    }

    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(inner: Arc<Inner>) {
        while inner.running.load(Ordering::SeqCst) {
            let changed = inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = inner.clock.now_ms();
            let mut due: Vec<(String, JobFn)> = Vec::new();
            let nearest = {
                let mut jobs = inner.jobs.lock();
                for job in jobs.iter_mut() {
                    if now >= job.next_run_ms {
                        due.push((job.name.clone(), Arc::clone(&job.job)));
                        job.next_run_ms = now + job.interval_ms;
                    }
                }
                jobs.iter().map(|j| j.next_run_ms).min()
            };

            for (name, job) in due {
                let metrics = Arc::clone(&inner.metrics);
                tokio::spawn(async move {
                    match job().await {
                        Ok(()) => metrics.incr(&format!("scheduler.job.{name}.success"), 1),
                        Err(err) => {
                            warn!(job = %name, error = %err, "scheduled job failed");
                            metrics.incr(&format!("scheduler.job.{name}.error"), 1);
                        }
                    }
                });
            }

            let sleep_for = nearest
                .map(|next| Duration::from_millis(next.saturating_sub(now)))
                .unwrap_or(MAX_SLEEP)
                .min(MAX_SLEEP);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = changed => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fires_on_interval() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        let count = Arc::clone(&fired);
        scheduler.every(Duration::from_millis(50), "tick", move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(330)).await;
        scheduler.stop().await;

        let n = fired.load(Ordering::SeqCst);
        assert!((4..=8).contains(&n), "fired {n} times");
    }

    #[tokio::test]
    async fn test_short_interval_not_stuck_behind_long() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.every(Duration::from_secs(3600), "hourly", || async { Ok(()) });
        scheduler.start().await;

        // Registered after start: must wake the sleeping loop.
        let count = Arc::clone(&fired);
        scheduler.every(Duration::from_millis(40), "fast", move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_next_run_advances_and_listing() {
        let scheduler = Scheduler::new();
        scheduler.every(Duration::from_secs(10), "job", || async { Ok(()) });

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "job");
        assert_eq!(jobs[0].interval_ms, 10_000);
        assert!(jobs[0].next_run_ms > crate::clock::now_ms());

        assert!(scheduler.remove("job"));
        assert!(!scheduler.remove("job"));
        assert!(scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_failing_job_keeps_running() {
        let fired = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        let count = Arc::clone(&fired);
        scheduler.every(Duration::from_millis(40), "flaky", move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::Error::Task("flaky".to_string()))
            }
        });
        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert!(fired.load(Ordering::SeqCst) >= 2);
    }
}
