//! Queued invocation wrapper.
//!
//! Calls are not run inline: each one is enqueued as a job and executed by
//! the wrapper's queue workers. The caller gets a handle that resolves to
//! the call's result, so bursts are absorbed by the queue instead of
//! fanning out unbounded tasks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::pool::JobHandle;
use crate::queue::{handler, PriorityQueue, Queue};

type CallFn<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<R>> + Send + Sync>;
type QueuedJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct Queued<T, R> {
    f: CallFn<T, R>,
    queue: PriorityQueue<QueuedJob>,
}

impl<T: Send + 'static, R: Send + 'static> Queued<T, R> {
    pub fn new<F, Fut>(workers: usize, f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let queue: PriorityQueue<QueuedJob> =
            PriorityQueue::new(workers).handler(handler(|job: QueuedJob| async move {
                job().await;
                Ok(())
            }));
        Self {
            f: Arc::new(move |input| Box::pin(f(input))),
            queue,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.queue.start().await
    }

    pub async fn stop(&self, deadline: Option<Duration>) -> Result<()> {
        self.queue.stop(deadline).await
    }

    /// Enqueue a call; the handle resolves once a worker has run it.
    pub async fn call(&self, input: T) -> Result<JobHandle<R>> {
        self.call_with_priority(input, 0).await
    }

    /// Higher-priority calls jump the queue.
    pub async fn call_with_priority(&self, input: T, priority: i64) -> Result<JobHandle<R>> {
        let (tx, rx) = oneshot::channel();
        let f = Arc::clone(&self.f);
        let job: QueuedJob = Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(f(input).await);
            })
        });
        self.queue.put_with_priority(job, priority).await?;
        Ok(JobHandle::new(rx))
    }

    /// Calls waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.queue.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_calls_run_on_workers() {
        let q = Queued::new(2, |n: u32| async move { Ok(n * 2) });
        q.start().await.unwrap();

        let a = q.call(5).await.unwrap();
        let b = q.call(7).await.unwrap();
        assert_eq!(a.join().await.unwrap(), 10);
        assert_eq!(b.join().await.unwrap(), 14);

        q.stop(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_reach_the_caller() {
        let q = Queued::new(1, |_: u32| async move {
            Err::<u32, _>(Error::Task("no".to_string()))
        });
        q.start().await.unwrap();

        let handle = q.call(1).await.unwrap();
        assert!(matches!(handle.join().await, Err(Error::Task(_))));
        q.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_worker_serializes_calls() {
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (c, p) = (Arc::clone(&concurrent), Arc::clone(&peak));

        let q = Queued::new(1, move |_: u32| {
            let (c, p) = (Arc::clone(&c), Arc::clone(&p));
            async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                c.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        q.start().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(q.call(i).await.unwrap());
        }
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        q.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_jumps_the_backlog() {
        // No workers: inspect queue order directly.
        let q = Queued::new(0, |n: u32| async move { Ok(n) });
        let _slow = q.call_with_priority(1, 0).await.unwrap();
        let _urgent = q.call_with_priority(2, 10).await.unwrap();
        assert_eq!(q.backlog(), 2);
    }
}
