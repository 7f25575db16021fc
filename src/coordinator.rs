//! Distributed coordinator: leader election with heartbeat.
//!
//! One key in shared storage names the current leader. `acquire_leadership`
//! claims it with a TTL; a heartbeat task extends the TTL at `ttl/2` only
//! while the key still carries our instance id, so a hand-off elsewhere
//! demotes us instead of being overwritten. When a leader dies silently its
//! key expires and another contender takes over within
//! `ttl + retry_interval`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};
use crate::storage::Storage;

struct Inner {
    storage: Arc<dyn Storage>,
    lock_name: String,
    ttl: Duration,
    retry_interval: Duration,
    instance_id: String,
    is_leader: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(storage: Arc<dyn Storage>, lock_name: impl Into<String>) -> Self {
        Self::with_timing(
            storage,
            lock_name,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
    }

    pub fn with_timing(
        storage: Arc<dyn Storage>,
        lock_name: impl Into<String>,
        ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                lock_name: lock_name.into(),
                ttl,
                retry_interval,
                instance_id: ulid::Ulid::new().to_string(),
                is_leader: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
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

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Last confirmed leadership state.
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    /// Try to claim (or renew) the leader key. Starts the heartbeat on
    /// success.
    pub async fn acquire_leadership(&self) -> Result<bool> {
        let acquired = self
            .inner
            .storage
            .try_lock(
                &self.inner.lock_name,
                &self.inner.instance_id,
                self.inner.ttl,
            )
            .await?;

        let was_leader = self.inner.is_leader.swap(acquired, Ordering::SeqCst);
        if acquired {
            if !was_leader {
                info!(
                    instance = %self.inner.instance_id,
                    lock = %self.inner.lock_name,
                    "acquired leadership"
                );
                self.inner.metrics.incr("coordinator.leader.acquired", 1);
            }
            let mut heartbeat = self.inner.heartbeat.lock();
            if heartbeat.is_none() {
                let inner = Arc::clone(&self.inner);
                *heartbeat = Some(tokio::spawn(Self::heartbeat(inner)));
            }
        }
        Ok(acquired)
    }

    /// Hand the key back if it is still ours and stop the heartbeat.
    pub async fn release_leadership(&self) -> Result<()> {
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        self.inner
            .storage
            .delete_if_equal(&self.inner.lock_name, &self.inner.instance_id)
            .await?;
        if self.inner.is_leader.swap(false, Ordering::SeqCst) {
            info!(instance = %self.inner.instance_id, "released leadership");
            self.inner.metrics.incr("coordinator.leader.released", 1);
        }
        Ok(())
    }

    /// Keep trying every `retry_interval` until we are the leader.
    pub async fn wait_for_leadership(&self) -> Result<()> {
        while !self.acquire_leadership().await? {
            tokio::time::sleep(self.inner.retry_interval).await;
        }
        Ok(())
    }

    /// Extend the TTL at ttl/2 while the key is still ours. Losing the key
    /// demotes this instance and ends the task.
    async fn heartbeat(inner: Arc<Inner>) {
        let interval = inner.ttl / 2;
        loop {
            tokio::time::sleep(interval).await;
            match inner
                .storage
                .extend_if_equal(&inner.lock_name, &inner.instance_id, inner.ttl)
                .await
            {
                Ok(true) => {
                    inner.metrics.incr("coordinator.heartbeat", 1);
                }
                Ok(false) => {
                    // Someone else holds the key now.
                    inner.is_leader.store(false, Ordering::SeqCst);
                    warn!(instance = %inner.instance_id, "leadership lost");
                    inner.metrics.incr("coordinator.leader.lost", 1);
                    break;
                }
                Err(err) => {
                    // Transient storage trouble: keep the current belief and
                    // try again next beat.
                    warn!(error = %err, "leader heartbeat failed");
                }
            }
        }
        inner.heartbeat.lock().take();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn pair(ttl_ms: u64) -> (Coordinator, Coordinator, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let a = Coordinator::with_timing(
            storage.clone() as Arc<dyn Storage>,
            "leader",
            Duration::from_millis(ttl_ms),
            Duration::from_millis(20),
        );
        let b = Coordinator::with_timing(
            storage.clone() as Arc<dyn Storage>,
            "leader",
            Duration::from_millis(ttl_ms),
            Duration::from_millis(20),
        );
        (a, b, storage)
    }

    #[tokio::test]
    async fn test_single_leader() {
        let (a, b, _) = pair(500);

        assert!(a.acquire_leadership().await.unwrap());
        assert!(!b.acquire_leadership().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let (a, b, _) = pair(500);

        assert!(a.acquire_leadership().await.unwrap());
        a.release_leadership().await.unwrap();
        assert!(!a.is_leader());

        assert!(b.acquire_leadership().await.unwrap());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn test_takeover_after_expiry() {
        let (a, b, _) = pair(80);

        assert!(a.acquire_leadership().await.unwrap());
        // Kill A's heartbeat so the key expires on its own.
        if let Some(hb) = a.inner.heartbeat.lock().take() {
            hb.abort();
        }

        // Inside the TTL the key is still held.
        assert!(!b.acquire_leadership().await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(b.acquire_leadership().await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_leadership() {
        let (a, b, _) = pair(100);

        assert!(a.acquire_leadership().await.unwrap());
        // Far past the ttl: the heartbeat must have been extending it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.is_leader());
        assert!(!b.acquire_leadership().await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let (a, _, _) = pair(500);
        assert!(a.acquire_leadership().await.unwrap());
        assert!(a.acquire_leadership().await.unwrap());
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_wait_for_leadership_takes_over() {
        let (a, b, _) = pair(80);
        assert!(a.acquire_leadership().await.unwrap());
        if let Some(hb) = a.inner.heartbeat.lock().take() {
            hb.abort();
        }

        let waited = tokio::time::timeout(Duration::from_secs(2), b.wait_for_leadership()).await;
        assert!(waited.is_ok());
        assert!(b.is_leader());
    }
}
