//! Composite limiter.
//!
//! Chains several limiters; a request is admitted only when every child
//! admits it. Acquire is observably all-or-nothing: children debited before
//! a rejection are credited back before the caller sees `false`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{Limiter, LimiterStats};
use crate::error::{Error, Result};
use crate::metrics::{default_metrics, Metrics};

pub struct CompositeLimiter {
    children: Vec<Arc<dyn Limiter>>,
    metrics: Arc<Metrics>,
}

impl CompositeLimiter {
    pub fn new(children: Vec<Arc<dyn Limiter>>) -> Self {
        Self {
            children,
            metrics: default_metrics(),
        }
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stats for every child, in chain order.
    pub async fn child_stats(&self, key: &str) -> Result<Vec<LimiterStats>> {
        let mut stats = Vec::with_capacity(self.children.len());
        for child in &self.children {
            stats.push(child.stats(key).await?);
        }
        Ok(stats)
    }

    /// Credit back children `[0, upto)` after a partial acquire. Best
    /// effort: a child that fails to compensate leaves a logged imbalance.
    async fn compensate(&self, key: &str, tokens: f64, upto: usize) {
        for (index, child) in self.children.iter().take(upto).enumerate() {
            if let Err(err) = child.release(key, tokens).await {
                warn!(
                    key,
                    child = index,
                    tokens,
                    error = %err,
                    "failed to compensate composite child; residual imbalance"
                );
            }
        }
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        for (index, child) in self.children.iter().enumerate() {
            match child.acquire(key, tokens).await {
                Ok(true) => {}
                Ok(false) => {
                    self.compensate(key, tokens, index).await;
                    self.metrics.incr("limiter.composite.rejected", 1);
                    return Ok(false);
                }
                Err(err) => {
                    self.compensate(key, tokens, index).await;
                    return Err(err);
                }
            }
        }
        self.metrics.incr("limiter.composite.accepted", 1);
        Ok(true)
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        for child in &self.children {
            child.release(key, tokens).await?;
        }
        Ok(())
    }

    /// The chain is only as permissive as its tightest child.
    async fn stats(&self, key: &str) -> Result<LimiterStats> {
        let mut tightest: Option<LimiterStats> = None;
        for child in &self.children {
            let stats = child.stats(key).await?;
            let replace = match &tightest {
                Some(current) => stats.available < current.available,
                None => true,
            };
            if replace {
                tightest = Some(stats);
            }
        }
        tightest.ok_or_else(|| Error::Task("composite limiter has no children".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::limiter::TokenBucket;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn bucket(rate: f64, per: Duration, clock: &Arc<ManualClock>) -> Arc<TokenBucket> {
        let storage = Arc::new(MemoryStorage::with_clock(
            1024,
            clock.clone() as Arc<dyn Clock>,
        ));
        Arc::new(
            TokenBucket::new(rate, per, storage)
                .clock(clock.clone() as Arc<dyn Clock>),
        )
    }

    #[tokio::test]
    async fn test_minute_and_hour_caps() {
        let clock = ManualClock::new(1_000_000);
        let per_minute = bucket(100.0, Duration::from_secs(60), &clock);
        let per_hour = bucket(1000.0, Duration::from_secs(3600), &clock);
        let composite =
            CompositeLimiter::new(vec![per_minute.clone(), per_hour.clone()]);

        // 100 acquires pass both caps; the 101st hits the minute cap.
        for _ in 0..100 {
            assert!(composite.acquire("k", 1.0).await.unwrap());
        }
        assert!(!composite.acquire("k", 1.0).await.unwrap());

        // A minute later the minute bucket refilled; 100 more pass.
        clock.advance(60_000);
        for _ in 0..100 {
            assert!(composite.acquire("k", 1.0).await.unwrap());
        }
        assert!(!composite.acquire("k", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_compensates_earlier_children() {
        let clock = ManualClock::new(1_000_000);
        let loose = bucket(10.0, Duration::from_secs(1), &clock);
        let tight = bucket(1.0, Duration::from_secs(1), &clock);
        let composite = CompositeLimiter::new(vec![loose.clone(), tight.clone()]);

        assert!(composite.acquire("k", 1.0).await.unwrap());
        // Tight child rejects; the loose child's debit must be undone.
        assert!(!composite.acquire("k", 1.0).await.unwrap());

        let loose_stats = loose.stats("k").await.unwrap();
        assert!((loose_stats.available - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_release_propagates_to_all_children() {
        let clock = ManualClock::new(1_000_000);
        let a = bucket(5.0, Duration::from_secs(1), &clock);
        let b = bucket(5.0, Duration::from_secs(1), &clock);
        let composite = CompositeLimiter::new(vec![a.clone(), b.clone()]);

        assert!(composite.acquire("k", 2.0).await.unwrap());
        composite.release("k", 2.0).await.unwrap();

        assert_eq!(a.stats("k").await.unwrap().available, 5.0);
        assert_eq!(b.stats("k").await.unwrap().available, 5.0);
    }

    #[tokio::test]
    async fn test_stats_report_tightest_child() {
        let clock = ManualClock::new(1_000_000);
        let wide = bucket(100.0, Duration::from_secs(1), &clock);
        let narrow = bucket(3.0, Duration::from_secs(1), &clock);
        let composite = CompositeLimiter::new(vec![wide, narrow]);

        let stats = composite.stats("k").await.unwrap();
        assert_eq!(stats.max, 3.0);

        let all = composite.child_stats("k").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].max, 100.0);
    }
}
