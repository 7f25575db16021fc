//! Exponential backoff and retry.

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay policy: attempt `i` waits `min(max_delay, base * factor^i)`,
/// scaled by a uniform random factor when jitter is on so synchronized
/// retries decorrelate.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, factor: f64) -> Self {
        Self {
            base,
            factor,
            ..Self::default()
        }
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retrying after `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent: beyond ~64 doublings the clamp wins anyway.
        let exp = self.factor.powi(attempt.min(64) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            capped * rand::random::<f64>()
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }
}

/// Run `f` until it succeeds or the budget runs out. Every failure waits
/// per the policy; the final error surfaces wrapped in
/// [`Error::RetriesExhausted`].
pub async fn retry<F, Fut, T>(policy: &Backoff, max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = max_retries.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }
    }
    Err(Error::RetriesExhausted {
        attempts,
        source: Box::new(last.unwrap_or(Error::Cancelled)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_grows_and_clamps() {
        let policy = Backoff::new(Duration::from_millis(100), 2.0)
            .max_delay(Duration::from_millis(500))
            .without_jitter();

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_below_cap() {
        let policy = Backoff::new(Duration::from_millis(100), 2.0);
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = Backoff::new(Duration::from_millis(1), 2.0).without_jitter();

        let out = retry(&policy, 5, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::StorageUnavailable("flaky".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_surfaces_last_error() {
        let policy = Backoff::new(Duration::from_millis(1), 2.0).without_jitter();
        let out: Result<()> = retry(&policy, 3, || async {
            Err(Error::StorageUnavailable("down".to_string()))
        })
        .await;

        match out {
            Err(Error::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::StorageUnavailable(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }
}
