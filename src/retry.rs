use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{LakeError, LakeResult};

/// A single reusable retry primitive replacing the ad-hoc backoff loops
/// scattered through call sites elsewhere. Every recoverable call in this
/// crate (upstream fetches, hot-store batches, cold-store puts) goes
/// through this.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Upstream vendor API calls: a handful of attempts, real backoff.
    pub fn upstream() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }

    /// Hot/cold store round-trips: fewer attempts, shorter delays.
    pub fn storage() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` up to `policy.max_attempts` times. `op` receives the 1-based
/// attempt number. Retries only when the returned error is `retryable()`;
/// a `RateLimited` error's `Retry-After` overrides the computed delay.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> LakeResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = LakeResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !err.retryable() {
                    return Err(err);
                }
                let delay = match &err {
                    LakeError::RateLimited {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => policy.delay_for(attempt),
                };
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after recoverable failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        };
        let result = retry(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(LakeError::UpstreamTransient("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_retryable_error() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        };
        let result: LakeResult<()> =
            retry(&policy, |_| async { Err(LakeError::Validation("bad".into())) }).await;
        assert!(matches!(result, Err(LakeError::Validation(_))));
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_and_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        };
        let result: LakeResult<()> = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LakeError::UpstreamTransient("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
