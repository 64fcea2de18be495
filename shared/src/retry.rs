use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential backoff with jitter, applied per record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter_max_ms: config.jitter_max_ms,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the attempt following `attempt` failed attempts.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        let capped_delay = base_delay.min(self.max_backoff_ms);

        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_max_ms)
        };
        capped_delay.saturating_add(jitter)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Polls `f` up to `attempts` times, sleeping `delay` between tries, until it
/// yields a value. Errors end polling immediately.
pub async fn poll_until<T, E, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut f: F,
) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=attempts {
        if let Some(value) = f(attempt).await? {
            return Ok(Some(value));
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(jitter: u64) -> RetryPolicy {
        RetryPolicy {
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter_max_ms: jitter,
            max_attempts: 8,
        }
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let p = policy(0);
        assert_eq!(p.backoff_ms(1), 1_000);
        assert_eq!(p.backoff_ms(2), 2_000);
        assert_eq!(p.backoff_ms(3), 4_000);
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy(0);
        assert_eq!(p.backoff_ms(30), 300_000);
        assert_eq!(p.backoff_ms(u32::MAX), 300_000);
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let p = policy(0);
        assert!(!p.exhausted(7));
        assert!(p.exhausted(8));
    }

    proptest! {
        #[test]
        fn backoff_stays_within_bounds(attempt in 0u32..100, jitter in 0u64..5_000) {
            let p = policy(jitter);
            let delay = p.backoff_ms(attempt);
            prop_assert!(delay >= p.base_backoff_ms);
            prop_assert!(delay <= p.max_backoff_ms + jitter);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_returns_first_value() {
        let result: Result<Option<u32>, ()> = poll_until(10, Duration::from_millis(500), |n| async move {
            Ok((n == 3).then_some(n))
        })
        .await;
        assert_eq!(result, Ok(Some(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_gives_up() {
        let start = tokio::time::Instant::now();
        let result: Result<Option<u32>, ()> =
            poll_until(10, Duration::from_millis(500), |_| async { Ok(None) }).await;
        assert_eq!(result, Ok(None));
        assert_eq!(start.elapsed(), Duration::from_millis(4_500));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_stops_on_error() {
        let mut calls = 0;
        let result: Result<Option<u32>, &str> = poll_until(10, Duration::from_millis(500), |_| {
            calls += 1;
            async { Err("unreachable") }
        })
        .await;
        assert_eq!(result, Err("unreachable"));
        assert_eq!(calls, 1);
    }
}
