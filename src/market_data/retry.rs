use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackoffKind, RetrySettings};
use crate::error::DataError;

/// Waits between attempts. Injected so tests can run without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `base` after every failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let backoff = match settings.backoff {
            BackoffKind::Fixed => Backoff::Fixed(settings.delay()),
            BackoffKind::Exponential => Backoff::Exponential {
                base: settings.delay(),
                max: settings.max_delay(),
            },
        };
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until it succeeds or the attempts run out, sleeping between
    /// attempts but not after the last one. Returns the last error.
    pub async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        label: &str,
        mut op: F,
    ) -> Result<T, DataError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::debug!("{label}: giving up after {attempt} attempts: {e}");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::debug!("{label}: attempt {attempt} failed ({e}), retrying in {delay:?}");
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::RecordingSleeper;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_millis(500),
            },
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(40), Duration::from_millis(500));
    }

    #[test]
    fn test_default_policy_matches_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn test_run_sleeps_only_between_attempts() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        };

        let result: Result<(), DataError> = policy
            .run(&sleeper, "always fails", |_| async {
                Err(DataError::Empty {
                    ticker: "X".into(),
                })
            })
            .await;

        tokio_test::assert_err!(result);
        assert_eq!(sleeper.sleeps().await, vec![Duration::from_millis(500); 3]);
    }

    #[tokio::test]
    async fn test_run_stops_at_first_success() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::default();

        let value = policy
            .run(&sleeper, "flaky", |attempt| async move {
                if attempt < 3 {
                    Err(DataError::Empty {
                        ticker: "X".into(),
                    })
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(tokio_test::assert_ok!(value), 3);
        assert_eq!(sleeper.sleeps().await.len(), 2);
    }
}
