//! Exponential backoff for token and window fetches

use crate::{MapError, Result};
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Retry configuration for network operations
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier (2.0 for exponential)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

/// All attempts of an operation failed
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: MapError,
}

impl From<RetryExhausted> for MapError {
    fn from(exhausted: RetryExhausted) -> Self {
        match exhausted.last_error {
            // Keep non-network failures recognizable
            err @ (MapError::TokenUnavailable
            | MapError::Token(_)
            | MapError::InvalidConfig(_)
            | MapError::FeedClosed) => err,
            err => MapError::Fetch {
                attempts: exhausted.attempts,
                reason: err.to_string(),
            },
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(MapError::InvalidConfig(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(MapError::InvalidConfig(format!(
                "retry backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Calculate backoff for attempt number (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u128;
        let backoff = Duration::from_millis(backoff_ms.min(u64::MAX as u128) as u64);
        backoff.min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `op` receives the 0-indexed attempt number. Errors that are not
    /// [transient](MapError::is_transient) stop the loop immediately.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> std::result::Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                    let backoff = self.backoff_for_attempt(attempt);
                    tracing::debug!(operation, attempt, ?backoff, %err, "Retrying after failure");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(operation, attempts = attempt + 1, %err, "Giving up");
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> MapError {
        MapError::Fetch {
            attempts: 1,
            reason: "timeout".to_string(),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(3));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_on_eventual_availability() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryPolicy::default()
            .run("fetch", |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: std::result::Result<(), _> = RetryPolicy::default()
            .run("fetch", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            MapError::from(exhausted),
            MapError::Fetch { attempts: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: std::result::Result<(), _> = RetryPolicy::default()
            .run("token", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MapError::TokenUnavailable)
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            MapError::from(result.unwrap_err()),
            MapError::TokenUnavailable
        ));
    }
}
