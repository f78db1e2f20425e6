//! Bounded exponential backoff for collaborator calls.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CollaboratorError, ErrorKind};

/// The transform stage is always tried twice.
pub const TRANSFORM_ATTEMPTS: u32 = 2;

/// How many times to try a stage and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomization factor applied to each delay, between 0.0 and 1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            jitter: 0.0,
        }
    }

    /// Download defaults: three attempts starting at two seconds.
    pub fn download() -> Self {
        Self::default()
    }

    /// Transform policy: exactly one retry, `delay` after the first failure.
    pub fn transform(delay: Duration) -> Self {
        Self::new(TRANSFORM_ATTEMPTS, delay, delay)
    }

    /// Publish defaults: three attempts with long pauses for rate limits.
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 30_000,
            max_delay_ms: 300_000,
            jitter: 0.2,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay schedule for one stage. The attempt budget bounds it, not elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay(),
            initial_interval: self.base_delay(),
            max_interval: self.max_delay(),
            randomization_factor: self.jitter.clamp(0.0, 1.0),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable kind, or runs out of attempts.
///
/// Each attempt is bounded by `call_timeout`; a timeout counts as a transient
/// failure. `attempts` is incremented once per call made.
pub(crate) async fn with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    call_timeout: Duration,
    attempts: &mut u32,
    retryable: impl Fn(ErrorKind) -> bool,
    mut op: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut backoff = policy.backoff();

    loop {
        *attempts += 1;

        let result = match tokio::time::timeout(call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::transient(format!(
                "{label} timed out after {}s",
                call_timeout.as_secs()
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if retryable(e.kind) && *attempts < policy.attempts() => {
                let delay = backoff.next_backoff().unwrap_or_else(|| policy.max_delay());
                warn!(
                    stage = label,
                    attempt = *attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(40))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let mut attempts = 0;

        let result = with_retry(
            "download",
            &fast(3),
            Duration::from_secs(5),
            &mut attempts,
            |kind| kind == ErrorKind::Transient,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CollaboratorError::transient("flaky"))
                } else {
                    Ok("done")
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_non_retryable_kind() {
        let mut attempts = 0;

        let result: Result<(), _> = with_retry(
            "publish",
            &fast(5),
            Duration::from_secs(5),
            &mut attempts,
            |kind| kind == ErrorKind::Transient,
            || async { Err(CollaboratorError::auth("bad token")) },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::AuthFailure);
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let mut attempts = 0;

        let result: Result<(), _> = with_retry(
            "download",
            &fast(3),
            Duration::from_secs(5),
            &mut attempts,
            |_| true,
            || async { Err(CollaboratorError::transient("down")) },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient() {
        let mut attempts = 0;

        let result: Result<(), _> = with_retry(
            "transform",
            &fast(1),
            Duration::from_secs(1),
            &mut attempts,
            |_| true,
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = fast(5).backoff();
        let delays: Vec<_> = (0..4).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays[1] > delays[0]);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(fast(0).attempts(), 1);
    }
}
