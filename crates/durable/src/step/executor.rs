//! Attempt loop for a fresh step

use std::future::Future;

use tracing::{debug, warn};

use super::{StepError, StepOptions};

/// Run `f` until it succeeds or the step's retry policy is exhausted
///
/// Returns the outcome to record. Without a retry policy the first failure
/// is terminal.
pub(crate) async fn execute_attempts<F, Fut>(
    step_name: &str,
    options: &StepOptions,
    mut f: F,
) -> Result<serde_json::Value, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<serde_json::Value, StepError>>,
{
    let max_attempts = options.max_attempts();
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let policy = match &options.retry_policy {
                    Some(policy) if attempt < max_attempts => policy,
                    _ => return Err(error),
                };
                if !error.retryable || !policy.should_retry(error.error_type.as_deref()) {
                    debug!(step = %step_name, error = %error, "Step error is not retryable");
                    return Err(error);
                }

                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    step = %step_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Step attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_policy_fails_on_first_error() {
        let calls = AtomicU32::new(0);
        let result = execute_attempts("once", &StepOptions::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::retryable("boom")) }
        })
        .await;

        assert_eq!(result.unwrap_err().message, "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let options = StepOptions::new().with_retry(RetryPolicy::fixed(Duration::from_secs(1), 5));

        let result = execute_attempts("flaky", &options, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StepError::retryable("transient"))
                } else {
                    Ok(serde_json::json!(n))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), serde_json::json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_policy_returns_last_error() {
        let calls = AtomicU32::new(0);
        let options = StepOptions::new().with_retry(RetryPolicy::fixed(Duration::from_millis(10), 3));

        let result = execute_attempts("always", &options, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<serde_json::Value, _>(StepError::retryable(format!("fail {n}"))) }
        })
        .await;

        assert_eq!(result.unwrap_err().message, "fail 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_skips_remaining_attempts() {
        let calls = AtomicU32::new(0);
        let options = StepOptions::new().with_retry(
            RetryPolicy::fixed(Duration::ZERO, 5).with_non_retryable_error("INVALID"),
        );

        let result = execute_attempts("typed", &options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::retryable("bad").with_type("INVALID")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let result = execute_attempts("permanent", &options, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::non_retryable("nope")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
