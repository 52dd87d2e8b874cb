//! Exponential backoff retry for transient failures.
//!
//! Only [`WechatPayError::Refresh`] and transient [`WechatPayError::Http`]
//! failures are retried. Verification and decryption failures mean the data
//! may be forged and are returned on the first occurrence.

use std::time::Duration;

use crate::error::{Result, WechatPayError};

/// Configuration for retry behavior.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use wechatpay_trust::reliability::RetryPolicy;
///
/// // Default policy: 3 attempts, 100ms initial delay, 5s max delay
/// let policy = RetryPolicy::default();
///
/// let patient = RetryPolicy {
///     max_attempts: 5,
///     initial_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(30),
///     backoff_multiplier: 2.0,
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included (default: 3)
    pub max_attempts: u32,
    /// Initial delay between attempts (default: 100ms)
    pub initial_delay: Duration,
    /// Maximum delay between attempts (default: 5s)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom maximum attempts.
    ///
    /// # Examples
    ///
    /// ```
    /// use wechatpay_trust::reliability::RetryPolicy;
    ///
    /// let policy = RetryPolicy::with_max_attempts(5);
    /// assert_eq!(policy.max_attempts, 5);
    /// ```
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts, ..Self::default() }
    }

    /// Delay before the attempt following `attempt`: `initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(
            clippy::cast_precision_loss,
            reason = "acceptable for duration calculations"
        )]
        let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "delay is clamped to max_delay below; saturating cast handles overflow"
        )]
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

/// Executes `operation` with exponential backoff.
///
/// Stops at the first success, the first non-retryable error (see
/// [`is_retryable`]), or after `max_attempts`. A policy with
/// `max_attempts == 0` still runs the operation once.
///
/// # Examples
///
/// ```
/// use std::sync::{
///     Arc,
///     atomic::{AtomicU32, Ordering},
/// };
///
/// use wechatpay_trust::{
///     WechatPayError,
///     reliability::{RetryPolicy, retry_with_backoff},
/// };
///
/// # async fn example() -> wechatpay_trust::Result<()> {
/// let attempt = Arc::new(AtomicU32::new(0));
///
/// let result = retry_with_backoff(&RetryPolicy::default(), || {
///     let attempt = Arc::clone(&attempt);
///     async move {
///         if attempt.fetch_add(1, Ordering::Relaxed) < 2 {
///             Err(WechatPayError::Refresh("connection reset".to_owned()))
///         } else {
///             Ok("refreshed")
///         }
///     }
/// })
/// .await?;
///
/// assert_eq!(result, "refreshed");
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the last error if every attempt fails, or the first
/// non-retryable error immediately.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff_if(policy, is_retryable, operation).await
}

/// Like [`retry_with_backoff`], retrying only errors accepted by `retryable`.
///
/// Use [`is_unsent`] for operations with side effects on the platform.
///
/// # Errors
///
/// Returns the last error if every attempt fails, or the first error
/// `retryable` rejects immediately.
pub async fn retry_with_backoff_if<F, Fut, T, P>(policy: &RetryPolicy, retryable: P, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&WechatPayError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !retryable(&error) => return Err(error),
            Err(error) if attempt + 1 >= max_attempts => {
                tracing::warn!(attempts = max_attempts, error = %error, "Retry attempts exhausted");
                return Err(error);
            }
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Determines if an error is worth retrying.
///
/// `Refresh` errors always are. `Http` errors are when they are timeouts,
/// connection failures or 5xx answers. Everything else is final.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::{WechatPayError, reliability::is_retryable};
///
/// assert!(is_retryable(&WechatPayError::Refresh("timed out".to_owned())));
/// assert!(!is_retryable(&WechatPayError::SignatureInvalid("mismatch".to_owned())));
/// ```
#[must_use]
pub fn is_retryable(error: &WechatPayError) -> bool {
    match error {
        WechatPayError::Http(e) => {
            e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
        }
        other => other.is_retryable(),
    }
}

/// Determines if a failed request never reached the platform.
///
/// Only connection failures qualify. A timeout or any answer, error status
/// or unverifiable body included, means the platform may have acted on the
/// request, so sending it again could repeat an order or refund.
///
/// ```
/// use wechatpay_trust::{WechatPayError, reliability::is_unsent};
///
/// assert!(!is_unsent(&WechatPayError::Refresh("listing unavailable".to_owned())));
/// ```
#[must_use]
pub fn is_unsent(error: &WechatPayError) -> bool {
    matches!(error, WechatPayError::Http(e) if e.is_connect())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(1), ..RetryPolicy::default() };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refresh_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(&fast_policy(3), || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WechatPayError::Refresh("temporary".to_owned()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_trust_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = retry_with_backoff(&fast_policy(5), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WechatPayError::Trust("forged listing".to_owned()))
            }
        })
        .await;

        assert!(matches!(result, Err(WechatPayError::Trust(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = retry_with_backoff(&fast_policy(3), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WechatPayError::Refresh("down".to_owned()))
            }
        })
        .await;

        assert!(matches!(result, Err(WechatPayError::Refresh(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let _ = retry_with_backoff(&fast_policy(0), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(WechatPayError::Refresh("down".to_owned()))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(is_retryable(&WechatPayError::Refresh("x".to_owned())));
        assert!(!is_retryable(&WechatPayError::Authentication("x".to_owned())));
        assert!(!is_retryable(&WechatPayError::UnknownCertificate("x".to_owned())));
        assert!(!is_retryable(&WechatPayError::Platform { status: 503, body: String::new() }));
    }

    #[tokio::test]
    async fn test_custom_predicate_limits_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = retry_with_backoff_if(&fast_policy(5), is_unsent, || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WechatPayError::Refresh("listing unavailable".to_owned()))
            }
        })
        .await;

        assert!(matches!(result, Err(WechatPayError::Refresh(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_answered_requests_are_not_unsent() {
        assert!(!is_unsent(&WechatPayError::Refresh("x".to_owned())));
        assert!(!is_unsent(&WechatPayError::Platform { status: 503, body: String::new() }));
        assert!(!is_unsent(&WechatPayError::UnknownCertificate("x".to_owned())));
    }
}
