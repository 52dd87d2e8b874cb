//! Retry support for transient certificate-refresh and transport failures.
//!
//! ```rust
//! use wechatpay_trust::reliability::{RetryPolicy, is_retryable};
//! use wechatpay_trust::WechatPayError;
//!
//! let policy = RetryPolicy::with_max_attempts(4);
//! assert_eq!(policy.max_attempts, 4);
//! assert!(!is_retryable(&WechatPayError::Trust("forged".to_owned())));
//! ```

mod retry;

pub use retry::{RetryPolicy, is_retryable, is_unsent, retry_with_backoff, retry_with_backoff_if};
