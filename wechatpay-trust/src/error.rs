//! Error types for the WeChat Pay trust layer.
//!
//! Every fallible operation in this crate returns [`Result`], whose error type
//! [`WechatPayError`] separates failures by what the caller is allowed to do
//! with them.
//!
//! # Error Categories
//!
//! - **Fatal configuration errors** ([`WechatPayError::Signing`],
//!   [`WechatPayError::Config`]): the process cannot sign requests
//! - **Retryable errors** ([`WechatPayError::Refresh`], [`WechatPayError::Http`]):
//!   transient transport or platform problems
//! - **Tampering errors** ([`WechatPayError::Trust`],
//!   [`WechatPayError::SignatureInvalid`], [`WechatPayError::Authentication`]):
//!   the data may be forged and must be discarded
//! - **Per-message rejections** ([`WechatPayError::TimestampSkew`],
//!   [`WechatPayError::UnknownCertificate`]): reject the message, do not retry it
//!
//! # Examples
//!
//! ```
//! use wechatpay_trust::error::{Result, WechatPayError};
//!
//! fn parse_timestamp(raw: &str) -> Result<i64> {
//!     raw.parse()
//!         .map_err(|_| WechatPayError::InvalidInput(format!("invalid timestamp: {raw}")))
//! }
//!
//! assert!(parse_timestamp("1414561699").is_ok());
//! assert!(parse_timestamp("yesterday").is_err());
//! ```

use thiserror::Error;

/// Result type alias for trust-layer operations.
pub type Result<T> = std::result::Result<T, WechatPayError>;

/// Errors that can occur while signing, verifying or decrypting.
///
/// None of the tampering variants are ever downgraded to a warning: a caller
/// that receives [`Trust`](Self::Trust), [`SignatureInvalid`](Self::SignatureInvalid)
/// or [`Authentication`](Self::Authentication) must drop the payload.
///
/// # Error Recovery
///
/// - **Transient errors** ([`Refresh`](Self::Refresh), [`Http`](Self::Http)):
///   retry with exponential backoff, see [`crate::reliability::retry_with_backoff`]
/// - **Configuration errors** ([`Signing`](Self::Signing), [`Config`](Self::Config)):
///   fix the merchant key material
/// - **Everything else**: reject the message
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum WechatPayError {
    /// Producing a signature with the merchant private key failed.
    ///
    /// # Recovery
    ///
    /// None at runtime. Check the configured private key and serial number.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Fetching the platform certificate set failed for a transient reason.
    ///
    /// Covers transport failures, non-2xx answers from the certificate
    /// endpoint, and refreshes that did not finish within the refresh timeout.
    ///
    /// # Recovery
    ///
    /// Retry with backoff.
    #[error("certificate refresh failed: {0}")]
    Refresh(String),

    /// A certificate listing could not be authenticated against the trust store.
    ///
    /// Raised when a non-bootstrap refresh is signed by a certificate the
    /// cache does not hold, when its signature does not verify, or when a
    /// decrypted certificate does not match the serial number it was listed
    /// under. The cache is left untouched.
    ///
    /// # Recovery
    ///
    /// None. Treat as possible tampering and alert an operator.
    #[error("platform trust violation: {0}")]
    Trust(String),

    /// The message timestamp lies outside the accepted window.
    #[error("timestamp {timestamp} is more than {tolerance_secs}s away from now ({now})")]
    TimestampSkew {
        /// Timestamp carried by the message (Unix seconds).
        timestamp: i64,
        /// Local clock at verification time (Unix seconds).
        now: i64,
        /// Accepted distance between the two, in seconds.
        tolerance_secs: u64,
    },

    /// No trusted certificate exists for the serial number, even after a refresh.
    #[error("no trusted platform certificate with serial number {0}")]
    UnknownCertificate(String),

    /// The signature does not match the canonical message.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Authenticated decryption rejected the ciphertext.
    ///
    /// No plaintext, partial or otherwise, is returned alongside this error.
    #[error("authenticated decryption failed: {0}")]
    Authentication(String),

    /// Configuration or key material could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A header, envelope or encoded field is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// HTTP request failed.
    ///
    /// Wraps [`reqwest::Error`]. Timeouts, refused connections and TLS
    /// failures all end up here.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform answered with a non-success status code.
    #[error("platform returned status {status}: {body}")]
    Platform {
        /// HTTP status code.
        status: u16,
        /// Response body as text.
        body: String,
    },

    /// Reading or writing the certificate directory failed.
    #[error("certificate store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl WechatPayError {
    /// Returns `true` if repeating the operation may succeed.
    ///
    /// Only transport-level failures qualify. Verification and decryption
    /// failures are never retryable.
    ///
    /// ```
    /// use wechatpay_trust::WechatPayError;
    ///
    /// assert!(WechatPayError::Refresh("timed out".into()).is_retryable());
    /// assert!(!WechatPayError::Trust("unknown signer".into()).is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Refresh(_) | Self::Http(_))
    }
}
