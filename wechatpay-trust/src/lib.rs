//! WeChat Pay APIv3 trust layer.
//!
//! Everything a merchant needs to exchange authenticated messages with the
//! WeChat Pay platform: request signing, response and webhook verification,
//! platform certificate management and payload decryption.
//!
//! # What it guarantees
//!
//! - **Authenticated requests**: every outgoing call carries a
//!   `WECHATPAY2-SHA256-RSA2048` `Authorization` header signed with the
//!   merchant private key
//! - **Verified answers**: responses and webhooks are checked against a cache
//!   of trusted platform certificates before anything reads them; unverified
//!   payloads are never decrypted
//! - **Fresh trust store**: certificates are fetched on a cache miss or near
//!   expiry, with concurrent callers sharing one fetch
//! - **Authenticated decryption**: AES-256-GCM resources are rejected whole on
//!   any tag failure
//!
//! # Architecture
//!
//! ```text
//!   merchant code
//!        │
//! ┌──────▼───────────────────────────────────────────────┐
//! │ WechatPayClient                                      │
//! │  ┌────────┐  ┌──────────────────┐  ┌───────────────┐ │
//! │  │ Signer │  │ ResponseVerifier │  │ PayloadCipher │ │
//! │  └───┬────┘  └────────┬─────────┘  └───────────────┘ │
//! │      │        ┌───────▼─────────┐                    │
//! │      │        │CertificateCache │◄─ CertificateStore │
//! │      │        └───────▲─────────┘                    │
//! │      │        ┌───────┴─────────────┐                │
//! │      └───────►│ CertificateRefresher│                │
//! │               └───────┬─────────────┘                │
//! └───────────────────────┼──────────────────────────────┘
//!                         │ Transport (HTTPS)
//!                  ┌──────▼──────┐
//!                  │  WeChat Pay │
//!                  └─────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wechatpay_trust::{ClientConfig, WechatPayClient, transport::Method};
//!
//! # async fn example(headers: Vec<(String, String)>, body: Vec<u8>) -> wechatpay_trust::Result<()> {
//! let config = ClientConfig::from_file("/etc/wechatpay/client.toml")?;
//! let client = WechatPayClient::new(&config)?;
//! let _refresh = client.spawn_refresh();
//!
//! // Signed request, verified answer
//! let order = br#"{"appid":"wxd678efh567hg6787","mchid":"1230000109"}"#;
//! let answer = client.request(Method::Post, "/v3/pay/transactions/jsapi", order).await?;
//!
//! // Webhook: verified first, then decrypted
//! let resource = client.decrypt_callback(headers, &body).await?;
//! println!("{} {}", String::from_utf8_lossy(&answer), resource["out_trade_no"]);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! ```rust,no_run
//! use wechatpay_trust::{WechatPayClient, WechatPayError};
//!
//! # async fn example(client: WechatPayClient, headers: Vec<(String, String)>, body: Vec<u8>) {
//! match client.decrypt_callback(headers, &body).await {
//!     Ok(resource) => println!("paid: {resource}"),
//!     Err(WechatPayError::TimestampSkew { .. } | WechatPayError::SignatureInvalid(_)) => {
//!         // Reject the callback; the platform redelivers genuine ones
//!     }
//!     Err(e) if e.is_retryable() => {
//!         // Certificate refresh failed; answer 5xx so the platform retries
//!     }
//!     Err(e) => eprintln!("callback rejected: {e}"),
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from rsa and reqwest"
)]

pub mod certificates;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod notify;
pub mod reliability;
pub mod security;
pub mod transport;

pub use client::{EncryptedField, WechatPayClient};
pub use config::{ClientConfig, VerificationConfig, WechatPayType};
pub use error::{Result, WechatPayError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = std::marker::PhantomData::<WechatPayError>;
        let _ = std::marker::PhantomData::<WechatPayClient>;
        assert_eq!(WechatPayType::default(), WechatPayType::Native);
    }
}
