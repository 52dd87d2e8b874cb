//! Cryptographic primitives of the APIv3 trust layer.
//!
//! - [`KeyStore`]: merchant identity and RSA private key
//! - [`Signer`]: `Authorization` headers and `paySign`
//! - [`PayloadCipher`]: AEAD_AES_256_GCM under the APIv3 key
//! - [`ResponseVerifier`]: platform signature checks against the trust store
//!
//! # Examples
//!
//! ```
//! use wechatpay_trust::crypto::build_message;
//!
//! let message = build_message(&["wx888", "1414561699", "5K8264ILTKCH16CQ2502S", "prepay_id=wx20141027"]);
//! assert!(message.ends_with("prepay_id=wx20141027\n"));
//! ```

pub mod cipher;
pub mod keys;
pub mod signer;
pub mod verifier;

#[cfg(test)]
mod tests;

pub use cipher::{AEAD_ALGORITHM, ApiV3Key, EncryptedBlock, PayloadCipher};
pub use keys::{KeyStore, MerchantIdentity, parse_private_key};
pub use signer::{AUTH_SCHEME, Authorization, Signer, build_message, generate_nonce};
pub use verifier::{
    DEFAULT_TIMESTAMP_TOLERANCE_SECS, HEADER_NONCE, HEADER_SERIAL, HEADER_SIGNATURE, HEADER_TIMESTAMP,
    ResponseVerifier, SignedEnvelope, VerificationResult,
};
