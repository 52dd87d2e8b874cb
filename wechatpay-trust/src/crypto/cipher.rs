//! AEAD_AES_256_GCM payload encryption keyed by the APIv3 key.
//!
//! Certificate listings and webhook resources arrive as base64 ciphertext
//! with the 16-byte tag appended, a 12-byte nonce and optional associated
//! data. Decryption either authenticates the whole block or fails; no
//! partial plaintext ever leaves this module.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use base64::Engine;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, WechatPayError};

/// Algorithm name the platform puts in every encrypted block.
pub const AEAD_ALGORITHM: &str = "AEAD_AES_256_GCM";

/// Length of an APIv3 key in bytes.
pub const API_V3_KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// The 32-byte merchant APIv3 key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApiV3Key([u8; API_V3_KEY_LEN]);

impl ApiV3Key {
    /// Wraps raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] unless exactly 32 bytes are given.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let key: [u8; API_V3_KEY_LEN] = bytes.try_into().map_err(|_| {
            WechatPayError::Config(format!(
                "APIv3 key must be {API_V3_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Parses the key as configured in the merchant platform (32 ASCII characters).
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] unless the string is exactly 32 bytes.
    pub fn from_text(text: &str) -> Result<Self> {
        Self::new(text.as_bytes())
    }
}

impl fmt::Debug for ApiV3Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiV3Key(<redacted>)")
    }
}

/// An encrypted `resource` block as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlock {
    /// Always [`AEAD_ALGORITHM`].
    pub algorithm: String,
    /// Base64 of ciphertext followed by the 16-byte tag.
    pub ciphertext: String,
    /// Associated data; absent is treated as empty.
    #[serde(default)]
    pub associated_data: String,
    /// 12-character nonce, used as raw bytes.
    pub nonce: String,
    /// Object type before encryption, present on webhook resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
}

/// AES-256-GCM encryptor/decryptor bound to one APIv3 key.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::crypto::{ApiV3Key, PayloadCipher};
///
/// let cipher = PayloadCipher::new(&ApiV3Key::from_text("0123456789abcdef0123456789abcdef")?);
/// let block = cipher.encrypt(b"certificate", br#"{"event":"ok"}"#)?;
/// let plaintext = cipher.decrypt_block(&block)?;
/// assert_eq!(plaintext, br#"{"event":"ok"}"#);
/// # Ok::<(), wechatpay_trust::WechatPayError>(())
/// ```
#[derive(Clone)]
pub struct PayloadCipher {
    aead: Aes256Gcm,
}

impl PayloadCipher {
    /// Creates a cipher for the given key.
    #[must_use]
    pub fn new(key: &ApiV3Key) -> Self {
        Self { aead: Aes256Gcm::new(&key.0.into()) }
    }

    /// Decrypts `ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::InvalidInput`] if the nonce is not 12 bytes
    /// - [`WechatPayError::Authentication`] if the tag does not verify, including
    ///   a wrong key, altered associated data or a truncated ciphertext
    pub fn decrypt(&self, nonce: &[u8], associated_data: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(WechatPayError::InvalidInput(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        if ciphertext.len() < TAG_LEN {
            return Err(WechatPayError::Authentication(format!(
                "ciphertext of {} bytes is shorter than the authentication tag",
                ciphertext.len()
            )));
        }

        self.aead
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: associated_data })
            .map_err(|_| WechatPayError::Authentication("authentication tag mismatch".to_owned()))
    }

    /// Decodes and decrypts an [`EncryptedBlock`].
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::InvalidInput`] for an unsupported algorithm, bad
    ///   base64 or a wrong nonce length
    /// - [`WechatPayError::Authentication`] if authentication fails
    pub fn decrypt_block(&self, block: &EncryptedBlock) -> Result<Vec<u8>> {
        if block.algorithm != AEAD_ALGORITHM {
            return Err(WechatPayError::InvalidInput(format!(
                "unsupported algorithm {:?}",
                block.algorithm
            )));
        }
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(block.ciphertext.as_bytes())
            .map_err(|e| WechatPayError::InvalidInput(format!("ciphertext is not base64: {e}")))?;

        self.decrypt(block.nonce.as_bytes(), block.associated_data.as_bytes(), &ciphertext)
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// Used to build webhook fixtures and by tooling that re-encrypts
    /// resources; the platform never expects merchant-side ciphertext here.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Authentication`] if the AEAD primitive fails.
    pub fn encrypt(&self, associated_data: &[u8], plaintext: &[u8]) -> Result<EncryptedBlock> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        self.encrypt_with_nonce(&nonce, associated_data, plaintext)
    }

    /// Encrypts with a caller-chosen 12-character nonce.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::InvalidInput`] if the nonce is not 12 bytes
    /// - [`WechatPayError::Authentication`] if the AEAD primitive fails
    pub fn encrypt_with_nonce(
        &self,
        nonce: &str,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<EncryptedBlock> {
        if nonce.len() != NONCE_LEN {
            return Err(WechatPayError::InvalidInput(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(nonce.as_bytes()), Payload { msg: plaintext, aad: associated_data })
            .map_err(|_| WechatPayError::Authentication("AEAD encryption failed".to_owned()))?;

        Ok(EncryptedBlock {
            algorithm: AEAD_ALGORITHM.to_owned(),
            ciphertext: base64::engine::general_purpose::STANDARD.encode(sealed),
            associated_data: String::from_utf8_lossy(associated_data).into_owned(),
            nonce: nonce.to_owned(),
            original_type: None,
        })
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCipher").field("algorithm", &AEAD_ALGORITHM).finish_non_exhaustive()
    }
}
