//! Merchant identity and private key material.

use std::fmt;

use base64::Engine;
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{Result, WechatPayError};

/// Minimum accepted RSA modulus size in bytes (2048 bits).
const MIN_MODULUS_BYTES: usize = 256;

/// Who the merchant is, as seen by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantIdentity {
    mchid: String,
    appid: String,
    cert_serial_no: String,
}

impl MerchantIdentity {
    /// Creates a merchant identity.
    ///
    /// The serial number is normalised to upper case, which is how the
    /// platform prints certificate serials.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if any field is empty or the serial
    /// number is not hexadecimal.
    pub fn new(mchid: &str, appid: &str, cert_serial_no: &str) -> Result<Self> {
        if mchid.trim().is_empty() {
            return Err(WechatPayError::Config("mchid must not be empty".to_owned()));
        }
        if appid.trim().is_empty() {
            return Err(WechatPayError::Config("appid must not be empty".to_owned()));
        }
        let serial = cert_serial_no.trim();
        if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WechatPayError::Config(format!(
                "certificate serial number must be hexadecimal, got {cert_serial_no:?}"
            )));
        }

        Ok(Self {
            mchid: mchid.trim().to_owned(),
            appid: appid.trim().to_owned(),
            cert_serial_no: serial.to_ascii_uppercase(),
        })
    }

    /// Merchant id (`mchid`).
    #[must_use]
    pub fn mchid(&self) -> &str {
        &self.mchid
    }

    /// Application id (`appid`).
    #[must_use]
    pub fn appid(&self) -> &str {
        &self.appid
    }

    /// Serial number of the merchant API certificate.
    #[must_use]
    pub fn cert_serial_no(&self) -> &str {
        &self.cert_serial_no
    }
}

/// Holds the merchant identity and private key for the life of the process.
///
/// Immutable after construction. Share it behind an [`Arc`](std::sync::Arc).
pub struct KeyStore {
    identity: MerchantIdentity,
    private_key: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
}

impl KeyStore {
    /// Creates a key store from an already parsed private key.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if the key is shorter than 2048 bits.
    pub fn new(identity: MerchantIdentity, private_key: RsaPrivateKey) -> Result<Self> {
        if private_key.size() < MIN_MODULUS_BYTES {
            return Err(WechatPayError::Config(format!(
                "merchant private key must be at least 2048 bits, got {}",
                private_key.size() * 8
            )));
        }
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        Ok(Self { identity, private_key, signing_key })
    }

    /// Creates a key store from PEM (PKCS#8 or PKCS#1) or bare base64 DER.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Config`] if the key material cannot be parsed.
    ///
    /// # Examples
    ///
    /// ```
    /// use wechatpay_trust::crypto::{KeyStore, MerchantIdentity};
    ///
    /// let identity = MerchantIdentity::new("1230000109", "wxd678efh567hg6787", "444F4864EA9B3441")?;
    /// let result = KeyStore::from_pem(identity, "not a key");
    /// assert!(result.is_err());
    /// # Ok::<(), wechatpay_trust::WechatPayError>(())
    /// ```
    pub fn from_pem(identity: MerchantIdentity, material: &str) -> Result<Self> {
        Self::new(identity, parse_private_key(material)?)
    }

    /// The merchant identity.
    #[must_use]
    pub fn identity(&self) -> &MerchantIdentity {
        &self.identity
    }

    /// Public half of the merchant key.
    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }

    /// Decrypts an RSA-OAEP (SHA-1) block addressed to the merchant key.
    ///
    /// The platform uses this for sensitive fields inside responses.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Authentication`] if OAEP decoding fails.
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|e| WechatPayError::Authentication(format!("RSA-OAEP decryption failed: {e}")))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("identity", &self.identity)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Parses an RSA private key from the formats merchants are handed.
///
/// Accepts PKCS#8 PEM (`BEGIN PRIVATE KEY`), PKCS#1 PEM
/// (`BEGIN RSA PRIVATE KEY`) and the bare base64 body of either.
///
/// # Errors
///
/// Returns [`WechatPayError::Config`] if none of the formats match.
pub fn parse_private_key(material: &str) -> Result<RsaPrivateKey> {
    let material = material.trim();

    if material.contains("BEGIN PRIVATE KEY") {
        return RsaPrivateKey::from_pkcs8_pem(material)
            .map_err(|e| WechatPayError::Config(format!("invalid PKCS#8 private key: {e}")));
    }
    if material.contains("BEGIN RSA PRIVATE KEY") {
        return RsaPrivateKey::from_pkcs1_pem(material)
            .map_err(|e| WechatPayError::Config(format!("invalid PKCS#1 private key: {e}")));
    }

    let compact: String = material.split_whitespace().collect();
    let der = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| WechatPayError::Config(format!("private key is neither PEM nor base64: {e}")))?;

    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| WechatPayError::Config(format!("invalid private key DER: {e}")))
}
