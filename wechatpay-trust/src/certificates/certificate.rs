//! A single platform certificate and the operations its public key supports.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use rsa::{
    Oaep, RsaPublicKey,
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
};
use sha1::Sha1;
use sha2::Sha256;
use x509_cert::{Certificate, der::DecodePem, time::Time};

use crate::error::{Result, WechatPayError};

/// A platform certificate: serial number, RSA public key and validity window.
///
/// Immutable once built. The cache hands out `Arc<PlatformCertificate>`.
#[derive(Clone)]
pub struct PlatformCertificate {
    serial_no: String,
    public_key: RsaPublicKey,
    verifying_key: VerifyingKey<Sha256>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    pem: Option<Arc<str>>,
}

impl PlatformCertificate {
    /// Parses a PEM encoded X.509 certificate.
    ///
    /// The serial number and validity window come from the certificate itself.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::InvalidInput`] if the PEM is not an X.509
    /// certificate with an RSA public key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let certificate = Certificate::from_pem(pem.as_bytes())
            .map_err(|e| WechatPayError::InvalidInput(format!("invalid platform certificate: {e}")))?;
        let tbs = &certificate.tbs_certificate;

        let public_key = RsaPublicKey::from_pkcs1_der(tbs.subject_public_key_info.subject_public_key.raw_bytes())
            .map_err(|e| WechatPayError::InvalidInput(format!("certificate key is not RSA: {e}")))?;

        Ok(Self {
            serial_no: format_serial(tbs.serial_number.as_bytes()),
            verifying_key: VerifyingKey::new(public_key.clone()),
            public_key,
            not_before: to_utc(tbs.validity.not_before)?,
            not_after: to_utc(tbs.validity.not_after)?,
            pem: Some(Arc::from(pem.trim())),
        })
    }

    /// Builds a certificate entry from a bare public key.
    #[must_use]
    pub fn from_public_key(
        serial_no: &str,
        public_key: RsaPublicKey,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Self {
        Self {
            serial_no: serial_no.trim().to_ascii_uppercase(),
            verifying_key: VerifyingKey::new(public_key.clone()),
            public_key,
            not_before,
            not_after,
            pem: None,
        }
    }

    /// Replaces the validity window with the one the platform listed.
    #[must_use]
    pub fn with_validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Upper-case hexadecimal serial number.
    #[must_use]
    pub fn serial_no(&self) -> &str {
        &self.serial_no
    }

    /// Start of the validity window.
    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    #[must_use]
    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// The RSA public key.
    #[must_use]
    pub const fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Original PEM, when the certificate was parsed from one.
    #[must_use]
    pub fn pem(&self) -> Option<&str> {
        self.pem.as_deref()
    }

    /// Whether `now` lies inside `[not_before, not_after)`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Verifies an RSASSA-PKCS1-v1_5 / SHA-256 signature over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::SignatureInvalid`] if the signature is
    /// malformed or does not match.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature)
            .map_err(|e| WechatPayError::SignatureInvalid(format!("malformed signature: {e}")))?;
        self.verifying_key
            .verify(message, &signature)
            .map_err(|_| WechatPayError::SignatureInvalid(format!("signature does not match certificate {}", self.serial_no)))
    }

    /// Encrypts a sensitive field with RSA-OAEP (SHA-1) for the platform.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::InvalidInput`] if the plaintext is too long
    /// for the key.
    pub fn encrypt_oaep(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), plaintext)
            .map_err(|e| WechatPayError::InvalidInput(format!("RSA-OAEP encryption failed: {e}")))
    }
}

impl fmt::Debug for PlatformCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCertificate")
            .field("serial_no", &self.serial_no)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Formats DER serial bytes the way the platform prints them.
fn format_serial(bytes: &[u8]) -> String {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len().saturating_sub(1));
    hex::encode_upper(&bytes[start..])
}

fn to_utc(time: Time) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(time.to_unix_duration().as_secs())
        .map_err(|_| WechatPayError::InvalidInput("certificate time out of range".to_owned()))?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| WechatPayError::InvalidInput("certificate time out of range".to_owned()))
}
