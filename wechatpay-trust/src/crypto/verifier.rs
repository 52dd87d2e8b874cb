//! Verification of platform-signed responses and notifications.
//!
//! A platform message carries four headers:
//!
//! | Header | Meaning |
//! |--------|---------|
//! | `Wechatpay-Timestamp` | Unix seconds when the platform signed |
//! | `Wechatpay-Nonce` | random string |
//! | `Wechatpay-Signature` | base64 RSASSA-PKCS1-v1_5 / SHA-256 |
//! | `Wechatpay-Serial` | serial number of the signing platform certificate |
//!
//! The signed message is `timestamp\nnonce\nbody\n`.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::{
    audit,
    certificates::{CertificateCache, CertificateRefresher, PlatformCertificate, RefreshOutcome},
    error::{Result, WechatPayError},
    security::audit::AuditEventType,
    transport::{ApiResponse, Transport},
};

/// Header carrying the signing timestamp.
pub const HEADER_TIMESTAMP: &str = "Wechatpay-Timestamp";
/// Header carrying the nonce.
pub const HEADER_NONCE: &str = "Wechatpay-Nonce";
/// Header carrying the base64 signature.
pub const HEADER_SIGNATURE: &str = "Wechatpay-Signature";
/// Header carrying the platform certificate serial number.
pub const HEADER_SERIAL: &str = "Wechatpay-Serial";

/// Default accepted clock distance, in seconds.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 300;

/// The signed parts of a platform message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// `Wechatpay-Timestamp`, Unix seconds.
    pub timestamp: i64,
    /// `Wechatpay-Nonce`.
    pub nonce: String,
    /// Raw body bytes, exactly as received.
    pub body: Vec<u8>,
    /// `Wechatpay-Serial`, upper-cased.
    pub serial_no: String,
    /// `Wechatpay-Signature`, still base64.
    pub signature: String,
}

impl SignedEnvelope {
    /// Extracts the envelope from header pairs. Header names match case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::InvalidInput`] if a header is missing or the
    /// timestamp is not an integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use wechatpay_trust::crypto::SignedEnvelope;
    ///
    /// let headers = [
    ///     ("wechatpay-timestamp", "1554208460"),
    ///     ("wechatpay-nonce", "593BEC0C930BF1AFEB40B4A08C8FB242"),
    ///     ("wechatpay-signature", "c2lnbmF0dXJl"),
    ///     ("wechatpay-serial", "5157f09efdc096de15ebe81a47057a7232f1b8e1"),
    /// ];
    /// let envelope = SignedEnvelope::from_headers(headers, b"{}".to_vec())?;
    /// assert_eq!(envelope.message(), b"1554208460\n593BEC0C930BF1AFEB40B4A08C8FB242\n{}\n");
    /// assert_eq!(envelope.serial_no, "5157F09EFDC096DE15EBE81A47057A7232F1B8E1");
    /// # Ok::<(), wechatpay_trust::WechatPayError>(())
    /// ```
    pub fn from_headers<I, K, V>(headers: I, body: Vec<u8>) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut timestamp = None;
        let mut nonce = None;
        let mut signature = None;
        let mut serial_no = None;

        for (name, value) in headers {
            let name = name.as_ref();
            let value = value.as_ref().trim().to_owned();
            if name.eq_ignore_ascii_case(HEADER_TIMESTAMP) {
                timestamp = Some(value);
            } else if name.eq_ignore_ascii_case(HEADER_NONCE) {
                nonce = Some(value);
            } else if name.eq_ignore_ascii_case(HEADER_SIGNATURE) {
                signature = Some(value);
            } else if name.eq_ignore_ascii_case(HEADER_SERIAL) {
                serial_no = Some(value);
            }
        }

        let missing = |header: &str| WechatPayError::InvalidInput(format!("missing {header} header"));
        let timestamp = timestamp.ok_or_else(|| missing(HEADER_TIMESTAMP))?;
        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|_| WechatPayError::InvalidInput(format!("invalid {HEADER_TIMESTAMP}: {timestamp:?}")))?;

        Ok(Self {
            timestamp,
            nonce: nonce.ok_or_else(|| missing(HEADER_NONCE))?,
            body,
            serial_no: serial_no.ok_or_else(|| missing(HEADER_SERIAL))?.to_ascii_uppercase(),
            signature: signature.ok_or_else(|| missing(HEADER_SIGNATURE))?,
        })
    }

    /// Extracts the envelope from a transport response.
    ///
    /// # Errors
    ///
    /// Same as [`from_headers`](Self::from_headers).
    pub fn from_response(response: &ApiResponse) -> Result<Self> {
        Self::from_headers(
            response.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            response.body.clone(),
        )
    }

    /// The canonical signed message: `timestamp\nnonce\nbody\n`.
    #[must_use]
    pub fn message(&self) -> Vec<u8> {
        let mut message = format!("{}\n{}\n", self.timestamp, self.nonce).into_bytes();
        message.extend_from_slice(&self.body);
        message.push(b'\n');
        message
    }

    /// Decoded signature bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::SignatureInvalid`] if the header is not base64.
    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.signature.as_bytes())
            .map_err(|e| WechatPayError::SignatureInvalid(format!("signature is not base64: {e}")))
    }

    /// Verifies this envelope against one certificate, with no clock or cache checks.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::SignatureInvalid`] on mismatch.
    pub fn verify_with(&self, certificate: &PlatformCertificate) -> Result<()> {
        certificate.verify(&self.message(), &self.signature_bytes()?)
    }
}

/// Outcome of a verification, for callers that want a value instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// Whether the message is authentic.
    pub verified: bool,
    /// Serial number the message named.
    pub serial_no: String,
    /// Why verification failed.
    pub reason: Option<String>,
}

/// Authenticates platform responses and notifications against the trust store.
///
/// On a cache miss, or when every cached certificate is close to expiry, the
/// verifier asks the refresher for a new set; concurrent callers share one
/// fetch. A message that still cannot be matched to a valid certificate is
/// rejected and never reaches decryption.
pub struct ResponseVerifier<T> {
    cache: Arc<CertificateCache>,
    refresher: Arc<CertificateRefresher<T>>,
    tolerance_secs: u64,
    mchid: String,
}

impl<T> std::fmt::Debug for ResponseVerifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseVerifier")
            .field("cache", &self.cache)
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ResponseVerifier<T> {
    /// Creates a verifier sharing the refresher's cache.
    #[must_use]
    pub fn new(refresher: Arc<CertificateRefresher<T>>, tolerance_secs: u64) -> Self {
        Self {
            cache: Arc::clone(refresher.cache()),
            mchid: refresher.mchid().to_owned(),
            refresher,
            tolerance_secs,
        }
    }

    /// Accepted clock distance in seconds.
    #[must_use]
    pub const fn tolerance_secs(&self) -> u64 {
        self.tolerance_secs
    }

    /// Verifies a signed envelope.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::TimestampSkew`] if the timestamp is outside the tolerance
    /// - [`WechatPayError::UnknownCertificate`] if no valid certificate matches
    ///   the serial number after one refresh
    /// - [`WechatPayError::SignatureInvalid`] if the signature does not match
    /// - [`WechatPayError::Refresh`] if a needed refresh failed or timed out
    /// - [`WechatPayError::Trust`] if a needed refresh was rejected as forged
    #[instrument(skip(self, envelope), fields(serial_no = %envelope.serial_no, timestamp = envelope.timestamp))]
    pub async fn verify(&self, envelope: &SignedEnvelope) -> Result<VerificationResult> {
        self.verify_at(envelope, Utc::now()).await
    }

    /// Like [`verify`](Self::verify) but folds every failure into the result.
    pub async fn check(&self, envelope: &SignedEnvelope) -> VerificationResult {
        match self.verify(envelope).await {
            Ok(result) => result,
            Err(e) => VerificationResult {
                verified: false,
                serial_no: envelope.serial_no.clone(),
                reason: Some(e.to_string()),
            },
        }
    }

    /// Verifies a transport response.
    ///
    /// # Errors
    ///
    /// [`WechatPayError::InvalidInput`] if signature headers are missing,
    /// otherwise as [`verify`](Self::verify).
    pub async fn verify_response(&self, response: &ApiResponse) -> Result<VerificationResult> {
        self.verify(&SignedEnvelope::from_response(response)?).await
    }

    pub(crate) async fn verify_at(&self, envelope: &SignedEnvelope, now: DateTime<Utc>) -> Result<VerificationResult> {
        let skew = envelope.timestamp.saturating_sub(now.timestamp());
        if skew.unsigned_abs() > self.tolerance_secs {
            audit!(
                AuditEventType::TimestampRejected,
                &self.mchid,
                with_serial_no(envelope.serial_no.clone()),
                with_skew(skew)
            );
            return Err(WechatPayError::TimestampSkew {
                timestamp: envelope.timestamp,
                now: now.timestamp(),
                tolerance_secs: self.tolerance_secs,
            });
        }

        let signature = envelope.signature_bytes()?;
        let certificate = self.certificate_for(&envelope.serial_no, now).await?;

        if let Err(e) = certificate.verify(&envelope.message(), &signature) {
            audit!(
                AuditEventType::SignatureRejected,
                &self.mchid,
                with_serial_no(envelope.serial_no.clone()),
                with_error(e.to_string())
            );
            return Err(e);
        }

        debug!("platform signature verified");
        Ok(VerificationResult { verified: true, serial_no: envelope.serial_no.clone(), reason: None })
    }

    async fn certificate_for(&self, serial_no: &str, now: DateTime<Utc>) -> Result<Arc<PlatformCertificate>> {
        let mut refreshed = false;

        if self.cache.is_stale(now) {
            let observed = self.cache.generation();
            match self.refresher.refresh_since(observed).await {
                Ok(outcome) => refreshed = matches!(outcome, RefreshOutcome::Refreshed { .. }),
                Err(WechatPayError::Refresh(reason)) if !self.cache.is_empty() => {
                    warn!(%reason, "stale certificate set could not be renewed, using cached set");
                }
                Err(e) => return Err(e),
            }
        }

        let observed = self.cache.generation();
        if let Some(certificate) = self.cache.get_at(serial_no, now) {
            return Ok(certificate);
        }
        if !refreshed {
            debug!("unknown serial number, refreshing certificate set");
            self.refresher.refresh_since(observed).await?;
        }

        self.cache.get_at(serial_no, now).ok_or_else(|| {
            audit!(AuditEventType::UnknownCertificate, &self.mchid, with_serial_no(serial_no.to_owned()));
            WechatPayError::UnknownCertificate(serial_no.to_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rsa::{
        RsaPrivateKey,
        pkcs1v15::SigningKey,
        pkcs8::DecodePrivateKey,
        signature::{SignatureEncoding, Signer as _},
    };
    use sha2::Sha256;

    use super::*;
    use crate::{
        crypto::{ApiV3Key, KeyStore, MerchantIdentity, PayloadCipher, Signer},
        transport::ApiRequest,
    };

    const MERCHANT_KEY: &str = include_str!("../../tests/fixtures/merchant_key.pem");
    const PLATFORM_KEY: &str = include_str!("../../tests/fixtures/platform_key.pem");
    const PLATFORM_CERT: &str = include_str!("../../tests/fixtures/platform_cert.pem");
    const PLATFORM_SERIAL: &str = "5157F09EFDC096DE15EBE81A47057A7232F1B8E1";

    /// Transport for tests that must never reach the network.
    #[derive(Debug)]
    struct Unreachable;

    impl Transport for Unreachable {
        async fn execute(&self, _request: ApiRequest) -> Result<ApiResponse> {
            Ok(ApiResponse::new(503, Vec::new(), b"unavailable".to_vec()))
        }

        fn protocol_name(&self) -> &'static str {
            "unreachable"
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn verifier() -> ResponseVerifier<Unreachable> {
        let identity = MerchantIdentity::new("1230000109", "wx888", "444F4864EA9B34415").unwrap();
        let signer = Signer::new(Arc::new(KeyStore::from_pem(identity, MERCHANT_KEY).unwrap()));
        let cipher = Arc::new(PayloadCipher::new(&ApiV3Key::from_text("0123456789abcdef0123456789abcdef").unwrap()));
        let cache = Arc::new(CertificateCache::default());
        let cert = PlatformCertificate::from_pem(PLATFORM_CERT)
            .unwrap()
            .with_validity(now() - Duration::days(1), now() + Duration::days(365));
        cache.replace_all([cert]);

        let refresher = Arc::new(CertificateRefresher::new(
            Arc::new(Unreachable),
            signer,
            cipher,
            cache,
            "https://api.mch.weixin.qq.com",
        ));
        ResponseVerifier::new(refresher, DEFAULT_TIMESTAMP_TOLERANCE_SECS)
    }

    fn signed(timestamp: i64, body: &[u8], serial: &str) -> SignedEnvelope {
        let mut message = format!("{timestamp}\nNONCE123\n").into_bytes();
        message.extend_from_slice(body);
        message.push(b'\n');
        let key = SigningKey::<Sha256>::new(RsaPrivateKey::from_pkcs8_pem(PLATFORM_KEY).unwrap());
        SignedEnvelope {
            timestamp,
            nonce: "NONCE123".to_owned(),
            body: body.to_vec(),
            serial_no: serial.to_owned(),
            signature: base64::engine::general_purpose::STANDARD.encode(key.sign(&message).to_vec()),
        }
    }

    #[test]
    fn test_from_headers_requires_all_headers() {
        let result = SignedEnvelope::from_headers(
            [("Wechatpay-Timestamp", "1"), ("Wechatpay-Nonce", "n"), ("Wechatpay-Signature", "s")],
            Vec::new(),
        );
        assert!(matches!(result, Err(WechatPayError::InvalidInput(msg)) if msg.contains(HEADER_SERIAL)));
    }

    #[test]
    fn test_from_headers_rejects_non_numeric_timestamp() {
        let result = SignedEnvelope::from_headers(
            [
                ("Wechatpay-Timestamp", "yesterday"),
                ("Wechatpay-Nonce", "n"),
                ("Wechatpay-Signature", "s"),
                ("Wechatpay-Serial", "AB"),
            ],
            Vec::new(),
        );
        assert!(matches!(result, Err(WechatPayError::InvalidInput(_))));
    }

    #[test]
    fn test_message_is_canonical() {
        let envelope = signed(1_554_208_460, br#"{"code":"SUCCESS"}"#, PLATFORM_SERIAL);
        assert_eq!(envelope.message(), b"1554208460\nNONCE123\n{\"code\":\"SUCCESS\"}\n");
    }

    #[tokio::test]
    async fn test_valid_signature_verifies() {
        let verifier = verifier();
        let envelope = signed(now().timestamp(), br#"{"code":"SUCCESS"}"#, PLATFORM_SERIAL);

        let result = verifier.verify(&envelope).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.serial_no, PLATFORM_SERIAL);
        assert_eq!(result.reason, None);
    }

    #[tokio::test]
    async fn test_tampered_body_is_signature_invalid() {
        let verifier = verifier();
        let mut envelope = signed(now().timestamp(), br#"{"amount":1}"#, PLATFORM_SERIAL);
        envelope.body = br#"{"amount":9}"#.to_vec();

        assert!(matches!(verifier.verify(&envelope).await, Err(WechatPayError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn test_timestamp_outside_tolerance_rejected_before_lookup() {
        let verifier = verifier();
        let ts = now().timestamp();

        for skewed in [ts - 301, ts + 301] {
            let envelope = signed(skewed, b"{}", "FFFF");
            assert!(matches!(
                verifier.verify(&envelope).await,
                Err(WechatPayError::TimestampSkew { tolerance_secs: 300, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_timestamp_at_tolerance_boundary_accepted() {
        let verifier = verifier();
        let at = now();
        let envelope = signed(at.timestamp() - 300, b"{}", PLATFORM_SERIAL);
        assert!(verifier.verify_at(&envelope, at).await.unwrap().verified);
    }

    #[tokio::test]
    async fn test_unknown_serial_with_failing_refresh_is_refresh_error() {
        let verifier = verifier();
        let envelope = signed(now().timestamp(), b"{}", "ABCDEF");
        assert!(matches!(verifier.verify(&envelope).await, Err(WechatPayError::Refresh(_))));
        // within the cooldown the same failure comes back, not a fatal unknown serial
        assert!(matches!(verifier.verify(&envelope).await, Err(WechatPayError::Refresh(_))));
        assert_eq!(verifier.refresher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_signature_is_signature_invalid() {
        let verifier = verifier();
        let mut envelope = signed(now().timestamp(), b"{}", PLATFORM_SERIAL);
        envelope.signature = "%%% not base64".to_owned();
        assert!(matches!(verifier.verify(&envelope).await, Err(WechatPayError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn test_check_folds_errors() {
        let verifier = verifier();
        let mut envelope = signed(now().timestamp(), b"{}", PLATFORM_SERIAL);
        envelope.body = b"{\"x\":1}".to_vec();

        let result = verifier.check(&envelope).await;
        assert!(!result.verified);
        assert!(result.reason.unwrap().contains("signature"));
    }
}
