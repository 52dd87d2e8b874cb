//! Merchant-side signatures: APIv3 `Authorization` headers and `paySign`.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use rsa::signature::{SignatureEncoding, Signer as _};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    crypto::keys::KeyStore,
    error::{Result, WechatPayError},
};

/// Authorization scheme announced in every signed request.
pub const AUTH_SCHEME: &str = "WECHATPAY2-SHA256-RSA2048";

/// A signed `Authorization` header together with the values that went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Full header value, scheme included.
    pub header: String,
    /// Unix timestamp (seconds) covered by the signature.
    pub timestamp: i64,
    /// Random nonce covered by the signature.
    pub nonce: String,
    /// Base64 signature.
    pub signature: String,
}

/// Builds the canonical string: every field followed by `\n`.
///
/// Signer and verifier must agree on this byte for byte.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::crypto::build_message;
///
/// assert_eq!(build_message(&["GET", "/v3/certificates"]), "GET\n/v3/certificates\n");
/// ```
#[must_use]
pub fn build_message<S: AsRef<str>>(fields: &[S]) -> String {
    let mut message = fields.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("\n");
    message.push('\n');
    message
}

/// Generates a request nonce: 32 upper-case hex characters from a UUID v4.
#[must_use]
pub fn generate_nonce() -> String {
    Uuid::new_v4().simple().to_string().to_ascii_uppercase()
}

/// Signs outgoing requests and client payment parameters.
///
/// Cheap to clone; the key store is shared.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use wechatpay_trust::crypto::{KeyStore, MerchantIdentity, Signer};
///
/// # fn example(pem: &str) -> wechatpay_trust::Result<()> {
/// let identity = MerchantIdentity::new("1230000109", "wx888", "444F4864EA9B34415")?;
/// let signer = Signer::new(Arc::new(KeyStore::from_pem(identity, pem)?));
///
/// let pay_sign = signer.sign_to_base64(&[
///     "wx888",
///     "1414561699",
///     "5K8264ILTKCH16CQ2502S",
///     "prepay_id=wx20141027",
/// ])?;
/// println!("paySign: {pay_sign}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Signer {
    keys: Arc<KeyStore>,
}

impl Signer {
    /// Creates a signer over the merchant key store.
    #[must_use]
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    /// The key store this signer uses.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Signs the canonical form of `fields` and returns the raw signature.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn sign<S: AsRef<str>>(&self, fields: &[S]) -> Result<Vec<u8>> {
        self.sign_bytes(build_message(fields).as_bytes())
    }

    /// Same as [`sign`](Self::sign), base64 encoded as the platform expects.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn sign_to_base64<S: AsRef<str>>(&self, fields: &[S]) -> Result<String> {
        let signature = self.sign(fields)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(signature))
    }

    /// Signs an already assembled message with RSASSA-PKCS1-v1_5 / SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn sign_bytes(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .keys
            .signing_key()
            .try_sign(message)
            .map_err(|e| WechatPayError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Computes `paySign` for front-end payment widgets.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    pub fn pay_sign(&self, appid: &str, timestamp: &str, nonce: &str, package: &str) -> Result<String> {
        self.sign_to_base64(&[appid, timestamp, nonce, package])
    }

    /// Builds the `Authorization` header for an APIv3 request.
    ///
    /// `canonical_url` is the absolute path plus query string, e.g.
    /// `/v3/pay/transactions/id/1217752501201407033233368018?mchid=1230000109`.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Signing`] if the RSA primitive fails.
    #[instrument(skip(self, body), fields(method, canonical_url, body_len = body.len()))]
    pub fn authorize(&self, method: &str, canonical_url: &str, body: &[u8]) -> Result<Authorization> {
        self.authorize_with(method, canonical_url, body, Utc::now().timestamp(), generate_nonce())
    }

    pub(crate) fn authorize_with(
        &self,
        method: &str,
        canonical_url: &str,
        body: &[u8],
        timestamp: i64,
        nonce: String,
    ) -> Result<Authorization> {
        let timestamp_str = timestamp.to_string();
        let mut message = build_message(&[method, canonical_url, &timestamp_str, &nonce]).into_bytes();
        message.extend_from_slice(body);
        message.push(b'\n');

        let signature = base64::engine::general_purpose::STANDARD.encode(self.sign_bytes(&message)?);
        let identity = self.keys.identity();
        let header = format!(
            "{AUTH_SCHEME} mchid=\"{}\",nonce_str=\"{nonce}\",signature=\"{signature}\",\
             timestamp=\"{timestamp}\",serial_no=\"{}\"",
            identity.mchid(),
            identity.cert_serial_no(),
        );

        Ok(Authorization { header, timestamp, nonce, signature })
    }
}

#[cfg(test)]
mod tests {
    use rsa::{
        pkcs1v15::{Signature, VerifyingKey},
        signature::Verifier,
    };
    use sha2::Sha256;

    use super::*;
    use crate::crypto::keys::MerchantIdentity;

    const MERCHANT_KEY: &str = include_str!("../../tests/fixtures/merchant_key.pem");

    fn signer() -> Signer {
        let identity =
            MerchantIdentity::new("1230000109", "wx888", "444F4864EA9B34415").unwrap();
        Signer::new(Arc::new(KeyStore::from_pem(identity, MERCHANT_KEY).unwrap()))
    }

    fn verify(signer: &Signer, message: &[u8], signature: &[u8]) -> bool {
        let key = VerifyingKey::<Sha256>::new(signer.keys().public_key());
        let signature = Signature::try_from(signature).unwrap();
        key.verify(message, &signature).is_ok()
    }

    #[test]
    fn test_build_message_appends_trailing_newline() {
        assert_eq!(build_message(&["a", "b", "c"]), "a\nb\nc\n");
        assert_eq!(build_message(&["only"]), "only\n");
        assert_eq!(build_message::<&str>(&[]), "\n");
    }

    #[test]
    fn test_build_message_keeps_empty_fields() {
        assert_eq!(build_message(&["GET", "/v3/x", ""]), "GET\n/v3/x\n\n");
    }

    #[test]
    fn test_generate_nonce_format() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_pay_sign_verifies_with_merchant_public_key() {
        let signer = signer();
        let fields = ["wx888", "1414561699", "5K8264ILTKCH16CQ2502S", "prepay_id=wx20141027"];

        let signature = signer.sign(&fields).unwrap();
        assert!(verify(&signer, build_message(&fields).as_bytes(), &signature));
    }

    #[test]
    fn test_pay_sign_matches_sign_to_base64() {
        let signer = signer();
        let a = signer.pay_sign("wx888", "1414561699", "NONCE", "prepay_id=wx1").unwrap();
        let b = signer
            .sign_to_base64(&["wx888", "1414561699", "NONCE", "prepay_id=wx1"])
            .unwrap();
        // PKCS#1 v1.5 is deterministic
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_does_not_cover_other_messages() {
        let signer = signer();
        let signature = signer.sign(&["wx888", "1"]).unwrap();
        assert!(!verify(&signer, build_message(&["wx888", "2"]).as_bytes(), &signature));
    }

    #[test]
    fn test_authorization_header_format() {
        let signer = signer();
        let auth = signer
            .authorize_with("GET", "/v3/certificates", b"", 1_554_208_460, "593BEC0C930BF1AFEB40B4A08C8FB242".to_owned())
            .unwrap();

        assert!(auth.header.starts_with("WECHATPAY2-SHA256-RSA2048 mchid=\"1230000109\","));
        assert!(auth.header.contains("nonce_str=\"593BEC0C930BF1AFEB40B4A08C8FB242\""));
        assert!(auth.header.contains(&format!("signature=\"{}\"", auth.signature)));
        assert!(auth.header.contains("timestamp=\"1554208460\""));
        assert!(auth.header.ends_with("serial_no=\"444F4864EA9B34415\""));
    }

    #[test]
    fn test_authorization_signature_covers_request_line_and_body() {
        let signer = signer();
        let body = br#"{"appid":"wx888","mchid":"1230000109"}"#;
        let auth = signer
            .authorize_with("POST", "/v3/pay/transactions/jsapi", body, 1_554_208_460, "N1".to_owned())
            .unwrap();

        let mut expected = b"POST\n/v3/pay/transactions/jsapi\n1554208460\nN1\n".to_vec();
        expected.extend_from_slice(body);
        expected.push(b'\n');

        let raw = base64::engine::general_purpose::STANDARD.decode(&auth.signature).unwrap();
        assert!(verify(&signer, &expected, &raw));
    }

    #[test]
    fn test_authorize_uses_fresh_nonce() {
        let signer = signer();
        let first = signer.authorize("GET", "/v3/certificates", b"").unwrap();
        let second = signer.authorize("GET", "/v3/certificates", b"").unwrap();
        assert_ne!(first.nonce, second.nonce);
    }
}
