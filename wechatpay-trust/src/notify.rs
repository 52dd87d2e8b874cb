//! Webhook notifications.
//!
//! A notification is verified before its body is even parsed: the resource
//! is only decrypted once the platform signature over the raw bytes checks
//! out against a trusted certificate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    audit,
    crypto::{EncryptedBlock, PayloadCipher, ResponseVerifier, SignedEnvelope},
    error::{Result, WechatPayError},
    security::audit::AuditEventType,
    transport::Transport,
};

/// The outer notification body, resource still encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Creation time, RFC 3339.
    pub create_time: String,
    /// Event type, e.g. `TRANSACTION.SUCCESS`.
    pub event_type: String,
    /// Resource type, normally `encrypt-resource`.
    pub resource_type: String,
    /// Encrypted resource.
    pub resource: EncryptedBlock,
    /// Human readable summary.
    #[serde(default)]
    pub summary: String,
}

/// A verified notification with its resource decrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedNotification {
    /// Notification id.
    pub id: String,
    /// Creation time, RFC 3339.
    pub create_time: String,
    /// Event type.
    pub event_type: String,
    /// Resource type.
    pub resource_type: String,
    /// Human readable summary.
    pub summary: String,
    /// Decrypted resource.
    pub resource: serde_json::Value,
}

/// Verifies and opens webhook notifications.
pub struct NotificationHandler<T> {
    verifier: Arc<ResponseVerifier<T>>,
    cipher: Arc<PayloadCipher>,
    mchid: String,
}

impl<T> std::fmt::Debug for NotificationHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHandler").field("verifier", &self.verifier).finish_non_exhaustive()
    }
}

impl<T: Transport> NotificationHandler<T> {
    /// Creates a handler.
    #[must_use]
    pub fn new(verifier: Arc<ResponseVerifier<T>>, cipher: Arc<PayloadCipher>, mchid: impl Into<String>) -> Self {
        Self { verifier, cipher, mchid: mchid.into() }
    }

    /// Verifies the notification signature, then decrypts its resource.
    ///
    /// `headers` are the HTTP headers of the callback request and `body` its
    /// raw bytes, unmodified.
    ///
    /// # Errors
    ///
    /// - any [`ResponseVerifier::verify`] error; the body is not decrypted
    /// - [`WechatPayError::InvalidInput`] if the body or the decrypted
    ///   resource is not the expected JSON
    /// - [`WechatPayError::Authentication`] if the resource fails authenticated
    ///   decryption; the message names the notification id
    #[instrument(skip_all)]
    pub async fn open<I, K, V>(&self, headers: I, body: &[u8]) -> Result<DecryptedNotification>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let envelope = SignedEnvelope::from_headers(headers, body.to_vec())?;
        self.verifier.verify(&envelope).await?;

        let notification: Notification = serde_json::from_slice(body)
            .map_err(|e| WechatPayError::InvalidInput(format!("malformed notification: {e}")))?;
        let resource = self.decrypt_resource(&notification)?;

        debug!(id = %notification.id, event_type = %notification.event_type, "notification opened");
        Ok(DecryptedNotification {
            id: notification.id,
            create_time: notification.create_time,
            event_type: notification.event_type,
            resource_type: notification.resource_type,
            summary: notification.summary,
            resource,
        })
    }

    fn decrypt_resource(&self, notification: &Notification) -> Result<serde_json::Value> {
        let plaintext = match self.cipher.decrypt_block(&notification.resource) {
            Ok(plaintext) => plaintext,
            Err(WechatPayError::Authentication(reason)) => {
                audit!(
                    AuditEventType::DecryptionRejected,
                    &self.mchid,
                    with_notification_id(notification.id.clone()),
                    with_error(reason.clone())
                );
                return Err(WechatPayError::Authentication(format!(
                    "notification {}: {reason}",
                    notification.id
                )));
            }
            Err(e) => return Err(e),
        };

        serde_json::from_slice(&plaintext)
            .map_err(|e| WechatPayError::InvalidInput(format!("notification {} resource is not JSON: {e}", notification.id)))
    }
}
