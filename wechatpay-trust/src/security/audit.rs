//! Audit logging for trust decisions.
//!
//! Every accepted or rejected certificate set and every rejected message is
//! recorded under the `audit` tracing target, so operators can route these
//! records to a separate sink and alert on tampering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A certificate set was accepted without prior trust (empty cache).
    TrustOnFirstUse,
    /// A certificate set was verified and installed.
    CertificatesRefreshed,
    /// A refresh failed for a transient reason.
    CertificateRefreshFailed,
    /// A certificate listing failed verification; possible tampering.
    TrustViolation,
    /// A message was rejected for timestamp skew.
    TimestampRejected,
    /// A message signature did not verify.
    SignatureRejected,
    /// A message named a serial number the trust store does not hold.
    UnknownCertificate,
    /// Authenticated decryption rejected a payload.
    DecryptionRejected,
}

impl AuditEventType {
    /// Events that indicate reduced trust or possible tampering.
    #[must_use]
    pub const fn is_alert(self) -> bool {
        matches!(self, Self::TrustOnFirstUse | Self::TrustViolation)
    }
}

/// Contextual details of an audit record. Absent fields are not logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDetails {
    /// Certificate serial number involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,
    /// Number of certificates installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_count: Option<usize>,
    /// Webhook notification id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    /// Signed clock difference `timestamp - now`, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_secs: Option<i64>,
    /// Error message, redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audit log entry.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::security::audit::{AuditEvent, AuditEventType, audit_log};
///
/// let event = AuditEvent::new(AuditEventType::UnknownCertificate, "1230000109")
///     .with_serial_no("5157F09EFDC096DE15EBE81A47057A7232F1B8E1");
/// audit_log(&event);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event_type: AuditEventType,
    /// Merchant the event concerns, redacted.
    pub mchid: String,
    /// Correlation id.
    pub request_id: Uuid,
    /// Event details.
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Creates an event. The merchant id is redacted on the way in.
    #[must_use]
    pub fn new(event_type: AuditEventType, mchid: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            mchid: redact_identifier(mchid),
            request_id: Uuid::new_v4(),
            details: AuditDetails::default(),
        }
    }

    /// Adds the certificate serial number.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_serial_no(mut self, serial_no: impl Into<String>) -> Self {
        self.details.serial_no = Some(serial_no.into());
        self
    }

    /// Adds the number of certificates installed.
    #[must_use]
    pub fn with_certificate_count(mut self, count: usize) -> Self {
        self.details.certificate_count = Some(count);
        self
    }

    /// Adds the notification id.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_notification_id(mut self, id: impl Into<String>) -> Self {
        self.details.notification_id = Some(id.into());
        self
    }

    /// Adds the observed clock skew.
    #[must_use]
    pub fn with_skew(mut self, skew_secs: i64) -> Self {
        self.details.skew_secs = Some(skew_secs);
        self
    }

    /// Adds an error message, redacting long digit runs.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.details.error = Some(redact_sensitive(&error.into()));
        self
    }
}

/// Logs an audit event with target `audit`.
///
/// Alert events ([`AuditEventType::is_alert`]) are logged at `warn`, the
/// rest at `info`.
pub fn audit_log(event: &AuditEvent) {
    if event.event_type.is_alert() {
        tracing::warn!(
            target: "audit",
            timestamp = %event.timestamp,
            event_type = ?event.event_type,
            mchid = %event.mchid,
            request_id = %event.request_id,
            details = ?event.details,
            "AUDIT"
        );
    } else {
        tracing::info!(
            target: "audit",
            timestamp = %event.timestamp,
            event_type = ?event.event_type,
            mchid = %event.mchid,
            request_id = %event.request_id,
            details = ?event.details,
            "AUDIT"
        );
    }
}

/// Masks runs of 11 or more digits, which covers phone and bank card numbers.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::security::audit::redact_sensitive;
///
/// let redacted = redact_sensitive("payer 13800138000 rejected");
/// assert_eq!(redacted, "payer *********** rejected");
/// ```
#[must_use]
pub fn redact_sensitive(input: &str) -> String {
    const MIN_RUN: usize = 11;

    let mut result = String::with_capacity(input.len());
    let mut run = String::new();
    let flush = |run: &mut String, result: &mut String| {
        if run.len() >= MIN_RUN {
            result.push_str(&"*".repeat(run.len()));
        } else {
            result.push_str(run);
        }
        run.clear();
    };

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            flush(&mut run, &mut result);
            result.push(ch);
        }
    }
    flush(&mut run, &mut result);
    result
}

/// Keeps the last four characters of an identifier visible.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::security::audit::redact_identifier;
///
/// assert_eq!(redact_identifier("1230000109"), "******0109");
/// assert_eq!(redact_identifier("abc"), "abc");
/// ```
#[must_use]
pub fn redact_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 4 {
        return id.to_owned();
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{visible}", "*".repeat(chars.len() - 4))
}

/// Builds and logs an audit event in one expression.
///
/// # Examples
///
/// ```
/// use wechatpay_trust::{audit, security::audit::AuditEventType};
///
/// audit!(AuditEventType::CertificatesRefreshed, "1230000109");
/// audit!(
///     AuditEventType::TrustViolation,
///     "1230000109",
///     with_serial_no("7E2A9C1B"),
///     with_error("listing signed by an untrusted certificate")
/// );
/// ```
#[macro_export]
macro_rules! audit {
    ($event_type:expr, $mchid:expr) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $mchid)
        )
    };
    ($event_type:expr, $mchid:expr, $($method:ident($arg:expr)),+ $(,)?) => {
        $crate::security::audit::audit_log(
            &$crate::security::audit::AuditEvent::new($event_type, $mchid)
                $(.$method($arg))+
        )
    };
}
