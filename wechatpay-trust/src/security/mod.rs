//! Security controls around trust decisions.
//!
//! The audit module records every certificate installation and every
//! rejected message under a dedicated tracing target:
//!
//! ```rust
//! use wechatpay_trust::security::audit::{AuditEvent, AuditEventType, audit_log};
//!
//! let event = AuditEvent::new(AuditEventType::SignatureRejected, "1230000109")
//!     .with_serial_no("5157F09EFDC096DE15EBE81A47057A7232F1B8E1");
//! audit_log(&event);
//! ```
//!
//! Merchant ids are redacted on entry and error messages have long digit
//! runs masked, so audit sinks never receive payer phone or card numbers.

pub mod audit;

pub use audit::{AuditDetails, AuditEvent, AuditEventType, audit_log, redact_identifier, redact_sensitive};
