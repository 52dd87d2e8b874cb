//! Platform certificate lifecycle: parse, cache, refresh, persist.
//!
//! The [`CertificateCache`] is the only shared mutable state in the trust
//! layer. [`CertificateRefresher`] is the only writer; verifiers read.

mod cache;
mod certificate;
mod refresher;
mod store;

pub use cache::{CertificateCache, DEFAULT_RENEWAL_WINDOW_SECS};
pub use certificate::PlatformCertificate;
pub use refresher::{
    CERTIFICATES_PATH, CertificateRefresher, DEFAULT_MIN_REFRESH_INTERVAL, DEFAULT_REFRESH_TIMEOUT, RefreshOutcome,
};
pub use store::{CertificateMetadata, CertificateStore};
