//! In-memory trust store of platform certificates.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Duration, Utc};

use super::PlatformCertificate;

type CertificateMap = HashMap<String, Arc<PlatformCertificate>>;

/// Default renewal window in seconds: refresh once every certificate is
/// within a day of expiry.
pub const DEFAULT_RENEWAL_WINDOW_SECS: i64 = 86_400;

/// Platform certificates keyed by serial number.
///
/// Readers clone an `Arc` of the current map under a short read lock;
/// [`replace_all`](Self::replace_all) builds a complete new map and swaps it
/// in, so a reader sees either the old set or the new one and nothing in
/// between. Every swap bumps [`generation`](Self::generation), which the
/// refresher uses to coalesce concurrent refresh triggers.
#[derive(Debug)]
pub struct CertificateCache {
    certificates: RwLock<Arc<CertificateMap>>,
    generation: AtomicU64,
    renewal_window: Duration,
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_RENEWAL_WINDOW_SECS))
    }
}

impl CertificateCache {
    /// Creates an empty cache with the given renewal window.
    #[must_use]
    pub fn new(renewal_window: Duration) -> Self {
        Self {
            certificates: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            renewal_window,
        }
    }

    fn current(&self) -> Arc<CertificateMap> {
        Arc::clone(&self.certificates.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Looks up a certificate that is valid right now.
    #[must_use]
    pub fn get(&self, serial_no: &str) -> Option<Arc<PlatformCertificate>> {
        self.get_at(serial_no, Utc::now())
    }

    /// Looks up a certificate valid at `now`. Expired entries are never returned.
    #[must_use]
    pub fn get_at(&self, serial_no: &str, now: DateTime<Utc>) -> Option<Arc<PlatformCertificate>> {
        self.current()
            .get(&serial_no.to_ascii_uppercase())
            .filter(|cert| cert.is_valid_at(now))
            .cloned()
    }

    /// Atomically replaces the whole set.
    ///
    /// Later duplicates of a serial number win, so the map holds at most one
    /// certificate per serial.
    pub fn replace_all(&self, certificates: impl IntoIterator<Item = PlatformCertificate>) {
        let next: CertificateMap = certificates
            .into_iter()
            .map(|cert| (cert.serial_no().to_owned(), Arc::new(cert)))
            .collect();

        let mut guard = self.certificates.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// `true` if the cache is empty or every certificate is within the
    /// renewal window of its `not_after`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let certificates = self.current();
        certificates.is_empty()
            || certificates.values().all(|cert| cert.not_after() - self.renewal_window <= now)
    }

    /// Number of completed swaps since construction.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// All certificates currently held, expired ones included, sorted by serial.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<PlatformCertificate>> {
        let mut certificates: Vec<_> = self.current().values().cloned().collect();
        certificates.sort_by(|a, b| a.serial_no().cmp(b.serial_no()));
        certificates
    }

    /// The valid certificate with the latest `not_before`, used for
    /// encrypting sensitive fields.
    #[must_use]
    pub fn newest(&self, now: DateTime<Utc>) -> Option<Arc<PlatformCertificate>> {
        self.current()
            .values()
            .filter(|cert| cert.is_valid_at(now))
            .max_by_key(|cert| cert.not_before())
            .cloned()
    }

    /// Number of certificates held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// `true` if no certificate is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }
}
