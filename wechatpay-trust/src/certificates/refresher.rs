//! Fetching and authenticating the platform certificate set.
//!
//! `GET /v3/certificates` returns every platform certificate currently in
//! service, each AES-GCM encrypted under the APIv3 key. The response itself
//! is signed by one of those certificates:
//!
//! - With a non-empty trust store, the signer must already be trusted. A
//!   listing signed by anything else is rejected with
//!   [`WechatPayError::Trust`] and the cache is left untouched.
//! - With an empty trust store there is nothing to check against. The listing
//!   is accepted after checking it is signed by one of its own certificates,
//!   and the acceptance is audited as trust-on-first-use.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, warn};

use super::{CertificateCache, CertificateStore, PlatformCertificate};
use crate::{
    audit,
    crypto::{DEFAULT_TIMESTAMP_TOLERANCE_SECS, EncryptedBlock, PayloadCipher, SignedEnvelope, Signer},
    error::{Result, WechatPayError},
    security::audit::AuditEventType,
    transport::{ApiRequest, Method, Transport},
};

/// Certificate listing endpoint.
pub const CERTIFICATES_PATH: &str = "/v3/certificates";

/// Default bound on one refresh, lock wait included.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum spacing between lazily triggered refreshes.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct CertificateListing {
    data: Vec<ListedCertificate>,
}

#[derive(Debug, Deserialize)]
struct ListedCertificate {
    serial_no: String,
    effective_time: DateTime<Utc>,
    expire_time: DateTime<Utc>,
    encrypt_certificate: EncryptedBlock,
}

/// What a refresh call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new set was fetched, authenticated and installed.
    Refreshed {
        /// Number of certificates installed.
        certificates: usize,
        /// The set was accepted without prior trust.
        trust_on_first_use: bool,
    },
    /// Another caller installed a new set while this one waited.
    Coalesced,
    /// A lazy refresh was skipped because one succeeded moments ago.
    Throttled,
}

/// The most recent refresh attempt, kept for throttling.
#[derive(Debug)]
struct LastAttempt {
    at: Instant,
    /// Replayed to throttled callers so a transient failure stays retryable.
    failure: Option<WechatPayError>,
}

impl LastAttempt {
    fn started() -> Self {
        Self {
            at: Instant::now(),
            failure: Some(WechatPayError::Refresh("previous certificate refresh did not complete".to_owned())),
        }
    }
}

/// A copy of a refresh failure for replay; anything but `Trust` becomes `Refresh`.
fn replayable(error: &WechatPayError) -> WechatPayError {
    match error {
        WechatPayError::Trust(reason) => WechatPayError::Trust(reason.clone()),
        WechatPayError::Refresh(reason) => WechatPayError::Refresh(reason.clone()),
        other => WechatPayError::Refresh(other.to_string()),
    }
}

/// Keeps the certificate cache in step with the platform.
///
/// All refreshes go through one async mutex. A caller records the cache
/// generation it observed before deciding it needs a refresh; once it holds
/// the lock, a changed generation means someone else already refreshed and
/// the call returns [`RefreshOutcome::Coalesced`] without touching the
/// network. N concurrent callers therefore cause one fetch.
pub struct CertificateRefresher<T> {
    transport: Arc<T>,
    signer: Signer,
    cipher: Arc<PayloadCipher>,
    cache: Arc<CertificateCache>,
    store: Option<CertificateStore>,
    base_url: String,
    timeout: Duration,
    min_interval: Duration,
    timestamp_tolerance_secs: u64,
    last_attempt: Mutex<Option<LastAttempt>>,
    fetch_count: AtomicU64,
}

impl<T> fmt::Debug for CertificateRefresher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRefresher")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("min_interval", &self.min_interval)
            .field("store", &self.store)
            .field("fetch_count", &self.fetch_count)
            .finish_non_exhaustive()
    }
}

impl<T> CertificateRefresher<T> {
    /// The cache this refresher fills.
    #[must_use]
    pub const fn cache(&self) -> &Arc<CertificateCache> {
        &self.cache
    }

    /// Merchant id of the signing identity.
    #[must_use]
    pub fn mchid(&self) -> &str {
        self.signer.keys().identity().mchid()
    }

    /// Number of listing requests sent so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

impl<T: Transport> CertificateRefresher<T> {
    /// Creates a refresher with default timeout and throttling.
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        signer: Signer,
        cipher: Arc<PayloadCipher>,
        cache: Arc<CertificateCache>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            signer,
            cipher,
            cache,
            store: None,
            base_url: base_url.into(),
            timeout: DEFAULT_REFRESH_TIMEOUT,
            min_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            timestamp_tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE_SECS,
            last_attempt: Mutex::new(None),
            fetch_count: AtomicU64::new(0),
        }
    }

    /// Persists every installed set to `store`.
    #[must_use]
    pub fn with_store(mut self, store: CertificateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Bounds each refresh, waiting for the lock included.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Minimum spacing between lazy refreshes.
    #[must_use]
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Accepted clock distance for the listing response.
    #[must_use]
    pub fn with_timestamp_tolerance(mut self, secs: u64) -> Self {
        self.timestamp_tolerance_secs = secs;
        self
    }

    /// Fetches and installs the current set now.
    ///
    /// Coalesces with a refresh already in flight but ignores throttling.
    ///
    /// # Errors
    ///
    /// - [`WechatPayError::Refresh`] on transport failure, non-2xx answer,
    ///   malformed listing or timeout; retry with backoff
    /// - [`WechatPayError::Trust`] if the listing is not signed by a trusted
    ///   certificate or its contents do not match; do not retry
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let observed = self.cache.generation();
        self.run(observed, true).await
    }

    /// Refreshes unless the cache moved past `observed_generation` or a
    /// refresh ran within the minimum interval.
    ///
    /// Within the interval a successful previous attempt yields
    /// [`RefreshOutcome::Throttled`] and a failed one is reported again
    /// without touching the network.
    ///
    /// # Errors
    ///
    /// Same as [`refresh`](Self::refresh), including the failure of a
    /// previous attempt within the minimum interval.
    pub async fn refresh_since(&self, observed_generation: u64) -> Result<RefreshOutcome> {
        self.run(observed_generation, false).await
    }

    async fn run(&self, observed: u64, forced: bool) -> Result<RefreshOutcome> {
        let attempt = async {
            let mut last_attempt = self.last_attempt.lock().await;
            if self.cache.generation() != observed {
                debug!("certificate set changed while waiting, sharing result");
                return Ok(RefreshOutcome::Coalesced);
            }
            if !forced
                && let Some(last) = last_attempt.as_ref()
                && last.at.elapsed() < self.min_interval
            {
                debug!(failed = last.failure.is_some(), "refresh throttled");
                return match &last.failure {
                    Some(failure) => Err(replayable(failure)),
                    None => Ok(RefreshOutcome::Throttled),
                };
            }
            // Recorded as failed until it finishes, so a timeout is replayed too.
            let at = last_attempt.insert(LastAttempt::started()).at;
            let result = self.fetch_and_install().await;
            *last_attempt = Some(LastAttempt { at, failure: result.as_ref().err().map(replayable) });
            result
        };

        if let Ok(result) = tokio::time::timeout(self.timeout, attempt).await {
            result
        } else {
            let reason = format!("certificate refresh did not finish within {}s", self.timeout.as_secs());
            audit!(AuditEventType::CertificateRefreshFailed, self.mchid(), with_error(reason.clone()));
            Err(WechatPayError::Refresh(reason))
        }
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch_and_install(&self) -> Result<RefreshOutcome> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);

        let (certificates, trust_on_first_use, signer_serial) = match self.fetch().await {
            Ok(fetched) => fetched,
            Err(e) => {
                let event = if matches!(e, WechatPayError::Trust(_)) {
                    AuditEventType::TrustViolation
                } else {
                    AuditEventType::CertificateRefreshFailed
                };
                audit!(event, self.mchid(), with_error(e.to_string()));
                return Err(e);
            }
        };

        let count = certificates.len();
        if trust_on_first_use {
            audit!(
                AuditEventType::TrustOnFirstUse,
                self.mchid(),
                with_serial_no(signer_serial),
                with_certificate_count(count)
            );
        }

        self.cache.replace_all(certificates);
        if let Some(store) = &self.store {
            self.persist(store.clone()).await;
        }

        audit!(AuditEventType::CertificatesRefreshed, self.mchid(), with_certificate_count(count));
        info!(certificates = count, trust_on_first_use, "platform certificates refreshed");
        Ok(RefreshOutcome::Refreshed { certificates: count, trust_on_first_use })
    }

    async fn persist(&self, store: CertificateStore) {
        let snapshot = self.cache.snapshot();
        let dir = store.dir().display().to_string();
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => debug!(%dir, "platform certificates persisted"),
            Ok(Err(e)) => warn!(%dir, error = %e, "failed to persist platform certificates"),
            Err(e) => warn!(%dir, error = %e, "certificate persistence task failed"),
        }
    }

    async fn fetch(&self) -> Result<(Vec<PlatformCertificate>, bool, String)> {
        let now = Utc::now();
        // Expired entries cannot vouch for anything, so only valid ones count.
        let bootstrap = self.cache.newest(now).is_none();

        let authorization = self.signer.authorize(Method::Get.as_str(), CERTIFICATES_PATH, b"")?;
        let request = ApiRequest::new(Method::Get, self.base_url.clone(), CERTIFICATES_PATH)
            .header("Authorization", authorization.header);

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|e| WechatPayError::Refresh(format!("certificate request failed: {e}")))?;
        if !response.is_success() {
            return Err(WechatPayError::Refresh(format!(
                "certificate endpoint returned status {}: {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            )));
        }

        let envelope = SignedEnvelope::from_response(&response)
            .map_err(|e| WechatPayError::Trust(format!("unsigned certificate listing: {e}")))?;
        let skew = envelope.timestamp.saturating_sub(now.timestamp());
        if skew.unsigned_abs() > self.timestamp_tolerance_secs {
            return Err(WechatPayError::Trust(format!("certificate listing timestamp is {skew}s off")));
        }

        if !bootstrap {
            let trusted = self.cache.get_at(&envelope.serial_no, now).ok_or_else(|| {
                WechatPayError::Trust(format!(
                    "certificate listing signed by untrusted certificate {}",
                    envelope.serial_no
                ))
            })?;
            envelope
                .verify_with(&trusted)
                .map_err(|e| WechatPayError::Trust(format!("certificate listing signature rejected: {e}")))?;
        }

        let listing: CertificateListing = serde_json::from_slice(&response.body)
            .map_err(|e| WechatPayError::Refresh(format!("malformed certificate listing: {e}")))?;
        if listing.data.is_empty() {
            return Err(WechatPayError::Refresh("certificate listing is empty".to_owned()));
        }

        let certificates = listing
            .data
            .into_iter()
            .map(|entry| self.open(entry))
            .collect::<Result<Vec<_>>>()?;

        if bootstrap {
            let own = certificates
                .iter()
                .find(|cert| cert.serial_no() == envelope.serial_no)
                .ok_or_else(|| {
                    WechatPayError::Trust(format!(
                        "bootstrap listing signed by {} which it does not contain",
                        envelope.serial_no
                    ))
                })?;
            envelope
                .verify_with(own)
                .map_err(|e| WechatPayError::Trust(format!("bootstrap listing signature rejected: {e}")))?;
        }

        Ok((certificates, bootstrap, envelope.serial_no))
    }

    /// Decrypts one listed certificate and checks it is what the listing says.
    fn open(&self, entry: ListedCertificate) -> Result<PlatformCertificate> {
        let listed_serial = entry.serial_no.trim().to_ascii_uppercase();
        let plaintext = self.cipher.decrypt_block(&entry.encrypt_certificate).map_err(|e| {
            WechatPayError::Trust(format!("cannot decrypt certificate {listed_serial}: {e}"))
        })?;
        let pem = String::from_utf8(plaintext)
            .map_err(|_| WechatPayError::Trust(format!("certificate {listed_serial} is not PEM text")))?;
        let certificate = PlatformCertificate::from_pem(&pem)
            .map_err(|e| WechatPayError::Trust(format!("certificate {listed_serial}: {e}")))?;

        if certificate.serial_no() != listed_serial {
            return Err(WechatPayError::Trust(format!(
                "certificate listed as {listed_serial} has serial number {}",
                certificate.serial_no()
            )));
        }
        Ok(certificate.with_validity(entry.effective_time, entry.expire_time))
    }
}

impl<T: Transport + 'static> CertificateRefresher<T> {
    /// Refreshes on a fixed interval in the background.
    ///
    /// The first refresh happens one `interval` after the call. Failures are
    /// logged and the loop keeps going; abort the handle to stop it.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match refresher.refresh().await {
                    Ok(outcome) => debug!(?outcome, "periodic certificate refresh"),
                    Err(e) => warn!(error = %e, retryable = e.is_retryable(), "periodic certificate refresh failed"),
                }
            }
        })
    }
}
