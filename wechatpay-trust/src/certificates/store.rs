//! On-disk persistence of trusted platform certificates.
//!
//! Layout, one pair per serial number:
//!
//! ```text
//! <dir>/<serial>.pem    PEM certificate as decrypted from the listing
//! <dir>/<serial>.json   {"serial_no", "effective_time", "expire_time"}
//! ```
//!
//! A pre-seeded directory doubles as an out-of-band pin: a client that starts
//! with a non-empty cache never takes the trust-on-first-use path.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::PlatformCertificate;
use crate::error::{Result, WechatPayError};

/// Sidecar metadata written next to each certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    /// Serial number, upper-case hex.
    pub serial_no: String,
    /// Start of validity as listed by the platform.
    pub effective_time: DateTime<Utc>,
    /// End of validity as listed by the platform.
    pub expire_time: DateTime<Utc>,
}

/// Directory-backed certificate store.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Uses `dir` as the store. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every certificate still valid at `now`.
    ///
    /// Expired, unreadable or inconsistent entries are skipped with a warning.
    /// A missing directory yields an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Io`] if the directory exists but cannot be listed.
    pub fn load(&self, now: DateTime<Utc>) -> Result<Vec<PlatformCertificate>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut certificates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.load_entry(&path) {
                Ok(cert) if cert.not_after() > now => certificates.push(cert),
                Ok(cert) => debug!(serial_no = cert.serial_no(), "skipping expired stored certificate"),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable stored certificate"),
            }
        }
        certificates.sort_by(|a, b| a.serial_no().cmp(b.serial_no()));
        Ok(certificates)
    }

    fn load_entry(&self, metadata_path: &Path) -> Result<PlatformCertificate> {
        let metadata: CertificateMetadata = serde_json::from_slice(&fs::read(metadata_path)?)
            .map_err(|e| WechatPayError::InvalidInput(format!("invalid certificate metadata: {e}")))?;
        let serial = checked_serial(&metadata.serial_no)?;

        let pem = fs::read_to_string(self.dir.join(format!("{serial}.pem")))?;
        let cert = PlatformCertificate::from_pem(&pem)?;
        if cert.serial_no() != serial {
            return Err(WechatPayError::InvalidInput(format!(
                "stored certificate {} is filed under serial {serial}",
                cert.serial_no()
            )));
        }
        Ok(cert.with_validity(metadata.effective_time, metadata.expire_time))
    }

    /// Writes the given set and removes entries for serials no longer in it.
    ///
    /// Certificates without PEM text are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WechatPayError::Io`] if the directory cannot be written.
    pub fn save(&self, certificates: &[Arc<PlatformCertificate>]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut kept = HashSet::new();
        for cert in certificates {
            let Some(pem) = cert.pem() else {
                continue;
            };
            let serial = checked_serial(cert.serial_no())?;
            let metadata = CertificateMetadata {
                serial_no: serial.clone(),
                effective_time: cert.not_before(),
                expire_time: cert.not_after(),
            };
            let json = serde_json::to_vec_pretty(&metadata)
                .map_err(|e| WechatPayError::InvalidInput(format!("cannot encode metadata: {e}")))?;

            fs::write(self.dir.join(format!("{serial}.pem")), format!("{pem}\n"))?;
            fs::write(self.dir.join(format!("{serial}.json")), json)?;
            kept.insert(serial);
        }

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_ours = path.extension().is_some_and(|ext| ext == "pem" || ext == "json");
            let stem = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned);
            if let Some(stem) = stem
                && is_ours
                && !kept.contains(&stem)
            {
                debug!(path = %path.display(), "removing certificate no longer served");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Serials become file names, so only hex is accepted.
fn checked_serial(serial: &str) -> Result<String> {
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WechatPayError::InvalidInput(format!("invalid serial number {serial:?}")));
    }
    Ok(serial.to_ascii_uppercase())
}
