use crate::types::AcmeResult;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use x509_parser::pem::parse_x509_pem;

const FULLCHAIN_FILE: &str = "fullchain.pem";
const KEY_FILE: &str = "key.pem";

/// State of the installed certificate for a zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskState {
    Missing,
    Unreadable(String),
    Valid { expires_at: DateTime<Utc> },
}

impl DiskState {
    /// Whether the file on disk calls for a renewal regardless of the registry
    pub fn needs_renewal(&self, now: DateTime<Utc>, lead: Duration) -> bool {
        match self {
            Self::Missing | Self::Unreadable(_) => true,
            Self::Valid { expires_at } => *expires_at - now <= lead,
        }
    }
}

/// Installed wildcard certificates, one directory per zone
pub struct CertificateStore {
    base_path: PathBuf,
}

impl CertificateStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn zone_dir(&self, zone: &str) -> PathBuf {
        self.base_path.join(zone)
    }

    pub fn fullchain_path(&self, zone: &str) -> PathBuf {
        self.zone_dir(zone).join(FULLCHAIN_FILE)
    }

    pub fn key_path(&self, zone: &str) -> PathBuf {
        self.zone_dir(zone).join(KEY_FILE)
    }

    /// Create the zone directory before the ACME client installs into it
    pub fn prepare_zone(&self, zone: &str) -> AcmeResult<()> {
        fs::create_dir_all(self.zone_dir(zone))?;
        Ok(())
    }

    /// Check if certificate and key files exist
    pub fn cert_exists(&self, zone: &str) -> bool {
        self.fullchain_path(zone).is_file() && self.key_path(zone).is_file()
    }

    /// Read the expiry of the leaf certificate in the full chain
    pub fn inspect(&self, zone: &str) -> DiskState {
        if !self.cert_exists(zone) {
            return DiskState::Missing;
        }

        let pem = match fs::read(self.fullchain_path(zone)) {
            Ok(bytes) => bytes,
            Err(e) => return DiskState::Unreadable(e.to_string()),
        };

        match read_not_after(&pem) {
            Ok(expires_at) => DiskState::Valid { expires_at },
            Err(reason) => DiskState::Unreadable(reason),
        }
    }
}

fn read_not_after(pem: &[u8]) -> Result<DateTime<Utc>, String> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| format!("invalid PEM: {}", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| format!("invalid X509 certificate: {}", e))?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| format!("certificate expiry out of range: {}", timestamp))
}
