use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::provider::ProviderSlug;

/// Configuration for the provisioning engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// ACME client binary (acme.sh)
    pub acme_bin: String,
    /// Provider assigned to zones on first sighting
    pub provider: ProviderSlug,
    /// Wildcard flag assigned to zones on first sighting
    pub wildcard_enabled: bool,
    /// Root directory holding one subdirectory per zone
    pub cert_dir: PathBuf,
    /// Days between issuance and the next renewal
    pub renewal_period_days: u32,
    /// Renew early when the installed certificate expires within this many days
    pub renewal_lead_days: u32,
    /// Upper bound for a single ACME client invocation
    pub process_timeout: std::time::Duration,
    /// Optional `--server` argument
    pub acme_server: Option<String>,
    /// Reload command run after at least one successful install
    pub reload_command: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acme_bin: "acme.sh".to_string(),
            provider: ProviderSlug::default(),
            wildcard_enabled: true,
            cert_dir: PathBuf::from("/etc/nginx/wildcard-certs"),
            renewal_period_days: 60,
            renewal_lead_days: 30,
            process_timeout: std::time::Duration::from_secs(300),
            acme_server: None,
            reload_command: None,
        }
    }
}

impl EngineConfig {
    pub fn renewal_period(&self) -> Duration {
        Duration::days(i64::from(self.renewal_period_days))
    }

    pub fn renewal_lead(&self) -> Duration {
        Duration::days(i64::from(self.renewal_lead_days))
    }

    /// How long a claimed zone stays locked against concurrent runs
    pub fn claim_lease(&self) -> Duration {
        let secs = self.process_timeout.as_secs().saturating_mul(3).max(60);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

/// Lifecycle state of a certificate zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Pending,
    Queued,
    Issued,
    Error,
}

impl ZoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Issued => "issued",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "issued" => Ok(Self::Issued),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown zone status '{}'", other)),
        }
    }
}

/// One row of `certificate_zones`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateZone {
    pub zone: String,
    pub provider: String,
    pub wildcard_enabled: bool,
    pub status: ZoneStatus,
    pub last_issued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_renewal_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
}

impl CertificateZone {
    /// Whether the registry considers this zone due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ZoneStatus::Pending | ZoneStatus::Queued | ZoneStatus::Error => true,
            ZoneStatus::Issued => self.next_renewal_after.is_none_or(|next| now >= next),
        }
    }
}

/// One row of `domains`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub host: String,
    pub normalized_host: String,
    pub zone: String,
    pub namespace: Option<String>,
    pub label: Option<String>,
    pub is_active: bool,
}

/// What a maintenance pass does with a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenewalDecision {
    Skip,
    RenewWindowReached,
    RenewQueued,
}

impl RenewalDecision {
    pub fn is_renewal(&self) -> bool {
        !matches!(self, Self::Skip)
    }

    /// Reason shown in the `Renewing <zone> (...)` log line
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::RenewWindowReached => "window reached",
            Self::RenewQueued => "queued",
        }
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Unsupported DNS provider: {0}")]
    UnsupportedProvider(String),

    #[error("ACME client exited with status {exit_code:?}: {output}")]
    ExternalProcess {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("{program} timed out after {secs}s")]
    ProcessTimeout { program: String, secs: u64 },

    #[error("Failed to execute {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ACME client binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Certificate zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AcmeError {
    /// Errors after which a run cannot safely continue with other zones
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_)
                | Self::BinaryNotFound(_)
                | Self::Config(_)
                | Self::UnsupportedProvider(_)
        )
    }
}

pub type AcmeResult<T> = Result<T, AcmeError>;
