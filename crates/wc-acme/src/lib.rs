//! Wildcard certificate provisioning
//!
//! Derives the DNS zone of every active domain, keeps one certificate
//! lifecycle row per zone and drives acme.sh (DNS-01) to issue and install
//! `<zone>` + `*.<zone>` certificates when a zone is due.

mod db;
mod domains;
mod engine;
pub mod provider;
mod registry;
mod runner;
mod storage;
pub mod types;
pub mod zone;

pub use db::Database;
pub use domains::DomainStore;
pub use engine::{
    InvalidDomain, ProvisioningEngine, ReloadOutcome, RunReport, ZoneOutcome, ZoneResult, decide,
};
pub use provider::ProviderSlug;
pub use registry::CertificateZoneRegistry;
pub use runner::{CommandRunner, ProcessOutput, TokioCommandRunner, find_executable};
pub use storage::{CertificateStore, DiskState};
pub use types::{
    AcmeError, AcmeResult, CertificateZone, DomainRecord, EngineConfig, RenewalDecision,
    ZoneStatus,
};
pub use zone::{ZoneResolver, normalize_host};
