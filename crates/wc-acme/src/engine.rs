use crate::db::Database;
use crate::domains::DomainStore;
use crate::provider::{self, ProviderSlug};
use crate::registry::CertificateZoneRegistry;
use crate::runner::CommandRunner;
use crate::storage::{CertificateStore, DiskState};
use crate::types::{
    AcmeError, AcmeResult, CertificateZone, EngineConfig, RenewalDecision, ZoneStatus,
};
use crate::zone::ZoneResolver;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Decide what to do with a zone.
///
/// The registry drives the decision; `disk` (only consulted for issued zones
/// whose window is still open) can pull a renewal forward when the installed
/// certificate is gone or about to expire.
pub fn decide(
    zone: &CertificateZone,
    now: DateTime<Utc>,
    disk: Option<&DiskState>,
    lead: Duration,
) -> RenewalDecision {
    match zone.status {
        ZoneStatus::Queued => RenewalDecision::RenewQueued,
        ZoneStatus::Pending | ZoneStatus::Error => RenewalDecision::RenewWindowReached,
        ZoneStatus::Issued => match zone.next_renewal_after {
            Some(next) if now < next => {
                if disk.is_some_and(|state| state.needs_renewal(now, lead)) {
                    RenewalDecision::RenewWindowReached
                } else {
                    RenewalDecision::Skip
                }
            }
            _ => RenewalDecision::RenewWindowReached,
        },
    }
}

/// Result of one zone in a maintenance pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ZoneResult {
    Skipped,
    Issued { next_renewal_after: DateTime<Utc> },
    Failed { message: String },
    /// Another run holds the zone
    Busy,
    /// Shutdown requested before the zone was reached
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneOutcome {
    pub zone: String,
    pub decision: Option<RenewalDecision>,
    #[serde(flatten)]
    pub result: ZoneResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidDomain {
    pub host: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Reloaded,
    Failed { message: String },
}

/// Everything that happened in one pass, one entry per zone
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<ZoneOutcome>,
    pub invalid_domains: Vec<InvalidDomain>,
    pub reload: Option<ReloadOutcome>,
}

impl RunReport {
    pub fn outcome(&self, zone: &str) -> Option<&ZoneOutcome> {
        self.outcomes.iter().find(|o| o.zone == zone)
    }

    pub fn issued(&self) -> usize {
        self.count(|r| matches!(r, ZoneResult::Issued { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, ZoneResult::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r, ZoneResult::Skipped))
    }

    fn count(&self, pred: impl Fn(&ZoneResult) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.result)).count()
    }
}

/// Reconciles active zones against their certificate state
pub struct ProvisioningEngine {
    config: EngineConfig,
    registry: CertificateZoneRegistry,
    domains: DomainStore,
    resolver: ZoneResolver,
    certs: CertificateStore,
    runner: Arc<dyn CommandRunner>,
}

impl ProvisioningEngine {
    pub fn new(
        config: EngineConfig,
        db: &Database,
        resolver: ZoneResolver,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let certs = CertificateStore::new(&config.cert_dir);
        Self {
            registry: db.registry(),
            domains: db.domains(),
            config,
            resolver,
            certs,
            runner,
        }
    }

    pub fn registry(&self) -> &CertificateZoneRegistry {
        &self.registry
    }

    pub fn domains(&self) -> &DomainStore {
        &self.domains
    }

    pub fn resolver(&self) -> &ZoneResolver {
        &self.resolver
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certs
    }

    /// Provider assigned to newly registered zones
    pub fn provider(&self) -> ProviderSlug {
        self.config.provider
    }

    /// Force renewal of the zone `host` belongs to on the next run
    pub fn queue(&self, host: &str) -> AcmeResult<String> {
        let zone = self.resolver.derive_zone(host)?;
        self.registry
            .ensure_zone(&zone, self.config.provider, self.config.wildcard_enabled)?;
        self.registry.mark_queued(&zone)?;
        info!(zone = %zone, provider = %self.config.provider, "Queued certificate renewal");
        Ok(zone)
    }

    /// Ensure a registry row for every zone of an active domain
    pub fn backfill(&self) -> AcmeResult<usize> {
        self.registry
            .backfill_active_domains(self.config.provider, self.config.wildcard_enabled)
    }

    /// One maintenance pass without external cancellation
    pub async fn run(&self, now: DateTime<Utc>) -> AcmeResult<RunReport> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_until(now, shutdown_rx).await
    }

    /// One maintenance pass; zones not yet started when `shutdown` flips are left untouched.
    ///
    /// Per-zone failures end up in the report; only systemic errors
    /// (store unreachable, ACME client missing) abort the pass.
    pub async fn run_until(
        &self,
        now: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> AcmeResult<RunReport> {
        self.runner.check_available(&self.config.acme_bin).await?;

        let mut report = RunReport::default();
        let zones = self.collect_zones(&mut report)?;
        info!(zones = zones.len(), "Starting certificate maintenance");

        for zone in &zones {
            if *shutdown.borrow() {
                debug!(zone = %zone, "Shutdown requested, leaving zone untouched");
                report.outcomes.push(ZoneOutcome {
                    zone: zone.clone(),
                    decision: None,
                    result: ZoneResult::Cancelled,
                });
                continue;
            }

            let outcome = self.process_zone(zone, now).await?;
            report.outcomes.push(outcome);
        }

        if report.issued() > 0 {
            report.reload = self.reload().await;
        }

        info!(
            issued = report.issued(),
            failed = report.failed(),
            skipped = report.skipped(),
            invalid_domains = report.invalid_domains.len(),
            "Certificate maintenance finished"
        );
        Ok(report)
    }

    /// Zones of active domains plus explicitly queued zones, sorted
    fn collect_zones(&self, report: &mut RunReport) -> AcmeResult<BTreeSet<String>> {
        let mut zones = BTreeSet::new();

        for domain in self.domains.list_active()? {
            match self.resolver.derive_zone(&domain.normalized_host) {
                Ok(zone) => {
                    if zone != domain.zone {
                        debug!(
                            host = %domain.normalized_host,
                            stored = %domain.zone,
                            derived = %zone,
                            "Stored zone differs from derived zone"
                        );
                    }
                    zones.insert(zone);
                }
                Err(e) => {
                    warn!(host = %domain.host, error = %e, "Skipping domain with invalid host");
                    report.invalid_domains.push(InvalidDomain {
                        host: domain.host,
                        error: e.to_string(),
                    });
                }
            }
        }

        for zone in &zones {
            self.registry
                .ensure_zone(zone, self.config.provider, self.config.wildcard_enabled)?;
        }

        for queued in self
            .registry
            .list_all()?
            .into_iter()
            .filter(|z| z.status == ZoneStatus::Queued)
        {
            zones.insert(queued.zone);
        }

        Ok(zones)
    }

    async fn process_zone(&self, zone: &str, now: DateTime<Utc>) -> AcmeResult<ZoneOutcome> {
        let outcome = |decision, result| ZoneOutcome {
            zone: zone.to_string(),
            decision,
            result,
        };

        let Some(record) = self.registry.get(zone)? else {
            warn!(zone = %zone, "Certificate zone vanished during run");
            return Ok(outcome(None, ZoneResult::Skipped));
        };

        if !record.wildcard_enabled {
            info!(zone = %zone, "Skipping {} (wildcard disabled)", zone);
            return Ok(outcome(Some(RenewalDecision::Skip), ZoneResult::Skipped));
        }

        let disk = (record.status == ZoneStatus::Issued).then(|| self.certs.inspect(zone));
        let decision = decide(&record, now, disk.as_ref(), self.config.renewal_lead());

        if !decision.is_renewal() {
            info!(zone = %zone, "Skipping {}", zone);
            return Ok(outcome(Some(decision), ZoneResult::Skipped));
        }

        if !self
            .registry
            .claim(zone, record.status, now, self.config.claim_lease())?
        {
            info!(zone = %zone, "Zone is being renewed by another run, skipping");
            return Ok(outcome(Some(decision), ZoneResult::Busy));
        }

        if record.status == ZoneStatus::Issued && !record.is_due(now) {
            warn!(
                zone = %zone,
                disk = ?disk,
                "Installed certificate missing or expiring, renewing ahead of schedule"
            );
        }

        info!(zone = %zone, provider = %record.provider, "Renewing {} ({})", zone, decision.reason());

        let provider = match provider::normalize(Some(&record.provider)) {
            Ok(provider) => provider,
            Err(e) => {
                error!(zone = %zone, error = %e, "Zone has an unusable DNS provider");
                self.registry.mark_error(zone, &e.to_string())?;
                return Ok(outcome(
                    Some(decision),
                    ZoneResult::Failed {
                        message: e.to_string(),
                    },
                ));
            }
        };

        match self.renew(zone, provider).await {
            Ok(()) => {
                let next_renewal_after = now + self.config.renewal_period();
                self.registry.mark_issued(zone, now, next_renewal_after)?;
                info!(
                    zone = %zone,
                    next_renewal_after = %next_renewal_after,
                    "Wildcard certificate installed"
                );
                Ok(outcome(
                    Some(decision),
                    ZoneResult::Issued { next_renewal_after },
                ))
            }
            Err(e) if e.is_systemic() => {
                if let Err(release_err) = self.registry.release(zone) {
                    warn!(zone = %zone, error = %release_err, "Failed to release zone claim");
                }
                Err(e)
            }
            Err(e) => {
                let message = failure_message(&e);
                let exit_code = match &e {
                    AcmeError::ExternalProcess { exit_code, .. } => *exit_code,
                    _ => None,
                };
                error!(
                    zone = %zone,
                    provider = %provider,
                    exit_code = ?exit_code,
                    error = %e,
                    "Certificate renewal failed"
                );
                self.registry.mark_error(zone, &message)?;
                Ok(outcome(Some(decision), ZoneResult::Failed { message }))
            }
        }
    }

    /// Issue `<zone>` + `*.<zone>`, install it and verify the installed files
    async fn renew(&self, zone: &str, provider: ProviderSlug) -> AcmeResult<()> {
        let acme_bin = &self.config.acme_bin;

        self.runner
            .run(acme_bin, &self.issue_args(zone, provider))
            .await?
            .into_result()?;

        self.certs.prepare_zone(zone)?;
        self.runner
            .run(acme_bin, &self.install_args(zone))
            .await?
            .into_result()?;

        for path in [self.certs.fullchain_path(zone), self.certs.key_path(zone)] {
            if !path.is_file() {
                return Err(AcmeError::ExternalProcess {
                    exit_code: Some(0),
                    output: format!(
                        "ACME client reported success but {} is missing",
                        path.display()
                    ),
                });
            }
        }

        Ok(())
    }

    pub fn issue_args(&self, zone: &str, provider: ProviderSlug) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--issue".into(),
            "--dns".into(),
            provider.as_str().into(),
            "-d".into(),
            zone.into(),
            "-d".into(),
            format!("*.{}", zone),
            "--force".into(),
        ];
        if let Some(server) = &self.config.acme_server {
            args.push("--server".into());
            args.push(server.clone());
        }
        args
    }

    pub fn install_args(&self, zone: &str) -> Vec<String> {
        vec![
            "--install-cert".into(),
            "-d".into(),
            zone.into(),
            "--fullchain-file".into(),
            self.certs.fullchain_path(zone).to_string_lossy().into_owned(),
            "--key-file".into(),
            self.certs.key_path(zone).to_string_lossy().into_owned(),
        ]
    }

    async fn reload(&self) -> Option<ReloadOutcome> {
        let (program, args) = self.config.reload_command.as_deref()?.split_first()?;

        let result = match self.runner.run(program, args).await {
            Ok(output) => output.into_result().map(|_| ()),
            Err(e) => Err(e),
        };

        Some(match result {
            Ok(()) => {
                info!(command = %program, "Reloaded serving layer");
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                warn!(command = %program, error = %e, "Reload after certificate install failed");
                ReloadOutcome::Failed {
                    message: failure_message(&e),
                }
            }
        })
    }
}

/// Captured process output when there is one, the error text otherwise
fn failure_message(e: &AcmeError) -> String {
    match e {
        AcmeError::ExternalProcess { output, .. } => output.clone(),
        other => other.to_string(),
    }
}
