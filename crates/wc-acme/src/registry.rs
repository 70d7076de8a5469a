use crate::db::{SharedConnection, format_ts, lock, parse_ts};
use crate::provider::ProviderSlug;
use crate::types::{AcmeError, AcmeResult, CertificateZone, ZoneStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

const SELECT_COLUMNS: &str = "SELECT zone, provider, wildcard_enabled, status, last_issued_at, last_error, next_renewal_after, claimed_until FROM certificate_zones";

/// Longest error text persisted per zone (the tail is kept)
const MAX_ERROR_LEN: usize = 16 * 1024;

const UNSPECIFIED_ERROR: &str = "unspecified error";

/// Persisted certificate lifecycle per zone.
///
/// Every transition is a single UPDATE keyed by zone; nothing spans zones.
pub struct CertificateZoneRegistry {
    conn: SharedConnection,
}

impl CertificateZoneRegistry {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Insert the zone as `pending` unless it already exists
    pub fn ensure_zone(
        &self,
        zone: &str,
        provider: ProviderSlug,
        wildcard_enabled: bool,
    ) -> AcmeResult<bool> {
        let zone = normalize_zone(zone)?;
        let conn = lock(&self.conn);
        let inserted = conn.execute(
            "INSERT INTO certificate_zones (zone, provider, wildcard_enabled, status)
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(zone) DO NOTHING",
            params![
                zone,
                provider.as_str(),
                wildcard_enabled,
                ZoneStatus::Pending.as_str()
            ],
        )?;

        if inserted > 0 {
            debug!(zone = %zone, provider = %provider, "Registered certificate zone");
        }
        Ok(inserted > 0)
    }

    pub fn get(&self, zone: &str) -> AcmeResult<Option<CertificateZone>> {
        let zone = normalize_zone(zone)?;
        let conn = lock(&self.conn);
        let record = conn
            .query_row(
                &format!("{} WHERE zone = ?1", SELECT_COLUMNS),
                params![zone],
                map_zone,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_all(&self) -> AcmeResult<Vec<CertificateZone>> {
        self.query(&format!("{} ORDER BY zone ASC", SELECT_COLUMNS))
    }

    pub fn list_wildcard_enabled(&self) -> AcmeResult<Vec<CertificateZone>> {
        self.query(&format!(
            "{} WHERE wildcard_enabled = 1 ORDER BY zone ASC",
            SELECT_COLUMNS
        ))
    }

    /// Wildcard zones the registry considers due at `now`
    pub fn list_due(&self, now: DateTime<Utc>) -> AcmeResult<Vec<CertificateZone>> {
        Ok(self
            .list_wildcard_enabled()?
            .into_iter()
            .filter(|zone| zone.is_due(now))
            .collect())
    }

    /// Force renewal on the next run regardless of the renewal window.
    ///
    /// A live claim is left in place. The request is remembered and
    /// re-applied when the in-flight attempt records its result.
    pub fn mark_queued(&self, zone: &str) -> AcmeResult<()> {
        let zone = normalize_zone(zone)?;
        self.update(
            &zone,
            "UPDATE certificate_zones
             SET status = ?1, requeue_requested = CASE WHEN claimed_until IS NULL THEN 0 ELSE 1 END
             WHERE zone = ?2",
            params![ZoneStatus::Queued.as_str(), zone],
        )
    }

    pub fn mark_issued(
        &self,
        zone: &str,
        issued_at: DateTime<Utc>,
        next_renewal_after: DateTime<Utc>,
    ) -> AcmeResult<()> {
        let zone = normalize_zone(zone)?;
        if next_renewal_after <= issued_at {
            return Err(AcmeError::InvalidTransition(format!(
                "{}: next renewal {} is not after issuance {}",
                zone, next_renewal_after, issued_at
            )));
        }

        self.update(
            &zone,
            "UPDATE certificate_zones
             SET status = CASE WHEN requeue_requested = 1 THEN 'queued' ELSE ?1 END,
                 last_issued_at = ?2, next_renewal_after = ?3, last_error = NULL,
                 claimed_until = NULL, requeue_requested = 0
             WHERE zone = ?4",
            params![
                ZoneStatus::Issued.as_str(),
                format_ts(issued_at),
                format_ts(next_renewal_after),
                zone
            ],
        )
    }

    /// Record a failed attempt; timestamps of the last issuance are kept
    pub fn mark_error(&self, zone: &str, message: &str) -> AcmeResult<()> {
        let zone = normalize_zone(zone)?;
        let message = clamp_error(message);
        self.update(
            &zone,
            "UPDATE certificate_zones
             SET status = CASE WHEN requeue_requested = 1 THEN 'queued' ELSE ?1 END,
                 last_error = ?2, claimed_until = NULL, requeue_requested = 0
             WHERE zone = ?3",
            params![ZoneStatus::Error.as_str(), message, zone],
        )
    }

    pub fn mark_pending(&self, zone: &str, message: Option<&str>) -> AcmeResult<()> {
        let zone = normalize_zone(zone)?;
        let message = message.map(str::trim).filter(|m| !m.is_empty());
        self.update(
            &zone,
            "UPDATE certificate_zones
             SET status = ?1, last_error = ?2, claimed_until = NULL, requeue_requested = 0
             WHERE zone = ?3",
            params![ZoneStatus::Pending.as_str(), message, zone],
        )
    }

    /// Atomically lock a zone for one renewal attempt.
    ///
    /// Succeeds only while the row still has `expected` status and no live
    /// claim, so two overlapping runs never both invoke the ACME client.
    pub fn claim(
        &self,
        zone: &str,
        expected: ZoneStatus,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> AcmeResult<bool> {
        let zone = normalize_zone(zone)?;
        let conn = lock(&self.conn);
        let changed = conn.execute(
            "UPDATE certificate_zones SET claimed_until = ?1, requeue_requested = 0
             WHERE zone = ?2 AND status = ?3 AND (claimed_until IS NULL OR claimed_until <= ?4)",
            params![
                format_ts(now + lease),
                zone,
                expected.as_str(),
                format_ts(now)
            ],
        )?;
        Ok(changed > 0)
    }

    /// Drop a claim without recording a result (aborted attempt)
    pub fn release(&self, zone: &str) -> AcmeResult<()> {
        let zone = normalize_zone(zone)?;
        self.update(
            &zone,
            "UPDATE certificate_zones
             SET status = CASE WHEN requeue_requested = 1 THEN 'queued' ELSE status END,
                 claimed_until = NULL, requeue_requested = 0
             WHERE zone = ?1",
            params![zone],
        )
    }

    /// Ensure a row for every distinct zone of an active domain
    pub fn backfill_active_domains(
        &self,
        provider: ProviderSlug,
        wildcard_enabled: bool,
    ) -> AcmeResult<usize> {
        let zones: Vec<String> = {
            let conn = lock(&self.conn);
            let mut stmt =
                conn.prepare("SELECT DISTINCT zone FROM domains WHERE is_active = 1")?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut created = 0;
        for zone in zones {
            if zone.trim().is_empty() {
                continue;
            }
            if self.ensure_zone(&zone, provider, wildcard_enabled)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Delete a zone row; returns whether one existed
    pub fn remove_zone(&self, zone: &str) -> AcmeResult<bool> {
        let zone = normalize_zone(zone)?;
        let conn = lock(&self.conn);
        let removed = conn.execute(
            "DELETE FROM certificate_zones WHERE zone = ?1",
            params![zone],
        )?;
        Ok(removed > 0)
    }

    /// A zone never issued is eligible; otherwise once a full period has passed
    pub fn is_renewal_eligible(
        last_issued_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        renewal_period: Duration,
    ) -> bool {
        match last_issued_at {
            None => true,
            Some(issued) => now - issued >= renewal_period,
        }
    }

    fn query(&self, sql: &str) -> AcmeResult<Vec<CertificateZone>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let zones = stmt
            .query_map([], map_zone)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(zones)
    }

    fn update(&self, zone: &str, sql: &str, params: impl rusqlite::Params) -> AcmeResult<()> {
        let conn = lock(&self.conn);
        let changed = conn.execute(sql, params)?;
        if changed == 0 {
            return Err(AcmeError::ZoneNotFound(zone.to_string()));
        }
        Ok(())
    }
}

fn normalize_zone(zone: &str) -> AcmeResult<String> {
    let normalized = zone.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(AcmeError::InvalidHost(zone.to_string()));
    }
    Ok(normalized)
}

fn clamp_error(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return UNSPECIFIED_ERROR.to_string();
    }
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut start = message.len() - MAX_ERROR_LEN;
    while !message.is_char_boundary(start) {
        start += 1;
    }
    message[start..].to_string()
}

fn map_zone(row: &Row<'_>) -> rusqlite::Result<CertificateZone> {
    let status: String = row.get(3)?;
    let status = status.parse::<ZoneStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;

    let provider: Option<String> = row.get(1)?;
    let provider = provider
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| crate::provider::DEFAULT_PROVIDER.to_string());

    Ok(CertificateZone {
        zone: row.get(0)?,
        provider,
        wildcard_enabled: row.get::<_, Option<bool>>(2)?.unwrap_or(true),
        status,
        last_issued_at: timestamp(row, 4)?,
        last_error: row.get(5)?,
        next_renewal_after: timestamp(row, 6)?,
        claimed_until: timestamp(row, 7)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let Some(value) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    parse_ts(&value).map(Some).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", value).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;

    fn registry() -> CertificateZoneRegistry {
        Database::open_in_memory().unwrap().registry()
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_ensure_zone_is_idempotent() {
        let registry = registry();
        let cf = crate::provider::normalize(Some("cloudflare")).unwrap();

        assert!(registry.ensure_zone("Example.com", ProviderSlug::default(), true).unwrap());
        registry
            .mark_issued("example.com", at(2024, 1, 1), at(2024, 3, 1))
            .unwrap();

        assert!(!registry.ensure_zone("example.com", cf, false).unwrap());

        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Issued);
        assert_eq!(zone.provider, "dns_hetzner");
        assert!(zone.wildcard_enabled);
        assert_eq!(zone.last_issued_at, Some(at(2024, 1, 1)));
    }

    #[test]
    fn test_new_zone_starts_pending() {
        let registry = registry();
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();

        let zone = registry.get("EXAMPLE.COM").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Pending);
        assert_eq!(zone.last_issued_at, None);
        assert_eq!(zone.next_renewal_after, None);
        assert!(registry.get("missing.com").unwrap().is_none());
    }

    #[test]
    fn test_issue_then_error_keeps_timestamps() {
        let registry = registry();
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();
        registry
            .mark_issued("example.com", at(2024, 1, 1), at(2024, 3, 1))
            .unwrap();
        registry.mark_error("example.com", "dns api rejected token").unwrap();

        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Error);
        assert_eq!(zone.last_error.as_deref(), Some("dns api rejected token"));
        assert_eq!(zone.last_issued_at, Some(at(2024, 1, 1)));
        assert_eq!(zone.next_renewal_after, Some(at(2024, 3, 1)));

        registry
            .mark_issued("example.com", at(2024, 3, 2), at(2024, 5, 1))
            .unwrap();
        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Issued);
        assert_eq!(zone.last_error, None);
    }

    #[test]
    fn test_error_message_never_empty() {
        let registry = registry();
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();
        registry.mark_error("example.com", "  \n").unwrap();

        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.last_error.as_deref(), Some(UNSPECIFIED_ERROR));
    }

    #[test]
    fn test_issued_requires_future_renewal() {
        let registry = registry();
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();
        let result = registry.mark_issued("example.com", at(2024, 3, 1), at(2024, 3, 1));
        assert!(matches!(result, Err(AcmeError::InvalidTransition(_))));
    }

    #[test]
    fn test_transitions_on_unknown_zone() {
        let registry = registry();
        assert!(matches!(
            registry.mark_queued("nowhere.com"),
            Err(AcmeError::ZoneNotFound(_))
        ));
        assert!(matches!(
            registry.mark_error("nowhere.com", "boom"),
            Err(AcmeError::ZoneNotFound(_))
        ));
    }

    #[test]
    fn test_list_due() {
        let registry = registry();
        let now = at(2024, 3, 1);
        for zone in ["fresh.com", "stale.com", "queued.com", "new.com"] {
            registry
                .ensure_zone(zone, ProviderSlug::default(), true)
                .unwrap();
        }
        registry
            .ensure_zone("disabled.com", ProviderSlug::default(), false)
            .unwrap();
        registry
            .mark_issued("fresh.com", at(2024, 2, 15), at(2024, 4, 15))
            .unwrap();
        registry
            .mark_issued("stale.com", at(2023, 12, 1), at(2024, 1, 30))
            .unwrap();
        registry.mark_queued("queued.com").unwrap();

        let due: Vec<String> = registry
            .list_due(now)
            .unwrap()
            .into_iter()
            .map(|z| z.zone)
            .collect();
        assert_eq!(due, vec!["new.com", "queued.com", "stale.com"]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = registry();
        let now = at(2024, 3, 1);
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();

        assert!(
            registry
                .claim("example.com", ZoneStatus::Pending, now, Duration::minutes(15))
                .unwrap()
        );
        assert!(
            !registry
                .claim("example.com", ZoneStatus::Pending, now, Duration::minutes(15))
                .unwrap()
        );
        // Stale claims from a crashed run can be taken over
        assert!(
            registry
                .claim(
                    "example.com",
                    ZoneStatus::Pending,
                    now + Duration::minutes(16),
                    Duration::minutes(15)
                )
                .unwrap()
        );

        registry.mark_error("example.com", "failed").unwrap();
        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.claimed_until, None);

        // Status moved on, so the old observation no longer matches
        assert!(
            !registry
                .claim("example.com", ZoneStatus::Pending, now, Duration::minutes(15))
                .unwrap()
        );
    }

    #[test]
    fn test_queue_request_during_claim_keeps_the_lock() {
        let registry = registry();
        let now = at(2024, 3, 1);
        let lease = Duration::minutes(15);
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();

        assert!(registry.claim("example.com", ZoneStatus::Pending, now, lease).unwrap());
        registry.mark_queued("example.com").unwrap();

        // An overlapping run sees `queued` but must not start a second attempt
        assert!(!registry.claim("example.com", ZoneStatus::Queued, now, lease).unwrap());
        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Queued);
        assert!(zone.claimed_until.is_some());

        // The in-flight attempt finishes; the queue request survives it
        registry
            .mark_issued("example.com", now, now + Duration::days(60))
            .unwrap();
        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Queued);
        assert_eq!(zone.last_issued_at, Some(now));
        assert_eq!(zone.claimed_until, None);

        // Next run picks it up and a plain success settles on `issued`
        assert!(registry.claim("example.com", ZoneStatus::Queued, now, lease).unwrap());
        registry
            .mark_issued("example.com", now, now + Duration::days(60))
            .unwrap();
        assert_eq!(
            registry.get("example.com").unwrap().unwrap().status,
            ZoneStatus::Issued
        );
    }

    #[test]
    fn test_queue_request_survives_failed_attempt() {
        let registry = registry();
        let now = at(2024, 3, 1);
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();

        assert!(
            registry
                .claim("example.com", ZoneStatus::Pending, now, Duration::minutes(15))
                .unwrap()
        );
        registry.mark_queued("example.com").unwrap();
        registry.mark_error("example.com", "dns timeout").unwrap();

        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Queued);
        assert_eq!(zone.last_error.as_deref(), Some("dns timeout"));
    }

    #[test]
    fn test_queue_without_claim_is_plain() {
        let registry = registry();
        let now = at(2024, 3, 1);
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();
        registry.mark_queued("example.com").unwrap();

        assert!(
            registry
                .claim("example.com", ZoneStatus::Queued, now, Duration::minutes(15))
                .unwrap()
        );
        registry.mark_error("example.com", "failed").unwrap();
        assert_eq!(
            registry.get("example.com").unwrap().unwrap().status,
            ZoneStatus::Error
        );
    }

    #[test]
    fn test_mark_pending_trims_message_and_releases_claim() {
        let registry = registry();
        let now = at(2024, 3, 1);
        registry
            .ensure_zone("example.com", ProviderSlug::default(), true)
            .unwrap();
        registry.mark_error("example.com", "rate limited").unwrap();
        assert!(
            registry
                .claim("example.com", ZoneStatus::Error, now, Duration::minutes(15))
                .unwrap()
        );

        registry
            .mark_pending("example.com", Some("  provider changed  "))
            .unwrap();
        let zone = registry.get("example.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Pending);
        assert_eq!(zone.last_error.as_deref(), Some("provider changed"));
        assert_eq!(zone.claimed_until, None);

        registry.mark_pending("example.com", Some("   ")).unwrap();
        assert_eq!(registry.get("example.com").unwrap().unwrap().last_error, None);

        assert!(matches!(
            registry.mark_pending("missing.com", None),
            Err(AcmeError::ZoneNotFound(_))
        ));
    }

    #[test]
    fn test_backfill_active_domains() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch(
            "INSERT INTO domains (host, normalized_host, zone, namespace, label, is_active) VALUES
                ('kaaroo.com', 'kaaroo.com', 'kaaroo.com', NULL, NULL, 1),
                ('inactive.example', 'inactive.example', 'inactive.example', NULL, NULL, 0),
                ('www.demo.com', 'demo.com', 'demo.com', NULL, NULL, 1);",
        )
        .unwrap();
        let registry = db.registry();
        registry
            .ensure_zone("existing.com", ProviderSlug::default(), false)
            .unwrap();

        let cf = crate::provider::normalize(Some("dns_cf")).unwrap();
        assert_eq!(registry.backfill_active_domains(cf, true).unwrap(), 2);

        let rows: Vec<(String, String, bool, ZoneStatus)> = registry
            .list_all()
            .unwrap()
            .into_iter()
            .map(|z| (z.zone, z.provider, z.wildcard_enabled, z.status))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("demo.com".into(), "dns_cf".into(), true, ZoneStatus::Pending),
                ("existing.com".into(), "dns_hetzner".into(), false, ZoneStatus::Pending),
                ("kaaroo.com".into(), "dns_cf".into(), true, ZoneStatus::Pending),
            ]
        );
    }

    #[test]
    fn test_renewal_eligibility_uses_period() {
        let now = at(2024, 3, 1);
        let period = Duration::days(60);
        assert!(CertificateZoneRegistry::is_renewal_eligible(None, now, period));
        assert!(!CertificateZoneRegistry::is_renewal_eligible(
            Some(at(2024, 2, 15)),
            now,
            period
        ));
        assert!(CertificateZoneRegistry::is_renewal_eligible(
            Some(at(2023, 12, 31)),
            now,
            period
        ));
    }

    #[test]
    fn test_reads_rows_written_by_other_tools() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch(
            "INSERT INTO certificate_zones (zone, provider, wildcard_enabled, status, last_issued_at)
             VALUES ('legacy.com', 'hetzner', 1, 'issued', '2024-01-01 00:00:00+00:00');",
        )
        .unwrap();

        let zone = db.registry().get("legacy.com").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Issued);
        assert_eq!(zone.provider, "hetzner");
        assert_eq!(zone.last_issued_at, Some(at(2024, 1, 1)));
        assert_eq!(zone.next_renewal_after, None);
    }

    #[test]
    fn test_long_errors_keep_the_tail() {
        let long = format!("{}END", "x".repeat(MAX_ERROR_LEN + 100));
        let clamped = clamp_error(&long);
        assert_eq!(clamped.len(), MAX_ERROR_LEN);
        assert!(clamped.ends_with("END"));
    }
}
