use crate::db::{SharedConnection, lock};
use crate::types::{AcmeResult, DomainRecord};
use crate::zone::{ZoneResolver, normalize_host};
use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

const SELECT_COLUMNS: &str =
    "SELECT host, normalized_host, zone, namespace, label, is_active FROM domains";

/// Domain inventory (`domains` table)
pub struct DomainStore {
    conn: SharedConnection,
}

impl DomainStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn list_active(&self) -> AcmeResult<Vec<DomainRecord>> {
        self.query(&format!(
            "{} WHERE is_active = 1 ORDER BY normalized_host ASC",
            SELECT_COLUMNS
        ))
    }

    pub fn list_all(&self) -> AcmeResult<Vec<DomainRecord>> {
        self.query(&format!("{} ORDER BY normalized_host ASC", SELECT_COLUMNS))
    }

    pub fn get(&self, host: &str) -> AcmeResult<Option<DomainRecord>> {
        let normalized = normalize_host(host)?;
        let conn = lock(&self.conn);
        let record = conn
            .query_row(
                &format!("{} WHERE normalized_host = ?1", SELECT_COLUMNS),
                params![normalized],
                map_domain,
            )
            .optional()?;
        Ok(record)
    }

    /// Create or update a domain keyed by its normalized host
    pub fn upsert(
        &self,
        resolver: &ZoneResolver,
        host: &str,
        namespace: Option<&str>,
        label: Option<&str>,
        is_active: bool,
    ) -> AcmeResult<DomainRecord> {
        let normalized_host = normalize_host(host)?;
        let zone = resolver.derive_zone(&normalized_host)?;
        let record = DomainRecord {
            host: host.trim().to_string(),
            normalized_host,
            zone,
            namespace: clean(namespace).map(|ns| ns.to_ascii_lowercase()),
            label: clean(label).map(str::to_string),
            is_active,
        };

        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO domains (host, normalized_host, zone, namespace, label, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(normalized_host) DO UPDATE SET
                host = excluded.host,
                zone = excluded.zone,
                namespace = excluded.namespace,
                label = excluded.label,
                is_active = excluded.is_active",
            params![
                record.host,
                record.normalized_host,
                record.zone,
                record.namespace,
                record.label,
                record.is_active
            ],
        )?;

        Ok(record)
    }

    /// Returns whether a domain with that host existed
    pub fn set_active(&self, host: &str, is_active: bool) -> AcmeResult<bool> {
        let normalized = normalize_host(host)?;
        let conn = lock(&self.conn);
        let changed = conn.execute(
            "UPDATE domains SET is_active = ?1 WHERE normalized_host = ?2",
            params![is_active, normalized],
        )?;
        Ok(changed > 0)
    }

    /// Delete a domain and drop its certificate zone once nothing active uses it.
    ///
    /// Returns the zone and whether its certificate row was removed.
    pub fn delete(&self, host: &str) -> AcmeResult<Option<(String, bool)>> {
        let Some(record) = self.get(host)? else {
            return Ok(None);
        };

        {
            let conn = lock(&self.conn);
            conn.execute(
                "DELETE FROM domains WHERE normalized_host = ?1",
                params![record.normalized_host],
            )?;
        }

        let removed = self.remove_zone_if_unused(&record.zone)?;
        Ok(Some((record.zone, removed)))
    }

    /// Remove the certificate zone if no active domain references it
    pub fn remove_zone_if_unused(&self, zone: &str) -> AcmeResult<bool> {
        let zone = zone.trim().to_ascii_lowercase();
        if zone.is_empty() {
            return Ok(false);
        }

        let conn = lock(&self.conn);
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM domains WHERE zone = ?1 AND is_active = 1",
            params![zone],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Ok(false);
        }

        let removed = conn.execute(
            "DELETE FROM certificate_zones WHERE zone = ?1",
            params![zone],
        )?;
        if removed > 0 {
            info!(zone = %zone, "Removed unused certificate zone");
        }
        Ok(removed > 0)
    }

    fn query(&self, sql: &str) -> AcmeResult<Vec<DomainRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map([], map_domain)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn map_domain(row: &Row<'_>) -> rusqlite::Result<DomainRecord> {
    let normalized_host: String = row.get::<_, String>(1)?.trim().to_ascii_lowercase();
    let host = row
        .get::<_, Option<String>>(0)?
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| normalized_host.clone());
    let zone = row
        .get::<_, Option<String>>(2)?
        .map(|z| z.trim().to_ascii_lowercase())
        .filter(|z| !z.is_empty())
        .unwrap_or_else(|| normalized_host.clone());

    Ok(DomainRecord {
        host,
        normalized_host,
        zone,
        namespace: row.get(3)?,
        label: row.get(4)?,
        is_active: row.get::<_, Option<bool>>(5)?.unwrap_or(true),
    })
}
