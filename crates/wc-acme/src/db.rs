use crate::domains::DomainStore;
use crate::registry::CertificateZoneRegistry;
use crate::types::AcmeResult;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    normalized_host TEXT NOT NULL UNIQUE,
    zone TEXT NOT NULL,
    namespace TEXT,
    label TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_domains_zone ON domains(zone);
CREATE TABLE IF NOT EXISTS certificate_zones (
    zone TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    wildcard_enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'pending',
    last_issued_at TEXT,
    last_error TEXT,
    next_renewal_after TEXT,
    claimed_until TEXT,
    requeue_requested INTEGER NOT NULL DEFAULT 0
);";

/// SQLite database shared by the domain store and the zone registry
#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> AcmeResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AcmeResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AcmeResult<Self> {
        conn.execute_batch(SCHEMA)?;
        add_column_if_missing(&conn, "certificate_zones", "claimed_until", "TEXT")?;
        add_column_if_missing(
            &conn,
            "certificate_zones",
            "requeue_requested",
            "INTEGER NOT NULL DEFAULT 0",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn registry(&self) -> CertificateZoneRegistry {
        CertificateZoneRegistry::new(self.conn.clone())
    }

    pub fn domains(&self) -> DomainStore {
        DomainStore::new(self.conn.clone())
    }

    /// Run raw SQL, for seeding and maintenance scripts
    pub fn execute_batch(&self, sql: &str) -> AcmeResult<()> {
        lock(&self.conn).execute_batch(sql)?;
        Ok(())
    }
}

/// Tables created by older deployments lack the claim columns
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    let columns = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        stmt.query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?
    };
    let exists = columns.iter().any(|name| name == column);

    if !exists {
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, definition
        ))?;
    }
    Ok(())
}

/// A panic while holding the lock leaves SQLite itself consistent
pub(crate) fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339 as well as `Y-m-d H:M:S[+zz:zz]` written by other tools
pub(crate) fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
