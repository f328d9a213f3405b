//! Shared SQLite Handle
//!
//! The write log and the collection mappings live in one SQLite file.
//! Every mutation in the process goes through this handle; across
//! processes, SQLite's own locking plus the conditional updates in the
//! write log keep claims disjoint.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS write_log (
    write_id TEXT PRIMARY KEY,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    target_instance TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    data BLOB NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}',
    conversion_type TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    next_attempt_at TEXT NOT NULL,
    lease_owner TEXT,
    lease_until TEXT
);

CREATE INDEX IF NOT EXISTS idx_write_log_claim
    ON write_log(status, target_instance, next_attempt_at, created_at);

CREATE INDEX IF NOT EXISTS idx_write_log_updated
    ON write_log(status, updated_at);

CREATE TABLE IF NOT EXISTS collection_mappings (
    collection_name TEXT PRIMARY KEY,
    primary_collection_id TEXT,
    replica_collection_id TEXT,
    collection_config TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mappings_primary
    ON collection_mappings(primary_collection_id);

CREATE INDEX IF NOT EXISTS idx_mappings_replica
    ON collection_mappings(replica_collection_id);
"#;

/// Process-wide SQLite connection guarded by an async mutex
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database described by the store configuration
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::open_path(&config.path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Open a database file directly
    pub fn open_path(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // journal_mode returns a row, so it cannot go through execute_batch
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!("Opened write log database at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection for a unit of work
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Cheap liveness query, used by the status endpoint
    pub async fn ping(&self) -> Result<()> {
        let conn = self.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Store(format!("database unavailable: {}", e)))?;
        Ok(())
    }
}

/// Timestamp encoding used in every table.
///
/// Fixed precision with a `Z` suffix, so text order equals time order.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp '{}': {}", text, e)))
}

/// Convert a std Duration into a chrono offset, saturating on overflow
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
