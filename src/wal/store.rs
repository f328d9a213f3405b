//! Write Log Store
//!
//! Durable ledger of writes that still have to reach one instance.
//! All status changes go through conditional updates so that a row is
//! only ever moved from a state the transition table allows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::entry::{ConversionType, Instance, Method, NewWrite, WriteLogEntry, WriteStatus};
use crate::db::{chrono_duration, decode_ts, encode_ts, Database};
use crate::error::{Error, Result};

const ENTRY_COLUMNS: &str = "write_id, method, path, target_instance, status, retry_count, \
     error_message, data, headers, conversion_type, created_at, updated_at";

/// Row as it comes out of SQLite, before enum parsing
struct StoredRow {
    write_id: String,
    method: String,
    path: String,
    target_instance: String,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
    data: Vec<u8>,
    headers: String,
    conversion_type: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            write_id: row.get(0)?,
            method: row.get(1)?,
            path: row.get(2)?,
            target_instance: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            error_message: row.get(6)?,
            data: row.get(7)?,
            headers: row.get(8)?,
            conversion_type: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<WriteLogEntry> {
        let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)
            .map_err(|e| Error::Store(format!("bad headers for {}: {}", self.write_id, e)))?;
        let conversion_type = self
            .conversion_type
            .as_deref()
            .map(str::parse::<ConversionType>)
            .transpose()?;

        Ok(WriteLogEntry {
            method: self.method.parse::<Method>()?,
            target_instance: self.target_instance.parse::<Instance>()?,
            status: self.status.parse::<WriteStatus>()?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            error_message: self.error_message,
            // Owned copy of the BLOB; length and transmitted bytes both come from here
            data: Bytes::from(self.data),
            headers,
            conversion_type,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
            path: self.path,
            write_id: self.write_id,
        })
    }
}

/// Entry counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub executed: u64,
    pub synced: u64,
    pub failed: u64,
    pub cleanup_pending: u64,
    pub total: u64,
}

impl StatusCounts {
    fn add(&mut self, status: WriteStatus, count: u64) {
        match status {
            WriteStatus::Pending => self.pending += count,
            WriteStatus::Executed => self.executed += count,
            WriteStatus::Synced => self.synced += count,
            WriteStatus::Failed => self.failed += count,
            WriteStatus::CleanupPending => self.cleanup_pending += count,
        }
        self.total += count;
    }

    /// Entries still waiting for replay
    pub fn outstanding(&self) -> u64 {
        self.pending + self.executed
    }
}

/// SQLite-backed write log
pub struct WriteLogStore {
    db: Arc<Database>,
    max_retries: u32,
}

impl WriteLogStore {
    pub fn new(db: Arc<Database>, max_retries: u32) -> Self {
        Self { db, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a captured write in `pending` and return its id
    pub async fn append(&self, write: NewWrite) -> Result<String> {
        let write_id = uuid::Uuid::new_v4().to_string();
        let now = encode_ts(Utc::now());
        let headers = serde_json::to_string(&write.headers)?;

        let conn = self.db.lock().await;
        conn.execute(
            r#"
            INSERT INTO write_log (
                write_id, method, path, target_instance, status, retry_count,
                data, headers, conversion_type, created_at, updated_at, next_attempt_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?8, ?8)
            "#,
            params![
                write_id,
                write.method.as_str(),
                write.path,
                write.target_instance.as_str(),
                write.data.as_ref(),
                headers,
                write.conversion_type.map(|c| c.as_str()),
                now,
            ],
        )?;

        tracing::debug!(
            "Logged {} {} for {} ({} bytes) as {}",
            write.method,
            write.path,
            write.target_instance,
            write.data.len(),
            write_id
        );

        Ok(write_id)
    }

    /// Atomically claim up to `limit` eligible entries for `owner`.
    ///
    /// Eligible: pending or executed, under the retry limit, past its
    /// backoff gate, and not leased by a live claim. Each row is moved to
    /// `executed` with a compare-and-set; rows another claimer won are
    /// skipped. Oldest entries first.
    pub async fn claim_batch(
        &self,
        target: Option<Instance>,
        limit: usize,
        owner: &str,
        lease: Duration,
    ) -> Result<Vec<WriteLogEntry>> {
        let now = Utc::now();
        let now_text = encode_ts(now);
        let lease_until = encode_ts(now + chrono_duration(lease));
        let target = target.map(Instance::as_str);

        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT write_id, status FROM write_log
                WHERE status IN ('pending', 'executed')
                  AND retry_count < ?1
                  AND next_attempt_at <= ?2
                  AND (lease_until IS NULL OR lease_until < ?2)
                  AND (?3 IS NULL OR target_instance = ?3)
                ORDER BY created_at, write_id
                LIMIT ?4
                "#,
            )?;
            let rows = stmt.query_map(
                params![self.max_retries, now_text, target, limit as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (write_id, status) in candidates {
            let status = status.parse::<WriteStatus>()?;
            status.transition(WriteStatus::Executed, &write_id)?;

            let changed = tx.execute(
                r#"
                UPDATE write_log
                SET status = 'executed', lease_owner = ?1, lease_until = ?2, updated_at = ?3
                WHERE write_id = ?4
                  AND status IN ('pending', 'executed')
                  AND retry_count < ?5
                  AND (lease_until IS NULL OR lease_until < ?3)
                "#,
                params![owner, lease_until, now_text, write_id, self.max_retries],
            )?;
            if changed == 1 {
                claimed.push(write_id);
            }
        }

        let mut entries = Vec::with_capacity(claimed.len());
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM write_log WHERE write_id = ?1",
                ENTRY_COLUMNS
            ))?;
            for write_id in &claimed {
                let row = stmt.query_row(params![write_id], StoredRow::read)?;
                entries.push(row.into_entry()?);
            }
        }

        tx.commit()?;

        if !entries.is_empty() {
            tracing::debug!("{} claimed {} entries", owner, entries.len());
        }

        Ok(entries)
    }

    /// Extend the lease `owner` holds on a claimed entry.
    ///
    /// Returns false when the claim is no longer `owner`'s, so the caller
    /// must leave the entry alone.
    pub async fn renew_lease(&self, write_id: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let conn = self.db.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE write_log
            SET lease_until = ?3, updated_at = ?4
            WHERE write_id = ?1 AND status = 'executed' AND lease_owner = ?2
            "#,
            params![
                write_id,
                owner,
                encode_ts(now + chrono_duration(lease)),
                encode_ts(now)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Record a successful replay: `executed -> synced`.
    ///
    /// Only the current lease holder may do this.
    pub async fn mark_synced(&self, write_id: &str, owner: &str) -> Result<()> {
        let now = encode_ts(Utc::now());
        let conn = self.db.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE write_log
            SET status = 'synced', error_message = NULL,
                lease_owner = NULL, lease_until = NULL, updated_at = ?3
            WHERE write_id = ?1 AND status = 'executed' AND lease_owner = ?2
            "#,
            params![write_id, owner, now],
        )?;

        if changed == 0 {
            let (current, holder) = current_claim(&conn, write_id)?;
            current.transition(WriteStatus::Synced, write_id)?;
            return Err(lease_lost(write_id, owner, holder));
        }

        Ok(())
    }

    /// Record a failed replay attempt.
    ///
    /// Increments `retry_count` exactly once. The entry stays eligible
    /// (gated by `retry_after`) until the count reaches the maximum, then
    /// becomes `failed`. Returns the resulting status.
    pub async fn mark_failed(
        &self,
        write_id: &str,
        owner: &str,
        error: &str,
        retry_after: Duration,
    ) -> Result<WriteStatus> {
        self.record_failure(write_id, owner, error, Some(retry_after)).await
    }

    /// Record a failure no retry can fix; the entry becomes `failed` at once
    pub async fn mark_failed_terminal(
        &self,
        write_id: &str,
        owner: &str,
        error: &str,
    ) -> Result<WriteStatus> {
        self.record_failure(write_id, owner, error, None).await
    }

    async fn record_failure(
        &self,
        write_id: &str,
        owner: &str,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<WriteStatus> {
        let now = Utc::now();
        let mut conn = self.db.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (status, retry_count, holder): (String, i64, Option<String>) = tx
            .query_row(
                "SELECT status, retry_count, lease_owner FROM write_log WHERE write_id = ?1",
                params![write_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| Error::EntryNotFound(write_id.to_string()))?;
        let status = status.parse::<WriteStatus>()?;

        let retry_count = u32::try_from(retry_count).unwrap_or(0).saturating_add(1);
        let next = match retry_after {
            Some(_) if retry_count < self.max_retries => WriteStatus::Executed,
            _ => WriteStatus::Failed,
        };
        status.transition(next, write_id)?;
        if holder.as_deref() != Some(owner) {
            return Err(lease_lost(write_id, owner, holder));
        }

        let next_attempt_at = encode_ts(now + chrono_duration(retry_after.unwrap_or_default()));
        tx.execute(
            r#"
            UPDATE write_log
            SET status = ?2, retry_count = ?3, error_message = ?4, next_attempt_at = ?5,
                lease_owner = NULL, lease_until = NULL, updated_at = ?6
            WHERE write_id = ?1
            "#,
            params![
                write_id,
                next.as_str(),
                retry_count,
                error,
                next_attempt_at,
                encode_ts(now),
            ],
        )?;
        tx.commit()?;

        if next == WriteStatus::Failed {
            tracing::warn!(
                "Entry {} failed after {} attempts: {}",
                write_id,
                retry_count,
                error
            );
        }

        Ok(next)
    }

    /// Release a claim without counting an attempt
    pub async fn defer(&self, write_id: &str, owner: &str, delay: Duration, note: &str) -> Result<()> {
        let now = Utc::now();
        let conn = self.db.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE write_log
            SET error_message = ?3, next_attempt_at = ?4,
                lease_owner = NULL, lease_until = NULL, updated_at = ?5
            WHERE write_id = ?1 AND status = 'executed' AND lease_owner = ?2
            "#,
            params![
                write_id,
                owner,
                note,
                encode_ts(now + chrono_duration(delay)),
                encode_ts(now)
            ],
        )?;

        if changed == 0 {
            let (current, holder) = current_claim(&conn, write_id)?;
            if current != WriteStatus::Executed {
                return Err(Error::Store(format!(
                    "cannot defer entry {} in status {}",
                    write_id, current
                )));
            }
            return Err(lease_lost(write_id, owner, holder));
        }
        Ok(())
    }

    /// Manual reset: `failed -> pending` with the retry budget restored.
    ///
    /// With `write_id = None` every failed entry is reset. Returns the
    /// number of entries reset.
    pub async fn reset_failed(&self, write_id: Option<&str>) -> Result<u64> {
        let now = encode_ts(Utc::now());
        let conn = self.db.lock().await;

        let changed = match write_id {
            Some(id) => {
                let current = current_status(&conn, id)?;
                current.transition(WriteStatus::Pending, id)?;
                conn.execute(
                    r#"
                    UPDATE write_log
                    SET status = 'pending', retry_count = 0, error_message = NULL,
                        next_attempt_at = ?2, lease_owner = NULL, lease_until = NULL,
                        updated_at = ?2
                    WHERE write_id = ?1 AND status = 'failed'
                    "#,
                    params![id, now],
                )?
            }
            None => conn.execute(
                r#"
                UPDATE write_log
                SET status = 'pending', retry_count = 0, error_message = NULL,
                    next_attempt_at = ?1, lease_owner = NULL, lease_until = NULL,
                    updated_at = ?1
                WHERE status = 'failed'
                "#,
                params![now],
            )?,
        };

        if changed > 0 {
            tracing::info!("Reset {} failed entries to pending", changed);
        }
        Ok(changed as u64)
    }

    /// Delete terminal entries last touched before `older_than` ago
    pub async fn cleanup(&self, older_than: Duration, statuses: &[WriteStatus]) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        if let Some(live) = statuses.iter().find(|s| !s.is_terminal()) {
            return Err(Error::Internal(format!(
                "refusing to clean up non-terminal status {}",
                live
            )));
        }

        let cutoff = encode_ts(Utc::now() - chrono_duration(older_than));
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "DELETE FROM write_log WHERE updated_at < ?1 AND status IN ({})",
            placeholders
        );

        let mut values = vec![cutoff];
        values.extend(statuses.iter().map(|s| s.as_str().to_string()));

        let conn = self.db.lock().await;
        let deleted = conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(deleted as u64)
    }

    /// Fetch one entry
    pub async fn get(&self, write_id: &str) -> Result<Option<WriteLogEntry>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM write_log WHERE write_id = ?1", ENTRY_COLUMNS),
                params![write_id],
                StoredRow::read,
            )
            .optional()?;
        row.map(StoredRow::into_entry).transpose()
    }

    /// List entries, newest first, optionally filtered by status
    pub async fn list(&self, status: Option<WriteStatus>, limit: usize) -> Result<Vec<WriteLogEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM write_log WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC, write_id LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(WriteStatus::as_str), limit as i64],
            StoredRow::read,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Count entries per status
    pub async fn counts_by_status(&self) -> Result<StatusCounts> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM write_log GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            counts.add(status.parse::<WriteStatus>()?, count as u64);
        }
        Ok(counts)
    }
}

fn current_status(conn: &rusqlite::Connection, write_id: &str) -> Result<WriteStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM write_log WHERE write_id = ?1",
            params![write_id],
            |row| row.get(0),
        )
        .optional()?;
    status
        .ok_or_else(|| Error::EntryNotFound(write_id.to_string()))?
        .parse()
}

/// Status and lease holder of one entry
fn current_claim(
    conn: &rusqlite::Connection,
    write_id: &str,
) -> Result<(WriteStatus, Option<String>)> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, lease_owner FROM write_log WHERE write_id = ?1",
            params![write_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (status, holder) = row.ok_or_else(|| Error::EntryNotFound(write_id.to_string()))?;
    Ok((status.parse()?, holder))
}

fn lease_lost(write_id: &str, owner: &str, holder: Option<String>) -> Error {
    Error::LeaseLost {
        write_id: write_id.to_string(),
        owner: owner.to_string(),
        holder: holder.unwrap_or_else(|| "nobody".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    fn open_store(max_retries: u32) -> (TempDir, Arc<Database>, WriteLogStore) {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            Database::open_path(&dir.path().join("log.db"), Duration::from_secs(5)).unwrap(),
        );
        let store = WriteLogStore::new(Arc::clone(&db), max_retries);
        (dir, db, store)
    }

    fn write_to(target: Instance, data: &[u8]) -> NewWrite {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        NewWrite {
            method: Method::Post,
            path: "/api/v2/tenants/t/databases/d/collections/kb/add".to_string(),
            target_instance: target,
            data: Bytes::copy_from_slice(data),
            headers,
            conversion_type: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"{}")).await.unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.target_instance, Instance::Replica);
        assert_eq!(entry.origin_instance(), Instance::Primary);
        assert_eq!(entry.headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_binary_payload_is_preserved() {
        let (_dir, _db, store) = open_store(3);
        // Embedding-like payload with NULs and invalid UTF-8
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let id = store.append(write_to(Instance::Replica, &payload)).await.unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.payload_len(), 4096);
        assert_eq!(entry.data.as_ref(), payload.as_slice());
        assert_eq!(entry.summary().data_len, 4096);
    }

    #[tokio::test]
    async fn test_claim_moves_to_executed_and_leases() {
        let (_dir, _db, store) = open_store(3);
        store.append(write_to(Instance::Replica, b"1")).await.unwrap();
        store.append(write_to(Instance::Primary, b"2")).await.unwrap();

        let claimed = store
            .claim_batch(Some(Instance::Replica), 10, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, WriteStatus::Executed);

        // Leased entries are not handed out again
        let again = store
            .claim_batch(None, 10, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].target_instance, Instance::Primary);
    }

    #[tokio::test]
    async fn test_claim_orders_by_creation() {
        let (_dir, _db, store) = open_store(3);
        let first = store.append(write_to(Instance::Replica, b"1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = store.append(write_to(Instance::Replica, b"2")).await.unwrap();

        let claimed = store
            .claim_batch(None, 10, "w", Duration::from_secs(60))
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.write_id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let (dir, _db, store) = open_store(3);
        for i in 0..40u8 {
            store.append(write_to(Instance::Replica, &[i])).await.unwrap();
        }

        // A second handle on the same file stands in for another process
        let other_db = Arc::new(
            Database::open_path(&dir.path().join("log.db"), Duration::from_secs(5)).unwrap(),
        );
        let other = WriteLogStore::new(other_db, 3);

        let (a, b) = tokio::join!(
            store.claim_batch(None, 25, "a", Duration::from_secs(60)),
            other.claim_batch(None, 25, "b", Duration::from_secs(60)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let ids_a: HashSet<_> = a.iter().map(|e| e.write_id.clone()).collect();
        let ids_b: HashSet<_> = b.iter().map(|e| e.write_id.clone()).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 40);
    }

    #[tokio::test]
    async fn test_synced_entries_are_never_reclaimed() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();

        store.claim_batch(None, 10, "w", Duration::from_secs(60)).await.unwrap();
        store.mark_synced(&id, "w").await.unwrap();

        let claimed = store
            .claim_batch(None, 10, "w", Duration::ZERO)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Synced);

        // A second mark is an illegal transition, not a silent no-op
        let err = store.mark_failed(&id, "w", "late", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_moves_ownership() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();

        let first = store
            .claim_batch(None, 10, "worker-a", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = store
            .claim_batch(None, 10, "worker-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second[0].write_id, id);

        // The stale holder can neither renew nor record an outcome
        assert!(!store.renew_lease(&id, "worker-a", Duration::from_secs(60)).await.unwrap());
        let err = store.mark_synced(&id, "worker-a").await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { ref holder, .. } if holder == "worker-b"));
        let err = store
            .mark_failed(&id, "worker-a", "timeout", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
        let err = store.defer(&id, "worker-a", Duration::ZERO, "late").await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Executed);
        assert_eq!(entry.retry_count, 0);

        // The current holder's result is the one that counts
        assert_eq!(
            store.mark_failed(&id, "worker-b", "503", Duration::ZERO).await.unwrap(),
            WriteStatus::Executed
        );
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.error_message.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn test_renewed_lease_is_not_reclaimed() {
        let (_dir, _db, store) = open_store(3);
        store.append(write_to(Instance::Replica, b"x")).await.unwrap();

        let claimed = store
            .claim_batch(None, 10, "worker-a", Duration::from_millis(20))
            .await
            .unwrap();
        let id = claimed[0].write_id.clone();
        assert!(store.renew_lease(&id, "worker-a", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stolen = store
            .claim_batch(None, 10, "worker-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(stolen.is_empty());
        store.mark_synced(&id, "worker-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_synced_requires_claim() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();
        let err = store.mark_synced(&id, "w").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { from: WriteStatus::Pending, to: WriteStatus::Synced, .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_count_reaches_max_then_fails() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();

        for attempt in 1..=3u32 {
            let claimed = store
                .claim_batch(None, 10, "w", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "attempt {}", attempt);

            let status = store
                .mark_failed(&id, "w", "connection refused", Duration::ZERO)
                .await
                .unwrap();
            let entry = store.get(&id).await.unwrap().unwrap();
            assert_eq!(entry.retry_count, attempt);
            assert!(entry.retry_count <= store.max_retries());

            if attempt < 3 {
                assert_eq!(status, WriteStatus::Executed);
            } else {
                assert_eq!(status, WriteStatus::Failed);
            }
        }

        let claimed = store.claim_batch(None, 10, "w", Duration::ZERO).await.unwrap();
        assert!(claimed.is_empty());

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_backoff_gate_delays_reclaim() {
        let (_dir, _db, store) = open_store(5);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();
        store.claim_batch(None, 10, "w", Duration::from_secs(60)).await.unwrap();
        store.mark_failed(&id, "w", "503", Duration::from_secs(3600)).await.unwrap();

        let claimed = store.claim_batch(None, 10, "w", Duration::ZERO).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retry_budget() {
        let (_dir, _db, store) = open_store(5);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();
        store.claim_batch(None, 10, "w", Duration::from_secs(60)).await.unwrap();

        let status = store.mark_failed_terminal(&id, "w", "phantom mapping").await.unwrap();
        assert_eq!(status, WriteStatus::Failed);
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
    }

    #[tokio::test]
    async fn test_defer_does_not_count_attempt() {
        let (_dir, _db, store) = open_store(3);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();
        store.claim_batch(None, 10, "w", Duration::from_secs(60)).await.unwrap();
        store.defer(&id, "w", Duration::ZERO, "collection not visible yet").await.unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 0);

        let claimed = store.claim_batch(None, 10, "w", Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_reset_restores_budget() {
        let (_dir, _db, store) = open_store(1);
        let id = store.append(write_to(Instance::Replica, b"x")).await.unwrap();
        store.claim_batch(None, 10, "w", Duration::from_secs(60)).await.unwrap();
        store.mark_failed(&id, "w", "boom", Duration::ZERO).await.unwrap();

        assert_eq!(store.reset_failed(Some(&id)).await.unwrap(), 1);
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.error_message.is_none());

        // Only failed entries can be reset
        let err = store.reset_failed(Some(&id)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_terminal_rows() {
        let (_dir, _db, store) = open_store(3);
        let synced = store.append(write_to(Instance::Replica, b"a")).await.unwrap();
        let claimed = store
            .claim_batch(None, 1, "w", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed[0].write_id, synced);
        store.mark_synced(&synced, "w").await.unwrap();
        let pending = store.append(write_to(Instance::Replica, b"b")).await.unwrap();

        let err = store
            .cleanup(Duration::ZERO, &[WriteStatus::Pending])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        tokio::time::sleep(Duration::from_millis(5)).await;
        let deleted = store
            .cleanup(Duration::ZERO, &[WriteStatus::Synced, WriteStatus::Failed])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&synced).await.unwrap().is_none());
        assert!(store.get(&pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counts_by_status() {
        let (_dir, _db, store) = open_store(3);
        store.append(write_to(Instance::Replica, b"a")).await.unwrap();
        store.append(write_to(Instance::Replica, b"b")).await.unwrap();
        let claimed = store
            .claim_batch(None, 1, "w", Duration::from_secs(60))
            .await
            .unwrap();
        store.mark_synced(&claimed[0].write_id, "w").await.unwrap();

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.outstanding(), 1);
    }
}
