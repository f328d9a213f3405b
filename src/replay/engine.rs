//! Replay Engine
//!
//! Long-lived workers claim batches from the write log and re-issue each
//! write against its target instance. Every claimed entry ends its attempt
//! in exactly one of: synced, retry (attempt counted), failed (terminal),
//! or deferred (attempt not counted).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classifier::{is_collection_list, parse_collection_path, CollectionOp};
use crate::config::ReplayConfig;
use crate::db::chrono_duration;
use crate::error::{Error, Result};
use crate::instance::{is_not_found, CollectionInfo, Instances, RawResponse};
use crate::mapping::CollectionMapper;
use crate::wal::{Instance, Method, WriteLogEntry, WriteLogStore, WriteStatus};

use super::backoff::RetryPolicy;
use super::delete::DeletionConverter;
use super::translate::{Resolution, Translator};

/// How one replay attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Synced,
    /// Counted attempt; the entry stays eligible until the retry limit
    Retry(String),
    /// No retry can fix this
    Failed(String),
    /// Skipped without counting an attempt
    Deferred(String),
}

/// Replay counters since start
#[derive(Debug, Default)]
pub struct ReplayStats {
    synced: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
    cycles: AtomicU64,
    cycle_errors: AtomicU64,
    last_cycle_at_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStatsSnapshot {
    pub synced: u64,
    pub retried: u64,
    pub failed: u64,
    pub deferred: u64,
    pub cycles: u64,
    pub cycle_errors: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl ReplayStats {
    pub fn snapshot(&self) -> ReplayStatsSnapshot {
        let last = self.last_cycle_at_ms.load(Ordering::Relaxed);
        ReplayStatsSnapshot {
            synced: self.synced.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            last_cycle_at: if last > 0 {
                Utc.timestamp_millis_opt(last).single()
            } else {
                None
            },
        }
    }
}

/// Drives replay of the write log
pub struct ReplayEngine {
    store: Arc<WriteLogStore>,
    mapper: Arc<CollectionMapper>,
    instances: Arc<Instances>,
    translator: Arc<Translator>,
    deletion: DeletionConverter,
    policy: RetryPolicy,
    config: ReplayConfig,
    stats: ReplayStats,
    node_id: String,
}

impl ReplayEngine {
    pub fn new(
        store: Arc<WriteLogStore>,
        mapper: Arc<CollectionMapper>,
        instances: Arc<Instances>,
        config: ReplayConfig,
    ) -> Self {
        let translator = Arc::new(Translator::new(Arc::clone(&mapper), Arc::clone(&instances)));
        let mut node_id = uuid::Uuid::new_v4().simple().to_string();
        node_id.truncate(8);

        Self {
            store,
            mapper,
            instances,
            deletion: DeletionConverter::new(Arc::clone(&translator)),
            translator,
            policy: RetryPolicy::from_config(&config),
            config,
            stats: ReplayStats::default(),
            node_id,
        }
    }

    pub fn stats(&self) -> ReplayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Start the configured number of workers
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    /// Worker loop; exits when `shutdown` flips to true.
    ///
    /// A cycle that fails on the store backs the worker off instead of
    /// stopping it.
    pub async fn run_worker(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let owner = format!("{}-{}", self.node_id, worker);
        let mut consecutive_errors: u32 = 0;
        tracing::info!("Replay worker {} started", owner);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_cycle(&owner).await {
                Ok(0) => {
                    consecutive_errors = 0;
                    Some(self.config.poll_interval())
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    None
                }
                Err(e) => {
                    self.stats.cycle_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.delay_for_attempt(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    tracing::error!("Replay cycle on {} failed, backing off {:?}: {}", owner, delay, e);
                    Some(delay)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Replay worker {} stopped", owner);
    }

    /// Claim one batch and replay it. Returns the number of entries claimed.
    ///
    /// Fails only when the store does; per-entry instance errors are
    /// recorded on the entries.
    pub async fn run_cycle(&self, owner: &str) -> Result<usize> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_cycle_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let entries = self
            .store
            .claim_batch(None, self.config.batch_size, owner, self.config.lease())
            .await?;
        let claimed = entries.len();
        if claimed == 0 {
            return Ok(0);
        }

        let results: Vec<Result<Option<ReplayOutcome>>> = stream::iter(entries)
            .map(|entry| async move { self.process(entry, owner).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        // Entries whose result could not be recorded keep their lease and are reclaimed after it lapses
        for result in results {
            result?;
        }

        Ok(claimed)
    }

    /// Replay one claimed entry and record the outcome.
    ///
    /// Returns `None` when the claim passed to another worker before the
    /// outcome could be recorded; that worker owns the entry now.
    pub async fn process(&self, entry: WriteLogEntry, owner: &str) -> Result<Option<ReplayOutcome>> {
        let id = entry.write_id.as_str();

        // Later entries in a batch may wait behind slow ones; the clock starts now
        if !self.store.renew_lease(id, owner, self.config.lease()).await? {
            tracing::warn!("Entry {} is no longer leased to {}, skipping", id, owner);
            return Ok(None);
        }

        let outcome = self.replay(&entry).await?;
        match self.record(&entry, owner, &outcome).await {
            Ok(()) => Ok(Some(outcome)),
            Err(Error::LeaseLost { holder, .. }) => {
                tracing::warn!(
                    "Lease on {} passed from {} to {} during replay; outcome {:?} discarded",
                    id,
                    owner,
                    holder,
                    outcome
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, entry: &WriteLogEntry, owner: &str, outcome: &ReplayOutcome) -> Result<()> {
        let id = entry.write_id.as_str();

        match outcome {
            ReplayOutcome::Synced => {
                self.store.mark_synced(id, owner).await?;
                self.stats.synced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Replayed {} {} to {}", entry.method, entry.path, entry.target_instance);
            }
            ReplayOutcome::Retry(error) => {
                let delay = self.policy.delay_for_attempt(entry.retry_count);
                let status = self.store.mark_failed(id, owner, error, delay).await?;
                if status == WriteStatus::Failed {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Entry {} will retry in {:?}: {}", id, delay, error);
                }
            }
            ReplayOutcome::Failed(error) => {
                self.store.mark_failed_terminal(id, owner, error).await?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            ReplayOutcome::Deferred(note) => {
                self.store.defer(id, owner, self.policy.initial_delay, note).await?;
                self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Deferred {}: {}", id, note);
            }
        }

        Ok(())
    }

    /// One replay attempt. `Err` only for store failures.
    async fn replay(&self, entry: &WriteLogEntry) -> Result<ReplayOutcome> {
        let is_delete = DeletionConverter::applies_to(entry);
        let resolved = if is_delete {
            self.deletion.resolve(entry).await
        } else {
            self.translator.resolve(entry, true).await
        };
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) => return classify_error(entry, e),
        };

        let client = self.instances.get(entry.target_instance);
        let response = match client
            .send(
                entry.method.to_reqwest(),
                resolution.path(),
                &entry.headers,
                entry.data.clone(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_error(entry, e),
        };

        if response.is_success() || self.already_created(entry, &response) {
            self.after_success(entry, &resolution, &response).await;
            return Ok(ReplayOutcome::Synced);
        }

        Ok(self.classify_response(entry, &resolution, is_delete, &response).await)
    }

    /// A collection create answered with "already exists" has been applied
    fn already_created(&self, entry: &WriteLogEntry, response: &RawResponse) -> bool {
        response.status == 409 && entry.method == Method::Post && is_collection_list(&entry.path)
    }

    async fn classify_response(
        &self,
        entry: &WriteLogEntry,
        resolution: &Resolution,
        is_delete: bool,
        response: &RawResponse,
    ) -> ReplayOutcome {
        let target = entry.target_instance;

        if is_not_found(response.status, &response.body) {
            let is_read = parse_collection_path(&entry.path).is_some_and(|c| c.op.is_read());
            if is_read && self.within_race_window(entry) {
                return ReplayOutcome::Deferred(format!(
                    "{} not yet visible on {}",
                    resolution.path(),
                    target
                ));
            }

            if let Resolution::Translated {
                collection_name,
                target_id,
                ..
            } = resolution
            {
                match self.translator.verify_target(target, collection_name, target_id).await {
                    Err(e) if e.is_retryable() => return ReplayOutcome::Retry(e.to_string()),
                    Err(e) => return ReplayOutcome::Failed(describe(entry, &e)),
                    Ok(()) => {}
                }
            }

            if is_delete {
                return ReplayOutcome::Failed(DeletionConverter::not_found_message(
                    entry,
                    resolution.path(),
                ));
            }
        }

        ReplayOutcome::Retry(format!(
            "{} returned {}: {}",
            target,
            response.status,
            response.body_excerpt()
        ))
    }

    fn within_race_window(&self, entry: &WriteLogEntry) -> bool {
        Utc::now() - entry.created_at < chrono_duration(self.config.benign_race_window())
    }

    /// Keep the mapper in step with collection creates and deletes.
    ///
    /// The write itself has landed, so mapper failures are logged only.
    async fn after_success(&self, entry: &WriteLogEntry, resolution: &Resolution, response: &RawResponse) {
        let result = if entry.method == Method::Post && is_collection_list(&entry.path) {
            self.learn_created_collection(entry, response).await
        } else if entry.method == Method::Delete {
            self.forget_deleted_collection(entry, resolution).await
        } else {
            Ok(())
        };

        if let Err(e) = result {
            tracing::warn!(
                "Replayed {} but could not update collection mapping: {}",
                entry.write_id,
                e
            );
        }
    }

    async fn learn_created_collection(&self, entry: &WriteLogEntry, response: &RawResponse) -> Result<()> {
        let target = entry.target_instance;
        let origin = entry.origin_instance();

        let created = match serde_json::from_slice::<CollectionInfo>(&response.body) {
            Ok(created) => created,
            Err(_) => {
                let Some(name) = requested_name(entry) else {
                    return Ok(());
                };
                match self.instances.get(target).get_collection(&name).await? {
                    Some(created) => created,
                    None => return Ok(()),
                }
            }
        };

        let known_origin_id = self
            .mapper
            .get(&created.name)
            .await?
            .and_then(|m| m.id_for(origin).map(str::to_string));
        let origin_id = match known_origin_id {
            Some(id) => Some(id),
            None => self
                .instances
                .get(origin)
                .get_collection(&created.name)
                .await?
                .map(|c| c.id),
        };

        let (primary_id, replica_id) = match target {
            Instance::Primary => (Some(created.id.as_str()), origin_id.as_deref()),
            Instance::Replica => (origin_id.as_deref(), Some(created.id.as_str())),
        };
        self.mapper
            .upsert(&created.name, primary_id, replica_id, &created.creation_config())
            .await?;
        tracing::info!("Mapped collection {} after replaying its creation to {}", created.name, target);
        Ok(())
    }

    async fn forget_deleted_collection(&self, entry: &WriteLogEntry, resolution: &Resolution) -> Result<()> {
        let Some(collection) = parse_collection_path(&entry.path) else {
            return Ok(());
        };
        if collection.op != CollectionOp::Itself {
            return Ok(());
        }

        let name = match resolution {
            Resolution::Translated { collection_name, .. } => collection_name.clone(),
            Resolution::Unchanged { .. } => collection.segment,
        };
        if self.mapper.remove(&name).await? {
            tracing::info!("Removed mapping for deleted collection {}", name);
        }
        Ok(())
    }
}

/// Collection name from a create request body
fn requested_name(entry: &WriteLogEntry) -> Option<String> {
    let body: serde_json::Value = serde_json::from_slice(&entry.data).ok()?;
    body.get("name")?.as_str().map(str::to_string)
}

fn describe(entry: &WriteLogEntry, e: &Error) -> String {
    match entry.conversion_type {
        Some(conversion) => format!("{}: {}", conversion, e),
        None => e.to_string(),
    }
}

/// Store errors abort the cycle; instance errors become the entry's outcome
fn classify_error(entry: &WriteLogEntry, e: Error) -> Result<ReplayOutcome> {
    match e {
        Error::Store(_)
        | Error::InvalidTransition { .. }
        | Error::EntryNotFound(_)
        | Error::LeaseLost { .. } => Err(e),
        e if e.is_retryable() => Ok(ReplayOutcome::Retry(e.to_string())),
        e => Ok(ReplayOutcome::Failed(describe(entry, &e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancesConfig;
    use crate::db::Database;
    use crate::test_support::FakeInstance;
    use crate::wal::{ConversionType, NewWrite};
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const COLLECTIONS: &str = "/api/v2/tenants/default_tenant/databases/default_database/collections";

    struct Fixture {
        _dir: TempDir,
        primary: FakeInstance,
        replica: FakeInstance,
        store: Arc<WriteLogStore>,
        mapper: Arc<CollectionMapper>,
        engine: Arc<ReplayEngine>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let primary = FakeInstance::start().await;
        let replica = FakeInstance::start().await;

        let db = Arc::new(Database::open_path(&dir.path().join("replay.db"), Duration::from_secs(5)).unwrap());
        let store = Arc::new(WriteLogStore::new(Arc::clone(&db), 3));
        let mapper = Arc::new(CollectionMapper::new(db));
        let instances = Arc::new(
            Instances::new(&InstancesConfig {
                primary_url: primary.url(),
                replica_url: replica.url(),
                request_timeout_ms: 2_000,
                connect_timeout_ms: 1_000,
                tenant: "default_tenant".to_string(),
                database: "default_database".to_string(),
            })
            .unwrap(),
        );

        let config = ReplayConfig {
            backoff_initial_ms: 0,
            backoff_max_ms: 0,
            poll_interval_ms: 20,
            ..ReplayConfig::default()
        };
        let engine = Arc::new(ReplayEngine::new(
            Arc::clone(&store),
            Arc::clone(&mapper),
            instances,
            config,
        ));

        Fixture {
            _dir: dir,
            primary,
            replica,
            store,
            mapper,
            engine,
        }
    }

    async fn append(
        f: &Fixture,
        method: Method,
        path: String,
        target: Instance,
        body: &[u8],
        conversion_type: Option<ConversionType>,
    ) -> String {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        f.store
            .append(NewWrite {
                method,
                path,
                target_instance: target,
                data: Bytes::copy_from_slice(body),
                headers,
                conversion_type,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_add_converge_on_replica() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;
        f.mapper
            .record_instance_id("kb", Instance::Primary, &primary_id, &serde_json::Value::Null)
            .await
            .unwrap();

        append(&f, Method::Post, COLLECTIONS.to_string(), Instance::Replica, br#"{"name":"kb"}"#, None).await;
        append(
            &f,
            Method::Post,
            format!("{}/{}/add", COLLECTIONS, primary_id),
            Instance::Replica,
            br#"{"ids":["a","b"]}"#,
            Some(ConversionType::IdRemap),
        )
        .await;

        assert_eq!(f.engine.run_cycle("test").await.unwrap(), 2);

        let replica_id = f.replica.collection_id("kb").await.unwrap();
        assert_ne!(replica_id, primary_id);
        assert_eq!(f.replica.document_count("kb").await, 2);

        let mapping = f.mapper.get("kb").await.unwrap().unwrap();
        assert_eq!(mapping.primary_collection_id.as_deref(), Some(primary_id.as_str()));
        assert_eq!(mapping.replica_collection_id.as_deref(), Some(replica_id.as_str()));

        let counts = f.store.counts_by_status().await.unwrap();
        assert_eq!(counts.synced, 2);
        assert_eq!(f.engine.stats().synced, 2);
    }

    #[tokio::test]
    async fn test_unmapped_collection_is_mirrored_before_replay() {
        let f = fixture().await;
        let replica_id = f.replica.seed_collection("notes").await;

        // Accepted by the replica, never created on the primary
        append(
            &f,
            Method::Post,
            format!("{}/{}/upsert", COLLECTIONS, replica_id),
            Instance::Primary,
            br#"{"ids":["n1"]}"#,
            Some(ConversionType::IdRemap),
        )
        .await;

        f.engine.run_cycle("test").await.unwrap();

        assert_eq!(f.primary.document_count("notes").await, 1);
        let mapping = f.mapper.get("notes").await.unwrap().unwrap();
        assert!(mapping.is_complete());
        assert_eq!(mapping.replica_collection_id.as_deref(), Some(replica_id.as_str()));
    }

    #[tokio::test]
    async fn test_phantom_delete_fails_without_sending() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;
        let replica_id = f.replica.seed_collection("kb").await;
        f.mapper
            .upsert("kb", Some(&primary_id), Some(&replica_id), &serde_json::Value::Null)
            .await
            .unwrap();
        f.replica.drop_collection("kb").await;

        let id = append(
            &f,
            Method::Post,
            format!("{}/{}/delete", COLLECTIONS, primary_id),
            Instance::Replica,
            br#"{"ids":["a"]}"#,
            Some(ConversionType::DeleteIdRemap),
        )
        .await;

        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        let message = entry.error_message.unwrap();
        assert!(message.starts_with("delete_id_remap:"), "{}", message);
        assert!(message.contains("Phantom"), "{}", message);

        let sent_delete = f
            .replica
            .requests()
            .await
            .iter()
            .any(|r| r.starts_with("POST") && r.ends_with("/delete"));
        assert!(!sent_delete);
    }

    #[tokio::test]
    async fn test_unmapped_delete_fails_terminally() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;

        let id = append(
            &f,
            Method::Post,
            format!("{}/{}/delete", COLLECTIONS, primary_id),
            Instance::Replica,
            br#"{"ids":["a"]}"#,
            Some(ConversionType::DeleteIdRemap),
        )
        .await;

        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        // No collection was mirrored just to delete from it
        assert!(f.replica.collection_id("kb").await.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries_then_reset() {
        let f = fixture().await;
        f.replica.set_down(true).await;

        let id = append(&f, Method::Post, COLLECTIONS.to_string(), Instance::Replica, br#"{"name":"kb"}"#, None).await;

        for attempt in 1..=3u32 {
            f.engine.run_cycle("test").await.unwrap();
            let entry = f.store.get(&id).await.unwrap().unwrap();
            assert_eq!(entry.retry_count, attempt);
        }

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        assert!(entry.error_message.unwrap().contains("503"));

        // Nothing left to claim
        assert_eq!(f.engine.run_cycle("test").await.unwrap(), 0);

        f.replica.set_down(false).await;
        assert_eq!(f.store.reset_failed(Some(&id)).await.unwrap(), 1);
        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Synced);
        assert!(f.replica.collection_id("kb").await.is_some());
    }

    #[tokio::test]
    async fn test_read_race_is_deferred_without_penalty() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;
        let not_yet_visible = uuid::Uuid::new_v4().to_string();
        f.mapper
            .upsert("kb", Some(&primary_id), Some(&not_yet_visible), &serde_json::Value::Null)
            .await
            .unwrap();

        let id = append(
            &f,
            Method::Post,
            format!("{}/{}/query", COLLECTIONS, primary_id),
            Instance::Replica,
            b"{}",
            Some(ConversionType::IdRemap),
        )
        .await;

        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Executed);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.error_message.unwrap().contains("not yet visible"));
        assert_eq!(f.engine.stats().deferred, 1);
    }

    #[tokio::test]
    async fn test_phantom_target_on_write_fails() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;
        f.mapper
            .upsert(
                "kb",
                Some(&primary_id),
                Some(&uuid::Uuid::new_v4().to_string()),
                &serde_json::Value::Null,
            )
            .await
            .unwrap();

        let id = append(
            &f,
            Method::Post,
            format!("{}/{}/add", COLLECTIONS, primary_id),
            Instance::Replica,
            br#"{"ids":["a"]}"#,
            Some(ConversionType::IdRemap),
        )
        .await;

        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        assert!(entry.error_message.unwrap().starts_with("id_remap:"));
    }

    #[tokio::test]
    async fn test_payload_bytes_sent_unchanged() {
        let f = fixture().await;
        // NULs and byte sequences that are not valid UTF-8
        let mut body: Vec<u8> = vec![0x00, 0xff, 0xfe, 0xc3, 0x28, 0x00];
        body.extend((0..=255u8).cycle().take(70_000));
        assert!(std::str::from_utf8(&body).is_err());

        let id = append(&f, Method::Post, "/echo".to_string(), Instance::Primary, &body, None).await;
        f.engine.run_cycle("test").await.unwrap();

        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, WriteStatus::Synced);
        assert_eq!(&stored.data[..], body.as_slice());
        let received = f.primary.last_body().await.unwrap();
        assert_eq!(&received[..], body.as_slice());
    }

    #[tokio::test]
    async fn test_collection_delete_removes_mapping() {
        let f = fixture().await;
        let primary_id = f.primary.seed_collection("kb").await;
        let replica_id = f.replica.seed_collection("kb").await;
        f.mapper
            .upsert("kb", Some(&primary_id), Some(&replica_id), &serde_json::Value::Null)
            .await
            .unwrap();

        append(&f, Method::Delete, format!("{}/kb", COLLECTIONS), Instance::Replica, b"", None).await;
        f.engine.run_cycle("test").await.unwrap();

        assert!(f.replica.collection_id("kb").await.is_none());
        assert!(f.mapper.get("kb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_named_delete_of_missing_collection_fails() {
        let f = fixture().await;

        let id = append(&f, Method::Delete, format!("{}/ghost", COLLECTIONS), Instance::Replica, b"", None).await;
        f.engine.run_cycle("test").await.unwrap();

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Failed);
        assert_eq!(entry.conversion_type, None);
        let message = entry.error_message.unwrap();
        assert!(message.starts_with("delete target "), "{}", message);
        assert!(message.contains("not treated as applied"));
    }

    #[tokio::test]
    async fn test_only_transient_errors_are_retried() {
        let f = fixture().await;
        let id = append(&f, Method::Post, "/echo".to_string(), Instance::Replica, b"{}", None).await;
        let entry = f.store.get(&id).await.unwrap().unwrap();

        let unavailable = Error::InstanceStatus {
            instance: Instance::Replica,
            status: 503,
            body: String::new(),
        };
        assert!(matches!(classify_error(&entry, unavailable), Ok(ReplayOutcome::Retry(_))));
        let timeout = Error::Timeout(Instance::Replica);
        assert!(matches!(classify_error(&entry, timeout), Ok(ReplayOutcome::Retry(_))));

        let rejected = Error::InstanceStatus {
            instance: Instance::Replica,
            status: 422,
            body: "bad embedding".to_string(),
        };
        assert!(matches!(classify_error(&entry, rejected), Ok(ReplayOutcome::Failed(_))));
        let malformed = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        assert!(matches!(classify_error(&entry, malformed.into()), Ok(ReplayOutcome::Failed(_))));
        let internal = Error::Internal("bug".to_string());
        assert!(matches!(classify_error(&entry, internal), Ok(ReplayOutcome::Failed(_))));

        let store = Error::Store("locked".to_string());
        assert!(classify_error(&entry, store).is_err());
    }

    #[tokio::test]
    async fn test_worker_that_lost_its_lease_does_not_replay() {
        let f = fixture().await;
        let id = append(&f, Method::Post, "/echo".to_string(), Instance::Replica, b"hello", None).await;

        let stale = f
            .store
            .claim_batch(None, 10, "stale", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = f
            .store
            .claim_batch(None, 10, "fresh", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(fresh[0].write_id, id);

        let entry = stale.into_iter().next().unwrap();
        let outcome = f.engine.process(entry, "stale").await.unwrap();
        assert!(outcome.is_none());
        assert!(f.replica.requests().await.is_empty());

        let entry = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, WriteStatus::Executed);
        assert_eq!(entry.retry_count, 0);
        f.store.mark_synced(&id, "fresh").await.unwrap();
    }

    #[tokio::test]
    async fn test_workers_drain_log_and_stop() {
        let f = fixture().await;
        let id = append(&f, Method::Post, "/echo".to_string(), Instance::Replica, b"hello", None).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = f.engine.spawn_workers(shutdown_rx);

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entry = f.store.get(&id).await.unwrap().unwrap();
                if entry.status == WriteStatus::Synced {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(synced.is_ok());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
