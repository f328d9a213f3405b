//! Capture Filter
//!
//! Runs after the front door has had a write accepted by one instance and
//! logs it for the instance that did not receive it. Capture is symmetric:
//! a write accepted by either side produces exactly one entry aimed at the
//! other side.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;

use crate::classifier::{is_collection_list, parse_collection_path, CollectionOp};
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::instance::CollectionInfo;
use crate::mapping::CollectionMapper;
use crate::replay::RetryPolicy;
use crate::wal::{ConversionType, Instance, Method, NewWrite, WriteLogStore};

/// Headers carried into the log; everything else is dropped
pub const REPLAY_HEADERS: [&str; 5] = [
    "content-type",
    "accept",
    "authorization",
    "x-chroma-token",
    "content-encoding",
];

/// A write an instance has accepted
#[derive(Debug, Clone)]
pub struct AcceptedWrite {
    pub method: axum::http::Method,
    /// Path plus query string, as the client sent it
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the filter decided for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDecision {
    pub method: Method,
    pub conversion_type: Option<ConversionType>,
}

/// Decides whether and how accepted writes are logged
pub struct CaptureFilter {
    store: Arc<WriteLogStore>,
    mapper: Arc<CollectionMapper>,
    append_policy: RetryPolicy,
    config: CaptureConfig,
    /// Accepted writes that could not be logged at all
    failures: AtomicU64,
}

impl CaptureFilter {
    pub fn new(store: Arc<WriteLogStore>, mapper: Arc<CollectionMapper>, config: CaptureConfig) -> Self {
        let append_policy = RetryPolicy {
            initial_delay: Duration::from_millis(config.append_backoff_initial_ms),
            max_delay: Duration::from_millis(config.append_backoff_max_ms),
            ..RetryPolicy::default()
        };
        Self {
            store,
            mapper,
            append_policy,
            config,
            failures: AtomicU64::new(0),
        }
    }

    /// Number of accepted writes that never reached the write log
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Whether a request must be logged, and with which conversion
    pub fn decide(&self, method: &axum::http::Method, path: &str) -> Option<CaptureDecision> {
        let method = Method::from_http(method)?;
        let collection = parse_collection_path(path);

        if let Some(ref c) = collection {
            if c.op.is_read() && !self.config.capture_read_operations {
                return None;
            }
        }

        let conversion_type = collection.filter(|c| c.is_local_id).map(|c| {
            if method == Method::Delete || c.op == CollectionOp::Delete {
                ConversionType::DeleteIdRemap
            } else {
                ConversionType::IdRemap
            }
        });

        Some(CaptureDecision {
            method,
            conversion_type,
        })
    }

    /// Log an accepted write for the instance that did not receive it.
    ///
    /// Returns the new entry id, or None when the request is not a
    /// replicated write. A failing append is retried with backoff; once
    /// the attempts are spent the write is counted in [`Self::failures`]
    /// and logged with everything needed to replay it by hand.
    pub async fn capture(&self, write: &AcceptedWrite, received_by: Instance) -> Result<Option<String>> {
        let Some(decision) = self.decide(&write.method, &write.path) else {
            return Ok(None);
        };

        let target = received_by.other();
        let new_write = NewWrite {
            method: decision.method,
            path: write.path.clone(),
            target_instance: target,
            data: write.body.clone(),
            headers: filter_headers(&write.headers),
            conversion_type: decision.conversion_type,
        };

        let attempts = self.config.append_attempts.max(1);
        let mut attempt = 0;
        let write_id = loop {
            attempt += 1;
            match self.store.append(new_write.clone()).await {
                Ok(write_id) => break write_id,
                Err(e) if attempt < attempts => {
                    let delay = self.append_policy.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        "Logging {} {} for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        decision.method,
                        write.path,
                        target,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "{} {} ({} bytes) accepted by {} was NOT logged after {} attempts; replay it to {} by hand: {}",
                        decision.method,
                        write.path,
                        write.body.len(),
                        received_by,
                        attempts,
                        target,
                        e
                    );
                    return Err(e);
                }
            }
        };

        tracing::info!(
            "Captured {} {} accepted by {} for {} as {}",
            decision.method,
            write.path,
            received_by,
            target,
            write_id
        );
        Ok(Some(write_id))
    }

    /// Learn the id an instance gave a collection it just created.
    ///
    /// Only successful collection-create responses are considered.
    pub async fn observe_response(
        &self,
        write: &AcceptedWrite,
        received_by: Instance,
        status: u16,
        body: &[u8],
    ) -> Result<()> {
        if write.method != axum::http::Method::POST
            || !is_collection_list(&write.path)
            || !(200..300).contains(&status)
        {
            return Ok(());
        }

        match serde_json::from_slice::<CollectionInfo>(body) {
            Ok(created) => {
                self.mapper
                    .record_instance_id(&created.name, received_by, &created.id, &created.creation_config())
                    .await?;
            }
            Err(e) => {
                tracing::warn!("Could not read created collection from {}: {}", received_by, e);
            }
        }
        Ok(())
    }
}

/// Keep only the headers needed to replay the request
pub fn filter_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| REPLAY_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
