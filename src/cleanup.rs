//! Retention Task
//!
//! Periodically deletes terminal write log entries past their retention.
//! Pending and executed entries are never touched.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::wal::{WriteLogStore, WriteStatus};

/// Rows removed by one retention run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub synced_deleted: u64,
    pub failed_deleted: u64,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.synced_deleted + self.failed_deleted
    }
}

pub struct RetentionTask {
    store: Arc<WriteLogStore>,
    config: CleanupConfig,
}

impl RetentionTask {
    pub fn new(store: Arc<WriteLogStore>, config: CleanupConfig) -> Self {
        Self { store, config }
    }

    /// Apply both retention windows once
    pub async fn run_once(&self) -> Result<RetentionReport> {
        let synced_deleted = self
            .store
            .cleanup(
                hours(self.config.synced_retention_hours),
                &[WriteStatus::Synced, WriteStatus::CleanupPending],
            )
            .await?;

        // Failed entries wait for an operator unless a window is set
        let failed_deleted = if self.config.failed_retention_hours > 0 {
            self.store
                .cleanup(hours(self.config.failed_retention_hours), &[WriteStatus::Failed])
                .await?
        } else {
            0
        };

        let report = RetentionReport {
            synced_deleted,
            failed_deleted,
        };
        if report.total() > 0 {
            tracing::info!(
                "Retention removed {} synced and {} failed entries",
                synced_deleted,
                failed_deleted
            );
        }
        Ok(report)
    }

    /// Retention loop; exits when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Retention task started ({:?} interval)", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!("Retention run failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Retention task stopped");
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3_600))
}
