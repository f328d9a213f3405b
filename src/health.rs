//! Instance Health Tracking
//!
//! Checks both instances on an interval and records which are up.
//! The front door reads this to pick where a request goes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::instance::Instances;
use crate::wal::Instance;

#[derive(Debug)]
struct InstanceHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl InstanceHealth {
    fn new() -> Self {
        // Optimistic until the first heartbeat says otherwise
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }
}

/// Health snapshot for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub primary_healthy: bool,
    pub replica_healthy: bool,
    pub primary_consecutive_failures: u32,
    pub replica_consecutive_failures: u32,
}

/// Up/down view of both instances
#[derive(Debug)]
pub struct HealthTracker {
    primary: InstanceHealth,
    replica: InstanceHealth,
    failure_threshold: u32,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            primary: InstanceHealth::new(),
            replica: InstanceHealth::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    fn slot(&self, instance: Instance) -> &InstanceHealth {
        match instance {
            Instance::Primary => &self.primary,
            Instance::Replica => &self.replica,
        }
    }

    pub fn is_healthy(&self, instance: Instance) -> bool {
        self.slot(instance).healthy.load(Ordering::Relaxed)
    }

    /// Record a successful heartbeat or request
    pub fn record_success(&self, instance: Instance) {
        let slot = self.slot(instance);
        slot.consecutive_failures.store(0, Ordering::Relaxed);
        if !slot.healthy.swap(true, Ordering::Relaxed) {
            tracing::info!("Instance {} is back up", instance);
        }
    }

    /// Record a failed heartbeat or request
    pub fn record_failure(&self, instance: Instance) {
        let slot = self.slot(instance);
        let failures = slot.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold && slot.healthy.swap(false, Ordering::Relaxed) {
            tracing::warn!("Instance {} marked down after {} failed heartbeats", instance, failures);
        }
    }

    /// Instances to try for a request, preferred first.
    ///
    /// The primary is preferred; an instance marked down is only tried
    /// after the healthy one.
    pub fn routing_order(&self) -> [Instance; 2] {
        if !self.is_healthy(Instance::Primary) && self.is_healthy(Instance::Replica) {
            [Instance::Replica, Instance::Primary]
        } else {
            [Instance::Primary, Instance::Replica]
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            primary_healthy: self.is_healthy(Instance::Primary),
            replica_healthy: self.is_healthy(Instance::Replica),
            primary_consecutive_failures: self.primary.consecutive_failures.load(Ordering::Relaxed),
            replica_consecutive_failures: self.replica.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Check both instances once
    pub async fn check_once(&self, instances: &Instances) {
        for instance in Instance::ALL {
            match instances.get(instance).heartbeat().await {
                Ok(()) => self.record_success(instance),
                Err(e) => {
                    tracing::debug!("Heartbeat to {} failed: {}", instance, e);
                    self.record_failure(instance);
                }
            }
        }
    }

    /// Heartbeat loop; exits when `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        instances: Arc<Instances>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Health check loop started ({:?} interval)", interval);
        loop {
            self.check_once(&instances).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health check loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancesConfig;
    use crate::test_support::FakeInstance;

    #[test]
    fn test_threshold_before_marking_down() {
        let health = HealthTracker::new(2);
        health.record_failure(Instance::Primary);
        assert!(health.is_healthy(Instance::Primary));
        health.record_failure(Instance::Primary);
        assert!(!health.is_healthy(Instance::Primary));
        assert_eq!(health.routing_order(), [Instance::Replica, Instance::Primary]);

        health.record_success(Instance::Primary);
        assert!(health.is_healthy(Instance::Primary));
        assert_eq!(health.routing_order(), [Instance::Primary, Instance::Replica]);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_down_instance() {
        let primary = FakeInstance::start().await;
        let replica = FakeInstance::start().await;
        replica.set_down(true).await;

        let instances = Instances::new(&InstancesConfig {
            primary_url: primary.url(),
            replica_url: replica.url(),
            request_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            tenant: "default_tenant".to_string(),
            database: "default_database".to_string(),
        })
        .unwrap();

        let health = HealthTracker::new(1);
        health.check_once(&instances).await;
        let snapshot = health.snapshot();
        assert!(snapshot.primary_healthy);
        assert!(!snapshot.replica_healthy);
    }
}
