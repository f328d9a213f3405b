//! vecmirror - WAL-mediated replication for a pair of vector database instances
//!
//! vecmirror fronts a primary and a replica instance of a document/vector
//! database with one endpoint. Writes accepted by either instance while the
//! other is unreachable are recorded in a durable write log and replayed
//! onto the instance that missed them.
//!
//! # Architecture
//!
//! The front door forwards each request to a healthy instance and hands
//! accepted writes to the capture filter, which logs them for the other
//! side. Replay workers claim pending entries, translate instance-local
//! collection ids through the collection mapper, and re-issue the write
//! against its target with retry and backoff.
//!
//! # Features
//!
//! - SQLite-backed write log with atomic, lease-based claims
//! - Collection name to per-instance id mapping, with auto-mirroring of
//!   collections created on one side only
//! - Delete replay that never treats an unresolved target as applied
//! - Byte-exact payload replay
//! - Operator HTTP API for status, cleanup, reset and mapping repair

pub mod api;
pub mod capture;
pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod instance;
pub mod mapping;
pub mod proxy;
pub mod replay;
pub mod wal;

#[cfg(test)]
mod test_support;

pub use config::VecMirrorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capture::CaptureFilter;
    pub use crate::config::VecMirrorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::mapping::{CollectionMapper, CollectionMapping};
    pub use crate::replay::{ReplayEngine, ReplayOutcome};
    pub use crate::wal::{Instance, WriteLogEntry, WriteLogStore, WriteStatus};
}
