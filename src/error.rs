//! vecmirror Error Types

use thiserror::Error;

use crate::wal::{Instance, WriteStatus};

/// Result type alias for vecmirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// vecmirror error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Write log errors
    #[error("Write log store error: {0}")]
    Store(String),

    #[error("Write log entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry {write_id} is no longer leased to {owner} (held by {holder})")]
    LeaseLost {
        write_id: String,
        owner: String,
        holder: String,
    },

    #[error("Illegal status transition for {write_id}: {from} -> {to}")]
    InvalidTransition {
        write_id: String,
        from: WriteStatus,
        to: WriteStatus,
    },

    // Mapping errors
    #[error("No mapping found for collection {collection} on {instance}")]
    MappingMissing { collection: String, instance: Instance },

    #[error("Phantom mapping for collection {collection}: id {id} no longer exists on {instance}")]
    PhantomMapping {
        collection: String,
        id: String,
        instance: Instance,
    },

    // Instance errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{instance} returned {status}: {body}")]
    InstanceStatus {
        instance: Instance,
        status: u16,
        body: String,
    },

    #[error("Request to {0} timed out")]
    Timeout(Instance),

    #[error("Unexpected response from {instance}: {reason}")]
    InvalidResponse { instance: Instance, reason: String },

    // Encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is worth another replay attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout(_) | Error::InvalidResponse { .. } => true,
            Error::InstanceStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if this error is about collection id translation rather than transport
    pub fn is_mapping_error(&self) -> bool {
        matches!(self, Error::MappingMissing { .. } | Error::PhantomMapping { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}
