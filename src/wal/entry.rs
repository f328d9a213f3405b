//! Write Log Entry Types
//!
//! Defines the records kept in the write log: one per accepted write
//! that still has to reach the instance which did not receive it.

use std::collections::BTreeMap;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One of the two database instances behind the front door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instance {
    Primary,
    Replica,
}

impl Instance {
    /// The instance on the other side
    pub fn other(self) -> Instance {
        match self {
            Instance::Primary => Instance::Replica,
            Instance::Replica => Instance::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Instance::Primary => "primary",
            Instance::Replica => "replica",
        }
    }

    pub const ALL: [Instance; 2] = [Instance::Primary, Instance::Replica];
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Instance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Instance::Primary),
            "replica" => Ok(Instance::Replica),
            other => Err(Error::Store(format!("unknown instance '{}'", other))),
        }
    }
}

/// HTTP verbs that mutate an instance
///
/// GET-like verbs are never logged, so they have no representation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Map an incoming request verb, returning None for read-only verbs
    pub fn from_http(method: &axum::http::Method) -> Option<Method> {
        match *method {
            axum::http::Method::POST => Some(Method::Post),
            axum::http::Method::PUT => Some(Method::Put),
            axum::http::Method::PATCH => Some(Method::Patch),
            axum::http::Method::DELETE => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Verb for the outgoing replay request
    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(Error::Store(format!("unknown method '{}'", other))),
        }
    }
}

/// Replication lifecycle state of a write log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Captured, never attempted
    Pending,
    /// Claimed at least once by a replay worker
    Executed,
    /// Applied to the target instance
    Synced,
    /// Gave up; needs an operator
    Failed,
    /// Marked for removal by older tooling; never produced by the engine
    CleanupPending,
}

impl WriteStatus {
    pub const ALL: [WriteStatus; 5] = [
        WriteStatus::Pending,
        WriteStatus::Executed,
        WriteStatus::Synced,
        WriteStatus::Failed,
        WriteStatus::CleanupPending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WriteStatus::Pending => "pending",
            WriteStatus::Executed => "executed",
            WriteStatus::Synced => "synced",
            WriteStatus::Failed => "failed",
            WriteStatus::CleanupPending => "cleanup_pending",
        }
    }

    /// Whether retention cleanup may remove the entry
    pub fn is_terminal(self) -> bool {
        match self {
            WriteStatus::Synced | WriteStatus::Failed | WriteStatus::CleanupPending => true,
            WriteStatus::Pending | WriteStatus::Executed => false,
        }
    }

    /// The full transition table.
    ///
    /// `Executed -> Executed` is a re-claim after a transient failure.
    /// `Failed -> Pending` is only reachable through a manual reset.
    pub fn can_transition_to(self, next: WriteStatus) -> bool {
        use WriteStatus::*;
        match (self, next) {
            (Pending, Executed) => true,
            (Executed, Executed) => true,
            (Executed, Synced) => true,
            (Pending, Failed) | (Executed, Failed) => true,
            (Failed, Pending) => true,
            (Pending, _) | (Executed, _) | (Synced, _) | (Failed, _) | (CleanupPending, _) => false,
        }
    }

    /// Check a transition, naming the entry on failure
    pub fn transition(self, next: WriteStatus, write_id: &str) -> Result<WriteStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                write_id: write_id.to_string(),
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WriteStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Store(format!("unknown write status '{}'", s)))
    }
}

/// Why an entry needs identifier translation before replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    /// Path embeds an origin-local collection id
    IdRemap,
    /// Delete addressing an origin-local collection id
    DeleteIdRemap,
}

impl ConversionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionType::IdRemap => "id_remap",
            ConversionType::DeleteIdRemap => "delete_id_remap",
        }
    }
}

impl std::fmt::Display for ConversionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "id_remap" => Ok(ConversionType::IdRemap),
            "delete_id_remap" => Ok(ConversionType::DeleteIdRemap),
            other => Err(Error::Store(format!("unknown conversion type '{}'", other))),
        }
    }
}

/// A write as captured, before the store assigns an id
#[derive(Debug, Clone)]
pub struct NewWrite {
    pub method: Method,
    pub path: String,
    pub target_instance: Instance,
    pub data: Bytes,
    pub headers: BTreeMap<String, String>,
    pub conversion_type: Option<ConversionType>,
}

/// A persisted write log entry
#[derive(Debug, Clone)]
pub struct WriteLogEntry {
    pub write_id: String,
    pub method: Method,
    pub path: String,
    pub target_instance: Instance,
    pub status: WriteStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    /// Exact request body; owned so its length is the transmitted length
    pub data: Bytes,
    pub headers: BTreeMap<String, String>,
    pub conversion_type: Option<ConversionType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WriteLogEntry {
    /// The instance that accepted the original write
    pub fn origin_instance(&self) -> Instance {
        self.target_instance.other()
    }

    /// Body size in bytes
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }

    /// Serializable view without the body
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            write_id: self.write_id.clone(),
            method: self.method,
            path: self.path.clone(),
            target_instance: self.target_instance,
            status: self.status,
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
            data_len: self.payload_len(),
            conversion_type: self.conversion_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Entry view returned by the operator API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub write_id: String,
    pub method: Method,
    pub path: String,
    pub target_instance: Instance,
    pub status: WriteStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub data_len: usize,
    pub conversion_type: Option<ConversionType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
