//! Deletion Converter
//!
//! Deletes are replayed like any write, with one rule: the target-side
//! collection must be resolved and confirmed before the delete is sent.
//! A delete that cannot find its target fails; it is never counted as
//! already applied, since that leaves one instance cleaned and the other
//! not.

use std::sync::Arc;

use crate::classifier::{parse_collection_path, CollectionOp};
use crate::error::{Error, Result};
use crate::wal::{Method, WriteLogEntry};

use super::translate::{Resolution, Translator};

pub struct DeletionConverter {
    translator: Arc<Translator>,
}

impl DeletionConverter {
    pub fn new(translator: Arc<Translator>) -> Self {
        Self { translator }
    }

    /// Whether an entry removes data (collection delete or document delete)
    pub fn applies_to(entry: &WriteLogEntry) -> bool {
        entry.method == Method::Delete
            || parse_collection_path(&entry.path).is_some_and(|c| c.op == CollectionOp::Delete)
    }

    /// Resolve a delete's destination path, without mirroring collections.
    ///
    /// Name-addressed deletes pass through unchanged. Id-addressed deletes
    /// need a mapping whose target id still exists on the target.
    pub async fn resolve(&self, entry: &WriteLogEntry) -> Result<Resolution> {
        let resolution = self
            .translator
            .resolve(entry, false)
            .await
            .map_err(|e| annotate(entry, e))?;

        if let Resolution::Translated {
            ref collection_name,
            ref target_id,
            ..
        } = resolution
        {
            self.translator
                .verify_target(entry.target_instance, collection_name, target_id)
                .await
                .map_err(|e| annotate(entry, e))?;
        }

        Ok(resolution)
    }

    /// Error text for a delete whose target answered "not found"
    pub fn not_found_message(entry: &WriteLogEntry, path: &str) -> String {
        let message = format!(
            "delete target {} not found on {}; not treated as applied",
            path, entry.target_instance
        );
        match entry.conversion_type {
            Some(conversion) => format!("{}: {}", conversion, message),
            None => message,
        }
    }
}

fn annotate(entry: &WriteLogEntry, e: Error) -> Error {
    if e.is_mapping_error() {
        tracing::warn!(
            "Delete {} for {} cannot resolve its collection: {}",
            entry.write_id,
            entry.target_instance,
            e
        );
    }
    e
}
