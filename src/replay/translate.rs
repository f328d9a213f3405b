//! Path translation for replay.
//!
//! A path captured on the origin instance may embed the origin's id for a
//! collection. Before replay that id is swapped for the target's id,
//! mirroring the collection to the target first when it was never
//! created there.

use std::sync::Arc;

use crate::classifier::{parse_collection_path, replace_collection_segment};
use crate::error::{Error, Result};
use crate::instance::Instances;
use crate::mapping::CollectionMapper;
use crate::wal::{Instance, WriteLogEntry};

/// Where a replay must be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Path carries no instance-local id
    Unchanged { path: String },
    /// Origin id replaced with the target id
    Translated {
        path: String,
        collection_name: String,
        target_id: String,
    },
}

impl Resolution {
    pub fn path(&self) -> &str {
        match self {
            Resolution::Unchanged { path } | Resolution::Translated { path, .. } => path,
        }
    }
}

/// Resolves destination paths using the mapper and, when needed, the origin instance
pub struct Translator {
    mapper: Arc<CollectionMapper>,
    instances: Arc<Instances>,
}

impl Translator {
    pub fn new(mapper: Arc<CollectionMapper>, instances: Arc<Instances>) -> Self {
        Self { mapper, instances }
    }

    /// Resolve the destination path for an entry.
    ///
    /// With `auto_create`, an unmapped collection is mirrored to the
    /// target and resolution is tried once more.
    pub async fn resolve(&self, entry: &WriteLogEntry, auto_create: bool) -> Result<Resolution> {
        let Some(collection) = parse_collection_path(&entry.path).filter(|c| c.is_local_id) else {
            return Ok(Resolution::Unchanged {
                path: entry.path.clone(),
            });
        };

        let origin = entry.origin_instance();
        match self.mapper.translate(origin, &collection.segment).await {
            Ok((mapping, target_id)) => translated(entry, mapping.collection_name, target_id),
            Err(Error::MappingMissing { .. }) if auto_create => {
                self.mirror_collection(origin, &collection.segment).await?;
                let (mapping, target_id) = self.mapper.translate(origin, &collection.segment).await?;
                translated(entry, mapping.collection_name, target_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Create the origin's collection on the other instance and map both ids
    pub async fn mirror_collection(&self, origin: Instance, origin_id: &str) -> Result<()> {
        let target = origin.other();
        let source = self
            .instances
            .get(origin)
            .collection_by_id(origin_id)
            .await?
            .ok_or_else(|| Error::MappingMissing {
                collection: origin_id.to_string(),
                instance: target,
            })?;

        tracing::info!(
            "Collection {} ({}) is not mapped on {}, mirroring it",
            source.name,
            origin_id,
            target
        );

        let created = self
            .instances
            .get(target)
            .create_collection(&source.name, source.metadata.as_ref(), source.configuration.as_ref())
            .await?;

        let (primary_id, replica_id) = match origin {
            Instance::Primary => (source.id.as_str(), created.id.as_str()),
            Instance::Replica => (created.id.as_str(), source.id.as_str()),
        };
        self.mapper
            .upsert(&source.name, Some(primary_id), Some(replica_id), &source.creation_config())
            .await?;
        Ok(())
    }

    /// Confirm the target id still exists; `PhantomMapping` when it does not
    pub async fn verify_target(&self, target: Instance, collection_name: &str, target_id: &str) -> Result<()> {
        match self.instances.get(target).collection_by_id(target_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::PhantomMapping {
                collection: collection_name.to_string(),
                id: target_id.to_string(),
                instance: target,
            }),
        }
    }
}

fn translated(entry: &WriteLogEntry, collection_name: String, target_id: String) -> Result<Resolution> {
    let path = replace_collection_segment(&entry.path, &target_id).ok_or_else(|| {
        Error::Internal(format!("no collection segment in {}", entry.path))
    })?;
    Ok(Resolution::Translated {
        path,
        collection_name,
        target_id,
    })
}
