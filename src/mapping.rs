//! Collection Identity Mapper
//!
//! Each instance assigns its own opaque id to a collection. The mapping
//! table ties those ids to the caller-visible collection name so a path
//! captured on one instance can be replayed on the other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{decode_ts, encode_ts, Database};
use crate::error::{Error, Result};
use crate::wal::Instance;

/// One collection as known on both instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub collection_name: String,
    pub primary_collection_id: Option<String>,
    pub replica_collection_id: Option<String>,
    /// Creation parameters (metadata and configuration), kept identical on both sides
    pub collection_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionMapping {
    /// The id on one instance, if that side has been observed
    pub fn id_for(&self, instance: Instance) -> Option<&str> {
        match instance {
            Instance::Primary => self.primary_collection_id.as_deref(),
            Instance::Replica => self.replica_collection_id.as_deref(),
        }
    }

    /// Both sides known
    pub fn is_complete(&self) -> bool {
        self.primary_collection_id.is_some() && self.replica_collection_id.is_some()
    }
}

const MAPPING_COLUMNS: &str = "collection_name, primary_collection_id, replica_collection_id, \
     collection_config, created_at, updated_at";

type MappingRow = (String, Option<String>, Option<String>, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MappingRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_mapping(row: MappingRow) -> Result<CollectionMapping> {
    let (collection_name, primary_collection_id, replica_collection_id, config, created, updated) =
        row;
    Ok(CollectionMapping {
        collection_config: serde_json::from_str(&config)?,
        created_at: decode_ts(&created)?,
        updated_at: decode_ts(&updated)?,
        collection_name,
        primary_collection_id,
        replica_collection_id,
    })
}

/// SQLite-backed mapping between collection names and per-instance ids
pub struct CollectionMapper {
    db: Arc<Database>,
}

impl CollectionMapper {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update the mapping for `collection_name`.
    ///
    /// An id passed as `None` keeps whatever is already stored for that
    /// side. A `null` config keeps the stored config.
    pub async fn upsert(
        &self,
        collection_name: &str,
        primary_id: Option<&str>,
        replica_id: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<CollectionMapping> {
        let now = encode_ts(Utc::now());
        let config_text = if config.is_null() {
            None
        } else {
            Some(serde_json::to_string(config)?)
        };

        let conn = self.db.lock().await;
        conn.execute(
            r#"
            INSERT INTO collection_mappings (
                collection_name, primary_collection_id, replica_collection_id,
                collection_config, created_at, updated_at
            ) VALUES (?1, ?2, ?3, COALESCE(?4, '{}'), ?5, ?5)
            ON CONFLICT(collection_name) DO UPDATE SET
                primary_collection_id = COALESCE(?2, primary_collection_id),
                replica_collection_id = COALESCE(?3, replica_collection_id),
                collection_config = COALESCE(?4, collection_config),
                updated_at = ?5
            "#,
            params![collection_name, primary_id, replica_id, config_text, now],
        )?;

        let row = conn.query_row(
            &format!(
                "SELECT {} FROM collection_mappings WHERE collection_name = ?1",
                MAPPING_COLUMNS
            ),
            params![collection_name],
            read_row,
        )?;
        drop(conn);

        let mapping = into_mapping(row)?;
        tracing::debug!(
            "Mapping {}: primary={:?} replica={:?}",
            mapping.collection_name,
            mapping.primary_collection_id,
            mapping.replica_collection_id
        );
        Ok(mapping)
    }

    /// Record the id one instance assigned to a collection
    pub async fn record_instance_id(
        &self,
        collection_name: &str,
        instance: Instance,
        id: &str,
        config: &serde_json::Value,
    ) -> Result<CollectionMapping> {
        match instance {
            Instance::Primary => self.upsert(collection_name, Some(id), None, config).await,
            Instance::Replica => self.upsert(collection_name, None, Some(id), config).await,
        }
    }

    /// Resolve the id a collection has on `instance`
    pub async fn resolve(&self, collection_name: &str, instance: Instance) -> Result<String> {
        self.get(collection_name)
            .await?
            .and_then(|m| m.id_for(instance).map(str::to_string))
            .ok_or_else(|| Error::MappingMissing {
                collection: collection_name.to_string(),
                instance,
            })
    }

    /// Find the mapping that owns an instance-local id
    pub async fn find_by_instance_id(
        &self,
        instance: Instance,
        id: &str,
    ) -> Result<Option<CollectionMapping>> {
        let column = match instance {
            Instance::Primary => "primary_collection_id",
            Instance::Replica => "replica_collection_id",
        };
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM collection_mappings WHERE {} = ?1",
                    MAPPING_COLUMNS, column
                ),
                params![id],
                read_row,
            )
            .optional()?;
        row.map(into_mapping).transpose()
    }

    /// Translate an id from one instance to the other.
    ///
    /// `MappingMissing` when the origin id is unknown or the target side
    /// has never been observed.
    pub async fn translate(&self, origin: Instance, id: &str) -> Result<(CollectionMapping, String)> {
        let mapping = self
            .find_by_instance_id(origin, id)
            .await?
            .ok_or_else(|| Error::MappingMissing {
                collection: id.to_string(),
                instance: origin.other(),
            })?;

        let target_id = mapping
            .id_for(origin.other())
            .map(str::to_string)
            .ok_or_else(|| Error::MappingMissing {
                collection: mapping.collection_name.clone(),
                instance: origin.other(),
            })?;

        Ok((mapping, target_id))
    }

    pub async fn get(&self, collection_name: &str) -> Result<Option<CollectionMapping>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM collection_mappings WHERE collection_name = ?1",
                    MAPPING_COLUMNS
                ),
                params![collection_name],
                read_row,
            )
            .optional()?;
        row.map(into_mapping).transpose()
    }

    /// All mappings, by name
    pub async fn list(&self) -> Result<Vec<CollectionMapping>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM collection_mappings ORDER BY collection_name",
            MAPPING_COLUMNS
        ))?;
        let rows = stmt.query_map([], read_row)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(into_mapping(row?)?);
        }
        Ok(mappings)
    }

    /// Drop the mapping for a deleted collection
    pub async fn remove(&self, collection_name: &str) -> Result<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM collection_mappings WHERE collection_name = ?1",
            params![collection_name],
        )?;
        Ok(deleted > 0)
    }
}
