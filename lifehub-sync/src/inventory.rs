//! Reference inventory
//!
//! Enumerates every record pointing at a given entity, across a pluggable
//! registry of per-collection reference descriptors. Strictly read-only:
//! the same inventory is shown to the user at proposal time and re-run at
//! merge execution time, and it must never mutate anything in between.

use crate::db;
use lifehub_common::{EntityRef, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// One field of one record that points at the merge target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceItem {
    /// Collection holding the referencing record
    pub collection: String,
    /// Id of the referencing record
    pub id: String,
    /// Dotted path of the field carrying the reference
    pub field_path: String,
}

/// Declares that `collection`'s records may reference entities of
/// `entity_type` through the field at `field_path`
///
/// The field may hold a single id string or an array of id strings.
#[derive(Debug, Clone)]
pub struct ReferenceSource {
    pub collection: String,
    pub field_path: String,
    pub entity_type: String,
}

impl ReferenceSource {
    pub fn new(collection: &str, field_path: &str, entity_type: &str) -> Self {
        Self {
            collection: collection.to_string(),
            field_path: field_path.to_string(),
            entity_type: entity_type.to_string(),
        }
    }
}

/// Reference sources for the stock collections
///
/// External callers with additional collections register their own list
/// through [`ReferenceInventory::new`].
pub fn default_sources() -> Vec<ReferenceSource> {
    vec![
        ReferenceSource::new("story", "characters", "character"),
        ReferenceSource::new("story", "outfits", "outfit"),
        ReferenceSource::new("image", "character_id", "character"),
        ReferenceSource::new("image", "outfit_id", "outfit"),
        ReferenceSource::new("outfit", "clothing_items", "clothing_item"),
        ReferenceSource::new("character", "preset_id", "preset"),
    ]
}

/// Read-only fan-out over the registered reference sources
pub struct ReferenceInventory {
    db: SqlitePool,
    sources: Vec<ReferenceSource>,
}

impl ReferenceInventory {
    pub fn new(db: SqlitePool, sources: Vec<ReferenceSource>) -> Self {
        Self { db, sources }
    }

    pub fn with_default_sources(db: SqlitePool) -> Self {
        Self::new(db, default_sources())
    }

    /// Every record/field pointing at `target`, across all sources whose
    /// declared entity type matches
    pub async fn find_references_to(&self, target: &EntityRef) -> Result<Vec<ReferenceItem>> {
        let mut items = Vec::new();
        for source in self
            .sources
            .iter()
            .filter(|s| s.entity_type == target.entity_type)
        {
            let records = db::entities::list_collection(&self.db, &source.collection).await?;
            for (id, record) in records {
                if db::entities::reference_matches(&record, &source.field_path, &target.entity_id) {
                    items.push(ReferenceItem {
                        collection: source.collection.clone(),
                        id,
                        field_path: source.field_path.clone(),
                    });
                }
            }
        }
        tracing::debug!(
            target = %target,
            count = items.len(),
            "Computed reference inventory"
        );
        Ok(items)
    }
}
