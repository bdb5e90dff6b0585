//! Entity collection queries
//!
//! Generic CRUD over domain records stored as JSON, plus the field-path
//! helpers the reference inventory and merge execution are built on.
//! Records are opaque to this service except for the fields named by
//! reference descriptors and the `asset_ref` pointer previews read.

use chrono::Utc;
use lifehub_common::{EntityRef, Error, Result};
use serde_json::Value;
use sqlx::SqlitePool;

/// Stored entity with its archive bookkeeping
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub record: Value,
    pub archived: bool,
    /// Set when archived by a merge; points at the surviving entity id
    pub merged_into: Option<String>,
}

/// Fetch an entity's record, erroring when absent
pub async fn get_entity(db: &SqlitePool, entity: &EntityRef) -> Result<Value> {
    try_get_entity(db, entity)
        .await?
        .map(|e| e.record)
        .ok_or_else(|| Error::NotFound(format!("entity {}", entity)))
}

/// Fetch an entity with archive state, `None` when absent
pub async fn try_get_entity(db: &SqlitePool, entity: &EntityRef) -> Result<Option<EntityRecord>> {
    let row: Option<(String, i64, Option<String>)> = sqlx::query_as(
        "SELECT record, archived, merged_into FROM entities WHERE collection = ? AND id = ?",
    )
    .bind(&entity.entity_type)
    .bind(&entity.entity_id)
    .fetch_optional(db)
    .await?;

    row.map(|(record, archived, merged_into)| {
        let record = serde_json::from_str(&record)
            .map_err(|e| Error::Internal(format!("corrupt record for {}: {}", entity, e)))?;
        Ok(EntityRecord {
            record,
            archived: archived != 0,
            merged_into,
        })
    })
    .transpose()
}

/// Insert or overwrite an entity's record
///
/// Archive state is untouched on overwrite; rewriting a reference on an
/// archived record does not resurrect it.
pub async fn put_entity(db: &SqlitePool, entity: &EntityRef, record: &Value) -> Result<()> {
    if !record.is_object() {
        return Err(Error::InvalidInput(format!(
            "record for {} must be a JSON object",
            entity
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO entities (collection, id, record, archived, merged_into, updated_at)
        VALUES (?, ?, ?, 0, NULL, ?)
        ON CONFLICT(collection, id) DO UPDATE SET
            record = excluded.record,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&entity.entity_type)
    .bind(&entity.entity_id)
    .bind(record.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(db)
    .await?;

    tracing::debug!(entity = %entity, "Entity record written");

    Ok(())
}

/// Archive an entity, recording which entity absorbed it
///
/// Idempotent: re-archiving with the same `merged_into` succeeds without
/// additional effect. The record is kept so the merge stays reversible.
pub async fn archive_entity(db: &SqlitePool, entity: &EntityRef, merged_into: &str) -> Result<()> {
    let existing = try_get_entity(db, entity)
        .await?
        .ok_or_else(|| Error::NotFound(format!("entity {}", entity)))?;

    if existing.archived {
        if existing.merged_into.as_deref() == Some(merged_into) {
            return Ok(());
        }
        return Err(Error::InvalidInput(format!(
            "entity {} is already archived into {:?}",
            entity, existing.merged_into
        )));
    }

    sqlx::query(
        "UPDATE entities SET archived = 1, merged_into = ?, updated_at = ? WHERE collection = ? AND id = ?",
    )
    .bind(merged_into)
    .bind(Utc::now().to_rfc3339())
    .bind(&entity.entity_type)
    .bind(&entity.entity_id)
    .execute(db)
    .await?;

    tracing::info!(entity = %entity, merged_into = %merged_into, "Entity archived");

    Ok(())
}

/// List all non-archived records of a collection as `(id, record)` pairs
pub async fn list_collection(db: &SqlitePool, collection: &str) -> Result<Vec<(String, Value)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT id, record FROM entities WHERE collection = ? AND archived = 0")
            .bind(collection)
            .fetch_all(db)
            .await?;

    rows.into_iter()
        .map(|(id, record)| {
            let record = serde_json::from_str(&record).map_err(|e| {
                Error::Internal(format!("corrupt record for {}:{}: {}", collection, id, e))
            })?;
            Ok((id, record))
        })
        .collect()
}

/// Repoint one reference field from one entity id to another
///
/// Idempotent: when the field no longer mentions `from_id` nothing is
/// written and `Ok(false)` is returned.
pub async fn rewrite_reference(
    db: &SqlitePool,
    collection: &str,
    id: &str,
    field_path: &str,
    from_id: &str,
    to_id: &str,
) -> Result<bool> {
    let entity = EntityRef::new(collection, id);
    let mut record = get_entity(db, &entity).await?;

    if !rewrite_field(&mut record, field_path, from_id, to_id) {
        return Ok(false);
    }

    sqlx::query("UPDATE entities SET record = ?, updated_at = ? WHERE collection = ? AND id = ?")
        .bind(record.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(collection)
        .bind(id)
        .execute(db)
        .await?;

    tracing::debug!(
        collection = %collection,
        id = %id,
        field = %field_path,
        from = %from_id,
        to = %to_id,
        "Reference rewritten"
    );

    Ok(true)
}

/// Navigate a dotted field path inside a record
pub fn field_at_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Does the field at `path` reference the given entity id?
///
/// A reference field is either a plain id string or an array of id strings.
pub fn reference_matches(record: &Value, path: &str, id: &str) -> bool {
    match field_at_path(record, path) {
        Some(Value::String(s)) => s == id,
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(id)),
        _ => false,
    }
}

/// Replace `from_id` with `to_id` at the field path; returns whether the
/// record changed
///
/// Array fields deduplicate: when `to_id` is already present, `from_id`
/// entries are removed instead of duplicated.
pub fn rewrite_field(record: &mut Value, path: &str, from_id: &str, to_id: &str) -> bool {
    let mut current = record;
    for segment in path.split('.') {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }

    match current {
        Value::String(s) if s == from_id => {
            *current = Value::String(to_id.to_string());
            true
        }
        Value::Array(items) => {
            let had_from = items.iter().any(|v| v.as_str() == Some(from_id));
            if !had_from {
                return false;
            }
            let has_to = items.iter().any(|v| v.as_str() == Some(to_id));
            if has_to {
                items.retain(|v| v.as_str() != Some(from_id));
            } else {
                for item in items.iter_mut() {
                    if item.as_str() == Some(from_id) {
                        *item = Value::String(to_id.to_string());
                    }
                }
                // collapse duplicates introduced by multiple from_id entries
                let mut seen = std::collections::HashSet::new();
                items.retain(|v| match v.as_str() {
                    Some(s) => seen.insert(s.to_string()),
                    None => true,
                });
            }
            true
        }
        _ => false,
    }
}
