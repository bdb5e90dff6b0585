//! Entity references and job correlation hints
//!
//! An `EntityRef` identifies any domain object by `(entity_type, entity_id)`.
//! This subsystem is deliberately opaque to what a "character" or "outfit"
//! actually is; all correlation flows through these two types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Composite key identifying any domain object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Collection the entity belongs to (e.g., "character", "outfit")
    pub entity_type: String,
    /// Opaque identifier within the collection
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Structured correlation hint attached to a job
///
/// Attached under the `correlation` key in a job's `created_metadata` at
/// submission time, and echoed under the same key in its `result` on
/// completion. Names the EntityRef the job affects.
///
/// Older jobs that never adopted the structured hint carry a bare
/// `entity_id` field in their result instead; that path is handled by the
/// single legacy adapter [`CorrelationHint::legacy_result_entity_id`] and
/// nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationHint {
    pub entity_type: String,
    pub entity_id: String,
}

impl CorrelationHint {
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
        }
    }

    /// Read the structured hint out of a metadata or result map
    ///
    /// Returns `None` when the map has no `correlation` key or the value
    /// does not carry both fields.
    pub fn from_map(map: &Value) -> Option<Self> {
        let correlation = map.get("correlation")?;
        let entity_type = correlation.get("entity_type")?.as_str()?;
        let entity_id = correlation.get("entity_id")?.as_str()?;
        Some(Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Legacy adapter: bare `entity_id` field in a job result
    ///
    /// Supports jobs written before the structured hint existed. Matching
    /// against it compares the entity id only; the entity type is unknown
    /// on that path.
    pub fn legacy_result_entity_id(result: &Value) -> Option<&str> {
        result.get("entity_id").and_then(Value::as_str)
    }

    /// Serialize as the `correlation` value for embedding in metadata
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "entity_type": self.entity_type,
            "entity_id": self.entity_id,
        })
    }

    pub fn matches(&self, entity: &EntityRef) -> bool {
        self.entity_type == entity.entity_type && self.entity_id == entity.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hint_from_map() {
        let metadata = json!({
            "correlation": { "entity_type": "character", "entity_id": "c1" },
            "prompt": "portrait"
        });

        let hint = CorrelationHint::from_map(&metadata).expect("hint should parse");
        assert_eq!(hint.entity_type, "character");
        assert_eq!(hint.entity_id, "c1");
        assert!(hint.matches(&EntityRef::new("character", "c1")));
        assert!(!hint.matches(&EntityRef::new("outfit", "c1")));
    }

    #[test]
    fn test_hint_missing_or_partial() {
        assert_eq!(CorrelationHint::from_map(&json!({})), None);
        assert_eq!(
            CorrelationHint::from_map(&json!({ "correlation": { "entity_type": "character" } })),
            None
        );
    }

    #[test]
    fn test_legacy_result_entity_id() {
        let result = json!({ "entity_id": "c1", "asset_ref": "https://assets/c1.png" });
        assert_eq!(CorrelationHint::legacy_result_entity_id(&result), Some("c1"));
        assert_eq!(CorrelationHint::legacy_result_entity_id(&json!({})), None);
    }

    #[test]
    fn test_hint_round_trip_through_value() {
        let hint = CorrelationHint::for_entity(&EntityRef::new("outfit", "o-main"));
        let metadata = json!({ "correlation": hint.to_value() });
        assert_eq!(CorrelationHint::from_map(&metadata), Some(hint));
    }
}
