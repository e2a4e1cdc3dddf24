//! Relationship (edge) records

use super::property::{PropertyMap, PropertyValue};
use super::types::{EntityId, RelType, RelationshipId};
use serde::{Deserialize, Serialize};

/// A directed, typed relationship between two entities
///
/// Several relationships may connect the same pair of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,

    /// Commit sequence of the last write applied to this relationship
    pub version: u64,

    pub source: EntityId,

    pub target: EntityId,

    pub rel_type: RelType,

    pub properties: PropertyMap,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl Relationship {
    pub fn new(
        id: RelationshipId,
        source: EntityId,
        target: EntityId,
        rel_type: impl Into<RelType>,
    ) -> Self {
        Relationship {
            id,
            version: 0,
            source,
            target,
            rel_type: rel_type.into(),
            properties: PropertyMap::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_properties(
        id: RelationshipId,
        source: EntityId,
        target: EntityId,
        rel_type: impl Into<RelType>,
        properties: PropertyMap,
    ) -> Self {
        let mut rel = Self::new(id, source, target, rel_type);
        rel.properties = properties;
        rel
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn remove_property(&mut self, key: &str) -> Option<PropertyValue> {
        self.properties.remove(key)
    }

    pub fn connects(&self, id: EntityId) -> bool {
        self.source == id || self.target == id
    }

    /// Endpoint opposite `id`; for self-loops this is `id` itself
    pub fn other_end(&self, id: EntityId) -> EntityId {
        if self.source == id {
            self.target
        } else {
            self.source
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_creation() {
        let rel = Relationship::new(RelationshipId::new(1), EntityId::new(1), EntityId::new(2), "KNOWS");
        assert_eq!(rel.rel_type, RelType::new("KNOWS"));
        assert!(rel.connects(EntityId::new(2)));
        assert_eq!(rel.other_end(EntityId::new(1)), EntityId::new(2));
        assert_eq!(rel.other_end(EntityId::new(2)), EntityId::new(1));
        assert!(!rel.is_self_loop());
    }

    #[test]
    fn test_relationship_properties() {
        let mut rel = Relationship::new(RelationshipId::new(1), EntityId::new(1), EntityId::new(1), "LIKES");
        rel.set_property("since", 2020i64);
        assert_eq!(rel.get_property("since"), Some(&2020i64.into()));
        assert!(rel.is_self_loop());
        assert_eq!(rel.remove_property("since"), Some(2020i64.into()));
    }
}
