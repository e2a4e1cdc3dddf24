//! Entity (node) records

use super::property::{PropertyMap, PropertyPath, PropertyValue};
use super::types::{EntityId, Label};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An entity in the property graph
///
/// Entities carry one or more labels, a property map and optional
/// metadata (for example extraction confidence) that queries do not see
/// as ordinary properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    /// Commit sequence of the last write applied to this entity
    pub version: u64,

    pub labels: BTreeSet<Label>,

    pub properties: PropertyMap,

    pub metadata: PropertyMap,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Entity {
    /// Create a new entity with a single label
    pub fn new(id: EntityId, label: impl Into<Label>) -> Self {
        Self::with_labels(id, vec![label.into()])
    }

    pub fn with_labels(id: EntityId, labels: Vec<Label>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Entity {
            id,
            version: 0,
            labels: labels.into_iter().collect(),
            properties: PropertyMap::new(),
            metadata: PropertyMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_properties(id: EntityId, labels: Vec<Label>, properties: PropertyMap) -> Self {
        let mut entity = Self::with_labels(id, labels);
        entity.properties = properties;
        entity
    }

    pub fn add_label(&mut self, label: impl Into<Label>) -> bool {
        let added = self.labels.insert(label.into());
        if added {
            self.touch();
        }
        added
    }

    pub fn remove_label(&mut self, label: &Label) -> bool {
        let removed = self.labels.remove(label);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn has_label(&self, label: &Label) -> bool {
        self.labels.contains(label)
    }

    pub fn has_labels(&self, labels: &[Label]) -> bool {
        labels.iter().all(|l| self.labels.contains(l))
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        let old = self.properties.insert(key.into(), value.into());
        self.touch();
        old
    }

    pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Resolve a dotted path through nested maps
    pub fn property_at(&self, path: &PropertyPath) -> Option<&PropertyValue> {
        path.resolve(&self.properties)
    }

    pub fn remove_property(&mut self, key: &str) -> Option<PropertyValue> {
        let removed = self.properties.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
