//! In-memory graph storage
//!
//! Entities and relationships live in id-keyed arenas with outgoing/incoming
//! adjacency lists, a label lookup and a relationship-type lookup. The store
//! owns the secondary indexes and constraints and keeps the indexes in step
//! with every mutation.

use super::entity::Entity;
use super::property::{PropertyMap, PropertyPath, PropertyValue};
use super::relationship::Relationship;
use super::types::{Direction, EntityId, Label, RelType, RelationshipId};
use super::view::GraphView;
use crate::index::{
    Constraint, ConstraintError, ConstraintManager, IndexDefinition, IndexError, IndexManager, IndexScope,
    IndexStats,
};
use crate::storage::StorageError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::info;

/// Errors that can occur during graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("Relationship {0} not found")]
    RelationshipNotFound(RelationshipId),

    #[error("Entity {0} already exists")]
    EntityAlreadyExists(EntityId),

    #[error("Relationship {0} already exists")]
    RelationshipAlreadyExists(RelationshipId),

    #[error("Relationship {relationship} refers to missing entity {entity}")]
    DanglingEndpoint {
        relationship: RelationshipId,
        entity: EntityId,
    },

    #[error("Entity {entity} still has {count} relationships; use DETACH DELETE")]
    HasRelationships { entity: EntityId, count: usize },

    #[error("Entity {0} must carry at least one label")]
    NoLabels(EntityId),

    #[error("Invalid value for property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Relationship {0} cannot change type or endpoints")]
    ImmutableRelationship(RelationshipId),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Counts reported by [`GraphStore::statistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub entity_count: usize,
    pub relationship_count: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub type_counts: BTreeMap<String, usize>,
    pub indexes: Vec<IndexStats>,
    pub constraint_count: usize,
    pub version: u64,
}

pub(crate) fn validate_properties(props: &PropertyMap) -> GraphResult<()> {
    for (key, value) in props {
        value.validate().map_err(|reason| GraphError::InvalidProperty {
            key: key.clone(),
            reason,
        })?;
    }
    Ok(())
}

/// In-memory graph storage
#[derive(Debug, Clone)]
pub struct GraphStore {
    entities: BTreeMap<EntityId, Entity>,

    relationships: BTreeMap<RelationshipId, Relationship>,

    outgoing: FxHashMap<EntityId, Vec<RelationshipId>>,

    incoming: FxHashMap<EntityId, Vec<RelationshipId>>,

    label_index: FxHashMap<Label, BTreeSet<EntityId>>,

    type_index: FxHashMap<RelType, BTreeSet<RelationshipId>>,

    indexes: IndexManager,

    constraints: ConstraintManager,

    next_entity_id: u64,

    next_relationship_id: u64,

    /// Commit sequence of the last applied transaction
    version: u64,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self::with_index_order(crate::index::DEFAULT_ORDER)
    }

    pub fn with_index_order(order: usize) -> Self {
        GraphStore {
            entities: BTreeMap::new(),
            relationships: BTreeMap::new(),
            outgoing: FxHashMap::default(),
            incoming: FxHashMap::default(),
            label_index: FxHashMap::default(),
            type_index: FxHashMap::default(),
            indexes: IndexManager::new(order),
            constraints: ConstraintManager::new(),
            next_entity_id: 1,
            next_relationship_id: 1,
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Next ids the store would hand out
    pub fn next_ids(&self) -> (u64, u64) {
        (self.next_entity_id, self.next_relationship_id)
    }

    pub(crate) fn reserve_ids(&mut self, next_entity: u64, next_relationship: u64) {
        self.next_entity_id = self.next_entity_id.max(next_entity);
        self.next_relationship_id = self.next_relationship_id.max(next_relationship);
    }

    // ---- validated public mutators ----

    /// Create an entity with a fresh id
    pub fn add_entity(&mut self, labels: Vec<Label>, properties: PropertyMap) -> GraphResult<EntityId> {
        let id = EntityId::new(self.next_entity_id);
        let entity = Entity::with_properties(id, labels, properties);
        self.constraints.validate_entity(&entity, &*self)?;
        self.put_new_entity(entity)?;
        Ok(id)
    }

    /// Insert an entity with a preset id, checking constraints
    pub fn insert_entity(&mut self, entity: Entity) -> GraphResult<()> {
        self.constraints.validate_entity(&entity, &*self)?;
        self.put_new_entity(entity)
    }

    pub fn add_relationship(
        &mut self,
        source: EntityId,
        target: EntityId,
        rel_type: impl Into<RelType>,
        properties: PropertyMap,
    ) -> GraphResult<RelationshipId> {
        let id = RelationshipId::new(self.next_relationship_id);
        let rel = Relationship::with_properties(id, source, target, rel_type, properties);
        self.put_new_relationship(rel)?;
        Ok(id)
    }

    pub fn insert_relationship(&mut self, rel: Relationship) -> GraphResult<()> {
        self.put_new_relationship(rel)
    }

    /// Set (or with `Null`, remove) a property
    pub fn set_entity_property(
        &mut self,
        id: EntityId,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> GraphResult<Option<PropertyValue>> {
        let key = key.into();
        let mut entity = self.entity_or_err(id)?.clone();
        let old = if value.is_null() {
            entity.remove_property(&key)
        } else {
            entity.set_property(key, value)
        };
        self.constraints.validate_entity(&entity, &*self)?;
        self.replace_entity(entity)?;
        Ok(old)
    }

    pub fn remove_entity_property(&mut self, id: EntityId, key: &str) -> GraphResult<Option<PropertyValue>> {
        self.set_entity_property(id, key, PropertyValue::Null)
    }

    pub fn add_label(&mut self, id: EntityId, label: impl Into<Label>) -> GraphResult<bool> {
        let mut entity = self.entity_or_err(id)?.clone();
        let added = entity.add_label(label);
        if added {
            self.constraints.validate_entity(&entity, &*self)?;
            self.replace_entity(entity)?;
        }
        Ok(added)
    }

    pub fn remove_label(&mut self, id: EntityId, label: &Label) -> GraphResult<bool> {
        let mut entity = self.entity_or_err(id)?.clone();
        let removed = entity.remove_label(label);
        if removed {
            self.replace_entity(entity)?;
        }
        Ok(removed)
    }

    pub fn set_relationship_property(
        &mut self,
        id: RelationshipId,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> GraphResult<Option<PropertyValue>> {
        let key = key.into();
        let mut rel = self
            .relationships
            .get(&id)
            .ok_or(GraphError::RelationshipNotFound(id))?
            .clone();
        let old = if value.is_null() {
            rel.remove_property(&key)
        } else {
            rel.set_property(key, value)
        };
        self.replace_relationship(rel)?;
        Ok(old)
    }

    pub fn remove_relationship_property(
        &mut self,
        id: RelationshipId,
        key: &str,
    ) -> GraphResult<Option<PropertyValue>> {
        self.set_relationship_property(id, key, PropertyValue::Null)
    }

    /// Delete an entity; with `detach` its relationships go too
    pub fn delete_entity(&mut self, id: EntityId, detach: bool) -> GraphResult<(Entity, Vec<Relationship>)> {
        self.entity_or_err(id)?;
        let attached = self.relationship_ids_of(id, Direction::Both);
        if !attached.is_empty() && !detach {
            return Err(GraphError::HasRelationships {
                entity: id,
                count: attached.len(),
            });
        }
        let mut removed = Vec::with_capacity(attached.len());
        for rid in attached {
            removed.push(self.delete_relationship(rid)?);
        }
        let entity = self.take_entity(id)?;
        Ok((entity, removed))
    }

    pub fn delete_relationship(&mut self, id: RelationshipId) -> GraphResult<Relationship> {
        let rel = self
            .relationships
            .remove(&id)
            .ok_or(GraphError::RelationshipNotFound(id))?;
        if let Some(list) = self.outgoing.get_mut(&rel.source) {
            list.retain(|r| *r != id);
        }
        if let Some(list) = self.incoming.get_mut(&rel.target) {
            list.retain(|r| *r != id);
        }
        if let Some(set) = self.type_index.get_mut(&rel.rel_type) {
            set.remove(&id);
            if set.is_empty() {
                self.type_index.remove(&rel.rel_type);
            }
        }
        self.indexes.on_relationship_remove(&rel);
        Ok(rel)
    }

    // ---- unchecked building blocks (structure only, no constraints) ----

    fn entity_or_err(&self, id: EntityId) -> GraphResult<&Entity> {
        self.entities.get(&id).ok_or(GraphError::EntityNotFound(id))
    }

    pub(crate) fn put_new_entity(&mut self, entity: Entity) -> GraphResult<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(GraphError::EntityAlreadyExists(entity.id));
        }
        if entity.labels.is_empty() {
            return Err(GraphError::NoLabels(entity.id));
        }
        validate_properties(&entity.properties)?;

        let id = entity.id;
        for label in &entity.labels {
            self.label_index.entry(label.clone()).or_default().insert(id);
        }
        self.indexes.on_entity_insert(&entity);
        self.entities.insert(id, entity);
        if id.as_u64() >= self.next_entity_id {
            self.next_entity_id = id.as_u64() + 1;
        }
        Ok(())
    }

    /// Replace an existing entity wholesale, returning the previous record
    pub(crate) fn replace_entity(&mut self, entity: Entity) -> GraphResult<Entity> {
        if entity.labels.is_empty() {
            return Err(GraphError::NoLabels(entity.id));
        }
        validate_properties(&entity.properties)?;
        let id = entity.id;
        let old = self.entities.remove(&id).ok_or(GraphError::EntityNotFound(id))?;

        for label in old.labels.difference(&entity.labels) {
            if let Some(set) = self.label_index.get_mut(label) {
                set.remove(&id);
                if set.is_empty() {
                    self.label_index.remove(label);
                }
            }
        }
        for label in entity.labels.difference(&old.labels) {
            self.label_index.entry(label.clone()).or_default().insert(id);
        }
        self.indexes.on_entity_update(&old, &entity);
        self.entities.insert(id, entity);
        Ok(old)
    }

    /// Remove an entity that has no remaining relationships
    pub(crate) fn take_entity(&mut self, id: EntityId) -> GraphResult<Entity> {
        let count = self.relationship_ids_of(id, Direction::Both).len();
        if count > 0 {
            return Err(GraphError::HasRelationships { entity: id, count });
        }
        let entity = self.entities.remove(&id).ok_or(GraphError::EntityNotFound(id))?;
        for label in &entity.labels {
            if let Some(set) = self.label_index.get_mut(label) {
                set.remove(&id);
                if set.is_empty() {
                    self.label_index.remove(label);
                }
            }
        }
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        self.indexes.on_entity_remove(&entity);
        Ok(entity)
    }

    pub(crate) fn put_new_relationship(&mut self, rel: Relationship) -> GraphResult<()> {
        if self.relationships.contains_key(&rel.id) {
            return Err(GraphError::RelationshipAlreadyExists(rel.id));
        }
        for endpoint in [rel.source, rel.target] {
            if !self.entities.contains_key(&endpoint) {
                return Err(GraphError::DanglingEndpoint {
                    relationship: rel.id,
                    entity: endpoint,
                });
            }
        }
        validate_properties(&rel.properties)?;

        let id = rel.id;
        self.outgoing.entry(rel.source).or_default().push(id);
        self.incoming.entry(rel.target).or_default().push(id);
        self.type_index.entry(rel.rel_type.clone()).or_default().insert(id);
        self.indexes.on_relationship_insert(&rel);
        self.relationships.insert(id, rel);
        if id.as_u64() >= self.next_relationship_id {
            self.next_relationship_id = id.as_u64() + 1;
        }
        Ok(())
    }

    pub(crate) fn replace_relationship(&mut self, rel: Relationship) -> GraphResult<Relationship> {
        let old = self
            .relationships
            .get(&rel.id)
            .ok_or(GraphError::RelationshipNotFound(rel.id))?;
        if old.source != rel.source || old.target != rel.target || old.rel_type != rel.rel_type {
            return Err(GraphError::ImmutableRelationship(rel.id));
        }
        validate_properties(&rel.properties)?;
        let old = self
            .relationships
            .insert(rel.id, rel.clone())
            .ok_or(GraphError::RelationshipNotFound(rel.id))?;
        self.indexes.on_relationship_update(&old, &rel);
        Ok(old)
    }

    // ---- reads ----

    pub fn get_entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn has_relationship(&self, id: RelationshipId) -> bool {
        self.relationships.contains_key(&id)
    }

    pub fn all_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn all_relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn entities_by_label(&self, label: &Label) -> Vec<&Entity> {
        self.label_index
            .get(label)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn relationships_by_type(&self, rel_type: &RelType) -> Vec<&Relationship> {
        self.type_index
            .get(rel_type)
            .map(|ids| ids.iter().filter_map(|id| self.relationships.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn filter_entities<F>(&self, pred: F) -> Vec<&Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        self.entities.values().filter(|e| pred(e)).collect()
    }

    pub fn outgoing(&self, id: EntityId) -> Vec<&Relationship> {
        self.relationships_of(id, Direction::Outgoing, &[])
    }

    pub fn incoming(&self, id: EntityId) -> Vec<&Relationship> {
        self.relationships_of(id, Direction::Incoming, &[])
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    // ---- indexes and constraints ----

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    /// Create an index and backfill it from the current contents
    pub fn create_index(&mut self, def: IndexDefinition) -> GraphResult<()> {
        self.indexes
            .create_and_backfill(def, self.entities.values(), self.relationships.values())?;
        Ok(())
    }

    pub fn drop_index(&mut self, def: &IndexDefinition) -> GraphResult<()> {
        self.indexes.drop_index(def)?;
        Ok(())
    }

    pub fn rebuild_indexes(&mut self) {
        self.indexes.rebuild(self.entities.values(), self.relationships.values());
    }

    pub fn constraints(&self) -> &ConstraintManager {
        &self.constraints
    }

    /// Register a constraint after checking that existing data satisfies it
    pub fn add_constraint(&mut self, constraint: Constraint) -> GraphResult<bool> {
        let mut candidate = ConstraintManager::new();
        candidate.add(constraint.clone());
        for entity in self.entities_by_label(&constraint.label) {
            candidate.validate_entity(entity, self)?;
        }
        info!("Adding constraint {}", constraint.name());
        Ok(self.constraints.add(constraint))
    }

    pub fn drop_constraint(&mut self, constraint: &Constraint) -> bool {
        self.constraints.remove(constraint)
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            entity_count: self.entities.len(),
            relationship_count: self.relationships.len(),
            label_counts: self
                .label_index
                .iter()
                .map(|(label, ids)| (label.to_string(), ids.len()))
                .collect(),
            type_counts: self
                .type_index
                .iter()
                .map(|(t, ids)| (t.to_string(), ids.len()))
                .collect(),
            indexes: self.indexes.statistics(),
            constraint_count: self.constraints.all().len(),
            version: self.version,
        }
    }

    pub fn clear(&mut self) {
        let order = self.indexes.btree_order();
        *self = GraphStore::with_index_order(order);
    }
}

impl GraphView for GraphStore {
    fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn entity_ids_with_label(&self, label: &Label) -> Vec<EntityId> {
        self.label_index
            .get(label)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn relationship_ids_of(&self, id: EntityId, direction: Direction) -> Vec<RelationshipId> {
        let out = self.outgoing.get(&id).map(|v| v.as_slice()).unwrap_or(&[]);
        let inc = self.incoming.get(&id).map(|v| v.as_slice()).unwrap_or(&[]);
        match direction {
            Direction::Outgoing => out.to_vec(),
            Direction::Incoming => inc.to_vec(),
            Direction::Both => {
                let mut all = out.to_vec();
                // Self-loops sit in both lists
                all.extend(inc.iter().filter(|rid| !out.contains(rid)));
                all
            }
        }
    }

    fn index_lookup(&self, label: &Label, path: &PropertyPath, value: &PropertyValue) -> Option<Vec<EntityId>> {
        let scope = IndexScope::Label(label.clone());
        self.indexes
            .point_search(&scope, path, value)
            .map(|ids| ids.into_iter().map(EntityId::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ConstraintKind;

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_add_and_get() {
        let mut store = GraphStore::new();
        let alice = store
            .add_entity(vec![Label::new("Person")], props(&[("name", "Alice".into())]))
            .unwrap();
        let bob = store.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        let knows = store.add_relationship(alice, bob, "KNOWS", PropertyMap::new()).unwrap();

        assert_eq!(store.entity_count(), 2);
        assert_eq!(store.relationship_count(), 1);
        assert_eq!(store.get_entity(alice).unwrap().get_property("name"), Some(&"Alice".into()));
        assert_eq!(store.get_relationship(knows).unwrap().target, bob);
        assert_eq!(store.outgoing(alice).len(), 1);
        assert_eq!(store.incoming(bob).len(), 1);
        assert_eq!(store.neighbors(bob, Direction::Both, &[]), vec![alice]);
        assert_eq!(store.entities_by_label(&Label::new("Person")).len(), 2);
        assert_eq!(store.relationships_by_type(&RelType::new("KNOWS")).len(), 1);
    }

    #[test]
    fn test_dangling_relationship_rejected() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("A")], PropertyMap::new()).unwrap();
        let err = store
            .add_relationship(a, EntityId::new(99), "R", PropertyMap::new())
            .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEndpoint { .. }));
        assert_eq!(store.relationship_count(), 0);
    }

    #[test]
    fn test_delete_requires_detach() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("A")], PropertyMap::new()).unwrap();
        let b = store.add_entity(vec![Label::new("B")], PropertyMap::new()).unwrap();
        store.add_relationship(a, b, "R", PropertyMap::new()).unwrap();
        store.add_relationship(a, a, "SELF", PropertyMap::new()).unwrap();

        assert!(matches!(
            store.delete_entity(a, false),
            Err(GraphError::HasRelationships { count: 2, .. })
        ));
        let (_, removed) = store.delete_entity(a, true).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.relationship_count(), 0);
        assert!(store.incoming(b).is_empty());
        assert!(!store.has_entity(a));
    }

    #[test]
    fn test_label_changes_update_lookup() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        store.add_label(a, "Employee").unwrap();
        assert_eq!(store.entity_ids_with_label(&Label::new("Employee")), vec![a]);
        store.remove_label(a, &Label::new("Person")).unwrap();
        assert!(store.entity_ids_with_label(&Label::new("Person")).is_empty());
        assert!(matches!(
            store.remove_label(a, &Label::new("Employee")),
            Err(GraphError::NoLabels(_))
        ));
    }

    #[test]
    fn test_index_follows_property_updates() {
        let mut store = GraphStore::new();
        let a = store
            .add_entity(vec![Label::new("Person")], props(&[("age", 30i64.into())]))
            .unwrap();
        store.create_index(IndexDefinition::property("Person", "age")).unwrap();
        let age = PropertyPath::single("age");
        let person = Label::new("Person");
        assert_eq!(store.index_lookup(&person, &age, &30i64.into()), Some(vec![a]));

        store.set_entity_property(a, "age", 31i64.into()).unwrap();
        assert_eq!(store.index_lookup(&person, &age, &30i64.into()), Some(vec![]));
        assert_eq!(store.index_lookup(&person, &age, &31i64.into()), Some(vec![a]));

        store.remove_entity_property(a, "age").unwrap();
        assert_eq!(store.index_lookup(&person, &age, &31i64.into()), Some(vec![]));
        store.index_manager().verify().unwrap();
    }

    #[test]
    fn test_constraints_enforced_on_direct_writes() {
        let mut store = GraphStore::new();
        store
            .add_entity(vec![Label::new("User")], props(&[("email", "a@x".into())]))
            .unwrap();
        store
            .add_constraint(Constraint::new("User", ConstraintKind::Unique(PropertyPath::single("email"))))
            .unwrap();
        let err = store
            .add_entity(vec![Label::new("User")], props(&[("email", "a@x".into())]))
            .unwrap_err();
        assert!(matches!(err, GraphError::Constraint(ConstraintError::Unique { .. })));
        assert_eq!(store.entity_count(), 1);

        // Existing data that violates a new constraint blocks registration
        assert!(store
            .add_constraint(Constraint::new("User", ConstraintKind::Existence(PropertyPath::single("name"))))
            .is_err());
    }

    #[test]
    fn test_invalid_property_shape() {
        let mut store = GraphStore::new();
        let nested = PropertyValue::List(vec![PropertyValue::List(vec![])]);
        let err = store
            .add_entity(vec![Label::new("A")], props(&[("bad", nested)]))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidProperty { .. }));
    }

    #[test]
    fn test_statistics() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("A")], PropertyMap::new()).unwrap();
        store.add_relationship(a, a, "LOOP", PropertyMap::new()).unwrap();
        let stats = store.statistics();
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.relationship_count, 1);
        assert_eq!(stats.label_counts.get("A"), Some(&1));
        assert_eq!(stats.type_counts.get("LOOP"), Some(&1));
        // Self-loop listed once in both directions
        assert_eq!(store.relationship_ids_of(a, Direction::Both).len(), 1);
    }
}
