//! Per-transaction write overlay
//!
//! A [`Delta`] holds full copies of every record a transaction created or
//! changed plus tombstones for deletions. [`TxView`] layers it over the
//! committed store so the transaction reads its own writes.

use super::{TransactionError, TransactionResult};
use crate::graph::store::validate_properties;
use crate::graph::{
    Direction, Entity, EntityId, GraphError, GraphStore, GraphView, Label, Operation, PropertyPath, PropertyValue,
    Relationship, RelationshipId,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct Delta {
    entities: FxHashMap<EntityId, Entity>,
    relationships: FxHashMap<RelationshipId, Relationship>,
    created_entities: BTreeSet<EntityId>,
    created_relationships: BTreeSet<RelationshipId>,
    deleted_entities: FxHashSet<EntityId>,
    deleted_relationships: FxHashSet<RelationshipId>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.relationships.is_empty()
            && self.deleted_entities.is_empty()
            && self.deleted_relationships.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Delta::default();
    }

    /// Ids of entities with a pending copy (created or updated, not deleted)
    pub fn touched_entities(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    /// Relationships created by the transaction and still alive
    pub fn created_relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.created_relationships
            .iter()
            .filter_map(|id| self.relationships.get(id))
    }

    pub fn deleted_entities(&self) -> &FxHashSet<EntityId> {
        &self.deleted_entities
    }

    pub fn deleted_relationships(&self) -> &FxHashSet<RelationshipId> {
        &self.deleted_relationships
    }

    pub fn is_created(&self, id: EntityId) -> bool {
        self.created_entities.contains(&id)
    }

    /// Validate `op` against the current view and fold it into the overlay
    pub(crate) fn stage(&mut self, op: &Operation, base: &GraphStore) -> TransactionResult<()> {
        let view = TxView::new(base, self);
        match op {
            Operation::CreateEntity(entity) => {
                if view.entity(entity.id).is_some() || base.has_entity(entity.id) {
                    return Err(GraphError::EntityAlreadyExists(entity.id).into());
                }
                if entity.labels.is_empty() {
                    return Err(GraphError::NoLabels(entity.id).into());
                }
                validate_properties(&entity.properties)?;
                base.constraints().validate_entity(entity, &view)?;
                self.created_entities.insert(entity.id);
                self.entities.insert(entity.id, entity.clone());
            }
            Operation::CreateRelationship(rel) => {
                if view.relationship(rel.id).is_some() || base.has_relationship(rel.id) {
                    return Err(GraphError::RelationshipAlreadyExists(rel.id).into());
                }
                for endpoint in [rel.source, rel.target] {
                    if !view.contains_entity(endpoint) {
                        return Err(GraphError::DanglingEndpoint {
                            relationship: rel.id,
                            entity: endpoint,
                        }
                        .into());
                    }
                }
                validate_properties(&rel.properties)?;
                self.created_relationships.insert(rel.id);
                self.relationships.insert(rel.id, rel.clone());
            }
            Operation::SetEntityProperty { id, key, value } => {
                let mut entity = visible_entity(&view, *id)?;
                if value.is_null() {
                    entity.remove_property(key);
                } else {
                    value.validate().map_err(|reason| GraphError::InvalidProperty {
                        key: key.clone(),
                        reason,
                    })?;
                    entity.set_property(key.clone(), value.clone());
                }
                base.constraints().validate_entity(&entity, &view)?;
                self.entities.insert(*id, entity);
            }
            Operation::RemoveEntityProperty { id, key } => {
                let mut entity = visible_entity(&view, *id)?;
                entity.remove_property(key);
                base.constraints().validate_entity(&entity, &view)?;
                self.entities.insert(*id, entity);
            }
            Operation::AddLabel { id, label } => {
                let mut entity = visible_entity(&view, *id)?;
                entity.add_label(label.clone());
                base.constraints().validate_entity(&entity, &view)?;
                self.entities.insert(*id, entity);
            }
            Operation::RemoveLabel { id, label } => {
                let mut entity = visible_entity(&view, *id)?;
                entity.remove_label(label);
                if entity.labels.is_empty() {
                    return Err(GraphError::NoLabels(*id).into());
                }
                self.entities.insert(*id, entity);
            }
            Operation::SetRelationshipProperty { id, key, value } => {
                let mut rel = visible_relationship(&view, *id)?;
                if value.is_null() {
                    rel.remove_property(key);
                } else {
                    value.validate().map_err(|reason| GraphError::InvalidProperty {
                        key: key.clone(),
                        reason,
                    })?;
                    rel.set_property(key.clone(), value.clone());
                }
                self.relationships.insert(*id, rel);
            }
            Operation::RemoveRelationshipProperty { id, key } => {
                let mut rel = visible_relationship(&view, *id)?;
                rel.remove_property(key);
                self.relationships.insert(*id, rel);
            }
            Operation::DeleteEntity { id, .. } => {
                visible_entity(&view, *id)?;
                let count = view.relationship_ids_of(*id, Direction::Both).len();
                if count > 0 {
                    return Err(GraphError::HasRelationships { entity: *id, count }.into());
                }
                self.entities.remove(id);
                if !self.created_entities.remove(id) {
                    self.deleted_entities.insert(*id);
                }
            }
            Operation::DeleteRelationship { id } => {
                visible_relationship(&view, *id)?;
                self.relationships.remove(id);
                if !self.created_relationships.remove(id) {
                    self.deleted_relationships.insert(*id);
                }
            }
        }
        Ok(())
    }
}

fn visible_entity(view: &TxView<'_>, id: EntityId) -> TransactionResult<Entity> {
    view.entity(id)
        .cloned()
        .ok_or_else(|| TransactionError::from(GraphError::EntityNotFound(id)))
}

fn visible_relationship(view: &TxView<'_>, id: RelationshipId) -> TransactionResult<Relationship> {
    view.relationship(id)
        .cloned()
        .ok_or_else(|| TransactionError::from(GraphError::RelationshipNotFound(id)))
}

/// Committed store overlaid with one transaction's pending writes
#[derive(Clone, Copy)]
pub struct TxView<'a> {
    base: &'a GraphStore,
    delta: &'a Delta,
}

impl<'a> TxView<'a> {
    pub fn new(base: &'a GraphStore, delta: &'a Delta) -> Self {
        TxView { base, delta }
    }

    pub fn base(&self) -> &'a GraphStore {
        self.base
    }

    fn matches_direction(rel: &Relationship, id: EntityId, direction: Direction) -> bool {
        match direction {
            Direction::Outgoing => rel.source == id,
            Direction::Incoming => rel.target == id,
            Direction::Both => rel.connects(id),
        }
    }
}

impl<'a> GraphView for TxView<'a> {
    fn entity(&self, id: EntityId) -> Option<&Entity> {
        if self.delta.deleted_entities.contains(&id) {
            return None;
        }
        self.delta.entities.get(&id).or_else(|| self.base.get_entity(id))
    }

    fn relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        if self.delta.deleted_relationships.contains(&id) {
            return None;
        }
        self.delta
            .relationships
            .get(&id)
            .or_else(|| self.base.get_relationship(id))
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: BTreeSet<EntityId> = self
            .base
            .entity_ids()
            .into_iter()
            .filter(|id| !self.delta.deleted_entities.contains(id))
            .collect();
        ids.extend(self.delta.created_entities.iter().copied());
        ids.into_iter().collect()
    }

    fn entity_ids_with_label(&self, label: &Label) -> Vec<EntityId> {
        let mut ids: BTreeSet<EntityId> = self
            .base
            .entity_ids_with_label(label)
            .into_iter()
            .filter(|id| {
                !self.delta.deleted_entities.contains(id)
                    && self.delta.entities.get(id).map(|e| e.has_label(label)).unwrap_or(true)
            })
            .collect();
        ids.extend(
            self.delta
                .entities
                .values()
                .filter(|e| e.has_label(label))
                .map(|e| e.id),
        );
        ids.into_iter().collect()
    }

    fn relationship_ids_of(&self, id: EntityId, direction: Direction) -> Vec<RelationshipId> {
        let mut out: Vec<RelationshipId> = self
            .base
            .relationship_ids_of(id, direction)
            .into_iter()
            .filter(|rid| !self.delta.deleted_relationships.contains(rid))
            .collect();
        for rid in &self.delta.created_relationships {
            if let Some(rel) = self.delta.relationships.get(rid) {
                if Self::matches_direction(rel, id, direction) {
                    out.push(*rid);
                }
            }
        }
        out
    }

    fn index_lookup(&self, label: &Label, path: &PropertyPath, value: &PropertyValue) -> Option<Vec<EntityId>> {
        let base_ids = self.base.index_lookup(label, path, value)?;
        let mut ids: BTreeSet<EntityId> = base_ids
            .into_iter()
            .filter(|id| {
                !self.delta.deleted_entities.contains(id)
                    && self
                        .delta
                        .entities
                        .get(id)
                        .map(|e| e.has_label(label) && e.property_at(path) == Some(value))
                        .unwrap_or(true)
            })
            .collect();
        ids.extend(
            self.delta
                .entities
                .values()
                .filter(|e| e.has_label(label) && e.property_at(path) == Some(value))
                .map(|e| e.id),
        );
        Some(ids.into_iter().collect())
    }
}
