//! Mutation operations
//!
//! An [`Operation`] is the unit a transaction stages, the WAL logs and the
//! store applies. Applying returns undo records so a batch can be reverted if
//! a later operation fails.

use super::entity::Entity;
use super::property::PropertyValue;
use super::relationship::Relationship;
use super::store::{GraphError, GraphResult, GraphStore};
use super::types::{EntityId, Label, RecordId, RelationshipId};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    CreateEntity(Entity),
    CreateRelationship(Relationship),
    SetEntityProperty {
        id: EntityId,
        key: String,
        value: PropertyValue,
    },
    RemoveEntityProperty {
        id: EntityId,
        key: String,
    },
    AddLabel {
        id: EntityId,
        label: Label,
    },
    RemoveLabel {
        id: EntityId,
        label: Label,
    },
    SetRelationshipProperty {
        id: RelationshipId,
        key: String,
        value: PropertyValue,
    },
    RemoveRelationshipProperty {
        id: RelationshipId,
        key: String,
    },
    DeleteEntity {
        id: EntityId,
        detach: bool,
    },
    DeleteRelationship {
        id: RelationshipId,
    },
}

impl Operation {
    /// Record the operation writes
    pub fn target(&self) -> RecordId {
        match self {
            Operation::CreateEntity(e) => RecordId::Entity(e.id),
            Operation::CreateRelationship(r) => RecordId::Relationship(r.id),
            Operation::SetEntityProperty { id, .. }
            | Operation::RemoveEntityProperty { id, .. }
            | Operation::AddLabel { id, .. }
            | Operation::RemoveLabel { id, .. }
            | Operation::DeleteEntity { id, .. } => RecordId::Entity(*id),
            Operation::SetRelationshipProperty { id, .. }
            | Operation::RemoveRelationshipProperty { id, .. }
            | Operation::DeleteRelationship { id } => RecordId::Relationship(*id),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::DeleteEntity { .. } | Operation::DeleteRelationship { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateEntity(_) => "CreateEntity",
            Operation::CreateRelationship(_) => "CreateRelationship",
            Operation::SetEntityProperty { .. } => "SetEntityProperty",
            Operation::RemoveEntityProperty { .. } => "RemoveEntityProperty",
            Operation::AddLabel { .. } => "AddLabel",
            Operation::RemoveLabel { .. } => "RemoveLabel",
            Operation::SetRelationshipProperty { .. } => "SetRelationshipProperty",
            Operation::RemoveRelationshipProperty { .. } => "RemoveRelationshipProperty",
            Operation::DeleteEntity { .. } => "DeleteEntity",
            Operation::DeleteRelationship { .. } => "DeleteRelationship",
        }
    }
}

/// Inverse of one applied step
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    RemoveEntity(EntityId),
    RestoreEntity(Entity),
    RemoveRelationship(RelationshipId),
    RestoreDeletedRelationship(Relationship),
    RestoreRelationship(Relationship),
    RestoreDeletedEntity(Entity),
}

impl GraphStore {
    /// Apply one operation without constraint checks, stamping `version`
    pub(crate) fn apply(&mut self, op: &Operation, version: u64) -> GraphResult<Vec<Undo>> {
        match op {
            Operation::CreateEntity(entity) => {
                let mut entity = entity.clone();
                entity.version = version;
                let id = entity.id;
                self.put_new_entity(entity)?;
                Ok(vec![Undo::RemoveEntity(id)])
            }
            Operation::CreateRelationship(rel) => {
                let mut rel = rel.clone();
                rel.version = version;
                let id = rel.id;
                self.put_new_relationship(rel)?;
                Ok(vec![Undo::RemoveRelationship(id)])
            }
            Operation::SetEntityProperty { id, key, value } => self.update_entity(*id, version, |e| {
                if value.is_null() {
                    e.remove_property(key);
                } else {
                    e.set_property(key.clone(), value.clone());
                }
            }),
            Operation::RemoveEntityProperty { id, key } => self.update_entity(*id, version, |e| {
                e.remove_property(key);
            }),
            Operation::AddLabel { id, label } => self.update_entity(*id, version, |e| {
                e.add_label(label.clone());
            }),
            Operation::RemoveLabel { id, label } => self.update_entity(*id, version, |e| {
                e.remove_label(label);
            }),
            Operation::SetRelationshipProperty { id, key, value } => self.update_relationship(*id, version, |r| {
                if value.is_null() {
                    r.remove_property(key);
                } else {
                    r.set_property(key.clone(), value.clone());
                }
            }),
            Operation::RemoveRelationshipProperty { id, key } => self.update_relationship(*id, version, |r| {
                r.remove_property(key);
            }),
            Operation::DeleteEntity { id, detach } => {
                let (entity, rels) = self.delete_entity(*id, *detach)?;
                let mut undo: Vec<Undo> = rels.into_iter().map(Undo::RestoreDeletedRelationship).collect();
                undo.push(Undo::RestoreDeletedEntity(entity));
                Ok(undo)
            }
            Operation::DeleteRelationship { id } => {
                let rel = self.delete_relationship(*id)?;
                Ok(vec![Undo::RestoreDeletedRelationship(rel)])
            }
        }
    }

    fn update_entity(&mut self, id: EntityId, version: u64, f: impl FnOnce(&mut Entity)) -> GraphResult<Vec<Undo>> {
        let mut entity = self.get_entity(id).cloned().ok_or(GraphError::EntityNotFound(id))?;
        f(&mut entity);
        entity.version = version;
        let old = self.replace_entity(entity)?;
        Ok(vec![Undo::RestoreEntity(old)])
    }

    fn update_relationship(
        &mut self,
        id: RelationshipId,
        version: u64,
        f: impl FnOnce(&mut Relationship),
    ) -> GraphResult<Vec<Undo>> {
        let mut rel = self
            .get_relationship(id)
            .cloned()
            .ok_or(GraphError::RelationshipNotFound(id))?;
        f(&mut rel);
        rel.version = version;
        let old = self.replace_relationship(rel)?;
        Ok(vec![Undo::RestoreRelationship(old)])
    }

    /// Undo steps in reverse order of application
    pub(crate) fn revert(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match step {
                Undo::RemoveEntity(id) => self.take_entity(id).map(|_| ()),
                Undo::RemoveRelationship(id) => self.delete_relationship(id).map(|_| ()),
                Undo::RestoreEntity(entity) => self.replace_entity(entity).map(|_| ()),
                Undo::RestoreRelationship(rel) => self.replace_relationship(rel).map(|_| ()),
                Undo::RestoreDeletedEntity(entity) => self.put_new_entity(entity),
                Undo::RestoreDeletedRelationship(rel) => self.put_new_relationship(rel),
            };
            if let Err(e) = result {
                warn!("Undo step failed: {}", e);
            }
        }
    }

    /// Apply a batch atomically: on the first failure every earlier step is
    /// reverted and the error returned
    pub fn apply_all(&mut self, ops: &[Operation], version: u64) -> GraphResult<()> {
        self.apply_batch(ops, version).map(|_| ())
    }

    /// Like [`apply_all`](Self::apply_all), returning the undo log so the
    /// caller can still revert the whole batch
    pub(crate) fn apply_batch(&mut self, ops: &[Operation], version: u64) -> GraphResult<Vec<Undo>> {
        let mut undo = Vec::new();
        for op in ops {
            match self.apply(op, version) {
                Ok(steps) => undo.extend(steps),
                Err(e) => {
                    self.revert(undo);
                    return Err(e);
                }
            }
        }
        self.set_version(version);
        Ok(undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PropertyMap;

    #[test]
    fn test_apply_and_revert_batch() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("A")], PropertyMap::new()).unwrap();
        let before = store.clone();

        let ops = vec![
            Operation::SetEntityProperty {
                id: a,
                key: "x".to_string(),
                value: 1i64.into(),
            },
            Operation::CreateEntity(Entity::new(EntityId::new(10), "B")),
            Operation::CreateRelationship(Relationship::new(RelationshipId::new(1), a, EntityId::new(10), "R")),
            // Fails: missing entity
            Operation::AddLabel {
                id: EntityId::new(77),
                label: Label::new("X"),
            },
        ];
        assert!(store.apply_all(&ops, 5).is_err());
        assert_eq!(store.entity_count(), before.entity_count());
        assert_eq!(store.relationship_count(), 0);
        assert!(store.get_entity(a).unwrap().get_property("x").is_none());
        assert_eq!(store.version(), 0);

        store.apply_all(&ops[..3], 5).unwrap();
        assert_eq!(store.version(), 5);
        assert_eq!(store.get_entity(EntityId::new(10)).unwrap().version, 5);
        assert_eq!(store.relationship_count(), 1);
    }

    #[test]
    fn test_revert_detach_delete() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("A")], PropertyMap::new()).unwrap();
        let b = store.add_entity(vec![Label::new("B")], PropertyMap::new()).unwrap();
        store.add_relationship(a, b, "R", PropertyMap::new()).unwrap();

        let ops = vec![
            Operation::DeleteEntity { id: a, detach: true },
            Operation::DeleteRelationship { id: RelationshipId::new(42) },
        ];
        assert!(store.apply_all(&ops, 2).is_err());
        assert!(store.has_entity(a));
        assert_eq!(store.outgoing(a).len(), 1);
    }

    #[test]
    fn test_operation_target() {
        let op = Operation::DeleteRelationship { id: RelationshipId::new(3) };
        assert_eq!(op.target(), RecordId::Relationship(RelationshipId::new(3)));
        assert!(op.is_delete());
        assert_eq!(op.name(), "DeleteRelationship");
    }
}
