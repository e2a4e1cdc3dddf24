//! Merging one graph into another
//!
//! Merging is planned against a [`GraphView`] into a list of [`Operation`]s,
//! so the same plan can be applied directly to a store or staged on a
//! transaction. Merging a graph into itself produces no operations.

use super::entity::Entity;
use super::operation::Operation;
use super::property::{PropertyPath, PropertyValue};
use super::relationship::Relationship;
use super::store::{GraphResult, GraphStore};
use super::types::{Direction, EntityId, Label, RelType, RelationshipId};
use super::view::GraphView;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How incoming entities are matched to existing ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupStrategy {
    /// Same id means same entity; ids are preserved
    ById,
    /// Entities with `label` and equal `property` are the same entity;
    /// unmatched entities get fresh ids
    ByKey { label: Label, property: PropertyPath },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub entities_created: usize,
    pub entities_merged: usize,
    pub relationships_created: usize,
    pub relationships_merged: usize,
    /// Incoming relationships skipped because an existing one with the same
    /// id connects different entities
    pub conflicts: usize,
}

/// Source of fresh ids while planning
pub trait IdSource {
    fn next_entity_id(&mut self) -> EntityId;
    fn next_relationship_id(&mut self) -> RelationshipId;
}

/// Counter-backed [`IdSource`]
#[derive(Debug, Clone, Copy)]
pub struct SequentialIds {
    pub next_entity: u64,
    pub next_relationship: u64,
}

impl IdSource for SequentialIds {
    fn next_entity_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_entity);
        self.next_entity += 1;
        id
    }

    fn next_relationship_id(&mut self) -> RelationshipId {
        let id = RelationshipId::new(self.next_relationship);
        self.next_relationship += 1;
        id
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub operations: Vec<Operation>,
    pub report: MergeReport,
}

/// Plan the operations that merge `source` into `target`
pub fn plan_merge<V: GraphView + ?Sized>(
    target: &V,
    source: &GraphStore,
    strategy: &DedupStrategy,
    ids: &mut dyn IdSource,
) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut mapping: FxHashMap<EntityId, EntityId> = FxHashMap::default();
    // Entities created by this plan, for matching later incoming ones
    let mut created: FxHashMap<EntityId, Entity> = FxHashMap::default();
    let mut keyed: FxHashMap<PropertyValue, EntityId> = FxHashMap::default();

    for incoming in source.all_entities() {
        let existing = match strategy {
            DedupStrategy::ById => Some(incoming.id).filter(|id| target.contains_entity(*id) || created.contains_key(id)),
            DedupStrategy::ByKey { label, property } => match incoming.property_at(property) {
                Some(key) if incoming.has_label(label) && !key.is_null() => keyed
                    .get(key)
                    .copied()
                    .or_else(|| find_by_key(target, label, property, key)),
                _ => None,
            },
        };

        match existing {
            Some(id) => {
                let current = created.get(&id).or_else(|| target.entity(id));
                if let Some(current) = current {
                    let ops = entity_updates(current, incoming);
                    if let Some(copy) = created.get_mut(&id) {
                        for op in &ops {
                            apply_to_copy(copy, op);
                        }
                    }
                    plan.operations.extend(ops);
                }
                plan.report.entities_merged += 1;
                mapping.insert(incoming.id, id);
            }
            None => {
                let id = match strategy {
                    DedupStrategy::ById => incoming.id,
                    DedupStrategy::ByKey { .. } => ids.next_entity_id(),
                };
                let mut entity = incoming.clone();
                entity.id = id;
                if let DedupStrategy::ByKey { label, property } = strategy {
                    if let Some(key) = entity.property_at(property).filter(|_| entity.has_label(label)) {
                        if !key.is_null() {
                            keyed.insert(key.clone(), id);
                        }
                    }
                }
                created.insert(id, entity.clone());
                plan.operations.push(Operation::CreateEntity(entity));
                plan.report.entities_created += 1;
                mapping.insert(incoming.id, id);
            }
        }
    }

    let mut created_rels: FxHashMap<(EntityId, EntityId, RelType), RelationshipId> = FxHashMap::default();
    for incoming in source.all_relationships() {
        let (Some(&src), Some(&dst)) = (mapping.get(&incoming.source), mapping.get(&incoming.target)) else {
            continue;
        };

        let existing = match strategy {
            DedupStrategy::ById => match target.relationship(incoming.id) {
                Some(rel) if rel.source == src && rel.target == dst && rel.rel_type == incoming.rel_type => Some(rel.id),
                Some(_) => {
                    plan.report.conflicts += 1;
                    continue;
                }
                None => None,
            },
            DedupStrategy::ByKey { .. } => created_rels
                .get(&(src, dst, incoming.rel_type.clone()))
                .copied()
                .or_else(|| {
                    target
                        .relationships_of(src, Direction::Outgoing, std::slice::from_ref(&incoming.rel_type))
                        .into_iter()
                        .find(|rel| rel.target == dst)
                        .map(|rel| rel.id)
                }),
        };

        match existing {
            Some(id) => {
                if let Some(current) = target.relationship(id) {
                    for (key, value) in &incoming.properties {
                        if current.get_property(key) != Some(value) {
                            plan.operations.push(Operation::SetRelationshipProperty {
                                id,
                                key: key.clone(),
                                value: value.clone(),
                            });
                        }
                    }
                }
                plan.report.relationships_merged += 1;
            }
            None => {
                let id = match strategy {
                    DedupStrategy::ById => incoming.id,
                    DedupStrategy::ByKey { .. } => ids.next_relationship_id(),
                };
                let mut rel: Relationship = incoming.clone();
                rel.id = id;
                rel.source = src;
                rel.target = dst;
                created_rels.insert((src, dst, rel.rel_type.clone()), id);
                plan.operations.push(Operation::CreateRelationship(rel));
                plan.report.relationships_created += 1;
            }
        }
    }

    debug!(
        "Planned merge: {} operations, {:?}",
        plan.operations.len(),
        plan.report
    );
    plan
}

fn find_by_key<V: GraphView + ?Sized>(
    target: &V,
    label: &Label,
    property: &PropertyPath,
    key: &PropertyValue,
) -> Option<EntityId> {
    let candidates = target
        .index_lookup(label, property, key)
        .unwrap_or_else(|| target.entity_ids_with_label(label));
    candidates.into_iter().find(|id| {
        target
            .entity(*id)
            .map(|e| e.has_label(label) && e.property_at(property) == Some(key))
            .unwrap_or(false)
    })
}

/// Labels and properties the incoming entity adds or changes
fn entity_updates(current: &Entity, incoming: &Entity) -> Vec<Operation> {
    let mut ops = Vec::new();
    for label in incoming.labels.difference(&current.labels) {
        ops.push(Operation::AddLabel {
            id: current.id,
            label: label.clone(),
        });
    }
    for (key, value) in &incoming.properties {
        if current.get_property(key) != Some(value) {
            ops.push(Operation::SetEntityProperty {
                id: current.id,
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    ops
}

fn apply_to_copy(entity: &mut Entity, op: &Operation) {
    match op {
        Operation::AddLabel { label, .. } => {
            entity.add_label(label.clone());
        }
        Operation::SetEntityProperty { key, value, .. } => {
            entity.set_property(key.clone(), value.clone());
        }
        _ => {}
    }
}

impl GraphStore {
    /// Merge `other` into this store
    pub fn merge(&mut self, other: &GraphStore, strategy: DedupStrategy) -> GraphResult<MergeReport> {
        let (next_entity, next_relationship) = self.next_ids();
        let mut ids = SequentialIds {
            next_entity,
            next_relationship,
        };
        let plan = plan_merge(&*self, other, &strategy, &mut ids);
        let version = self.version();
        self.apply_all(&plan.operations, version)?;
        self.reserve_ids(ids.next_entity, ids.next_relationship);
        Ok(plan.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PropertyMap;

    fn person(store: &mut GraphStore, email: &str) -> EntityId {
        let mut props = PropertyMap::new();
        props.insert("email".to_string(), email.into());
        store.add_entity(vec![Label::new("Person")], props).unwrap()
    }

    #[test]
    fn test_self_merge_is_idempotent() {
        let mut store = GraphStore::new();
        let a = person(&mut store, "a@x");
        let b = person(&mut store, "b@x");
        store.add_relationship(a, b, "KNOWS", PropertyMap::new()).unwrap();

        let copy = store.clone();
        let report = store.merge(&copy, DedupStrategy::ById).unwrap();
        assert_eq!(store.entity_count(), 2);
        assert_eq!(store.relationship_count(), 1);
        assert_eq!(report.entities_created, 0);
        assert_eq!(report.entities_merged, 2);
        assert_eq!(report.relationships_merged, 1);

        let key = DedupStrategy::ByKey {
            label: Label::new("Person"),
            property: PropertyPath::single("email"),
        };
        store.merge(&copy, key).unwrap();
        assert_eq!(store.entity_count(), 2);
        assert_eq!(store.relationship_count(), 1);
    }

    #[test]
    fn test_merge_by_key_dedups_and_remaps() {
        let mut target = GraphStore::new();
        let a = person(&mut target, "a@x");

        let mut source = GraphStore::new();
        let sa = person(&mut source, "a@x");
        let sc = person(&mut source, "c@x");
        source.set_entity_property(sa, "name", "Alice".into()).unwrap();
        source.add_relationship(sa, sc, "KNOWS", PropertyMap::new()).unwrap();

        let report = target
            .merge(
                &source,
                DedupStrategy::ByKey {
                    label: Label::new("Person"),
                    property: PropertyPath::single("email"),
                },
            )
            .unwrap();
        assert_eq!(report.entities_merged, 1);
        assert_eq!(report.entities_created, 1);
        assert_eq!(report.relationships_created, 1);
        assert_eq!(target.entity_count(), 2);
        assert_eq!(target.get_entity(a).unwrap().get_property("name"), Some(&"Alice".into()));
        assert_eq!(target.outgoing(a).len(), 1);
    }

    #[test]
    fn test_merge_by_id_conflict() {
        let mut target = GraphStore::new();
        let a = person(&mut target, "a@x");
        let b = person(&mut target, "b@x");
        target.add_relationship(a, b, "KNOWS", PropertyMap::new()).unwrap();

        let mut source = GraphStore::new();
        let sa = person(&mut source, "a@x");
        let sb = person(&mut source, "b@x");
        // Same relationship id, reversed endpoints
        source.add_relationship(sb, sa, "KNOWS", PropertyMap::new()).unwrap();

        let report = target.merge(&source, DedupStrategy::ById).unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(target.relationship_count(), 1);
    }
}
