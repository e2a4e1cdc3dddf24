//! Read access shared by the committed store and transaction overlays

use super::{Direction, Entity, EntityId, Label, PropertyPath, PropertyValue, RelType, Relationship, RelationshipId};

/// Read-only view of a graph
///
/// Implemented by [`GraphStore`](super::GraphStore) for committed data and by
/// the transaction overlay, which layers staged writes on top of it.
pub trait GraphView {
    fn entity(&self, id: EntityId) -> Option<&Entity>;

    fn relationship(&self, id: RelationshipId) -> Option<&Relationship>;

    /// Every visible entity id, ascending
    fn entity_ids(&self) -> Vec<EntityId>;

    /// Ids of visible entities carrying `label`, ascending
    fn entity_ids_with_label(&self, label: &Label) -> Vec<EntityId>;

    /// Relationships attached to `id` in `direction`; self-loops appear once
    fn relationship_ids_of(&self, id: EntityId, direction: Direction) -> Vec<RelationshipId>;

    /// Candidate ids from a property index on `label`/`path`, or `None` when
    /// no such index exists
    fn index_lookup(&self, label: &Label, path: &PropertyPath, value: &PropertyValue) -> Option<Vec<EntityId>>;

    fn contains_entity(&self, id: EntityId) -> bool {
        self.entity(id).is_some()
    }

    fn relationships_of(&self, id: EntityId, direction: Direction, types: &[RelType]) -> Vec<&Relationship> {
        self.relationship_ids_of(id, direction)
            .into_iter()
            .filter_map(|rid| self.relationship(rid))
            .filter(|rel| types.is_empty() || types.contains(&rel.rel_type))
            .collect()
    }

    /// Distinct neighbour ids reached through matching relationships
    fn neighbors(&self, id: EntityId, direction: Direction, types: &[RelType]) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .relationships_of(id, direction, types)
            .into_iter()
            .map(|rel| rel.other_end(id))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
