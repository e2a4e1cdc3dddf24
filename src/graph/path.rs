//! Paths and traversals

use super::types::{Direction, EntityId, RelType, RelationshipId};
use super::view::GraphView;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Alternating entity/relationship sequence; `entities.len() == relationships.len() + 1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    pub entities: Vec<EntityId>,
    pub relationships: Vec<RelationshipId>,
}

impl Path {
    pub fn single(start: EntityId) -> Self {
        Path {
            entities: vec![start],
            relationships: Vec::new(),
        }
    }

    pub fn start(&self) -> EntityId {
        self.entities[0]
    }

    pub fn end(&self) -> EntityId {
        self.entities[self.entities.len() - 1]
    }

    /// Number of relationships
    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }

    pub fn push(&mut self, rel: RelationshipId, next: EntityId) {
        self.relationships.push(rel);
        self.entities.push(next);
    }
}

/// Breadth-first shortest path from `from` to `to`
pub fn shortest_path<V: GraphView + ?Sized>(
    view: &V,
    from: EntityId,
    to: EntityId,
    direction: Direction,
    types: &[RelType],
    max_depth: Option<usize>,
) -> Option<Path> {
    if !view.contains_entity(from) || !view.contains_entity(to) {
        return None;
    }
    if from == to {
        return Some(Path::single(from));
    }

    let mut parents: FxHashMap<EntityId, (EntityId, RelationshipId)> = FxHashMap::default();
    let mut visited: FxHashSet<EntityId> = FxHashSet::default();
    let mut queue = VecDeque::new();
    visited.insert(from);
    queue.push_back((from, 0usize));

    while let Some((current, depth)) = queue.pop_front() {
        if max_depth.map(|m| depth >= m).unwrap_or(false) {
            continue;
        }
        for rel in view.relationships_of(current, direction, types) {
            let next = rel.other_end(current);
            if !visited.insert(next) {
                continue;
            }
            parents.insert(next, (current, rel.id));
            if next == to {
                return Some(rebuild(from, to, &parents));
            }
            queue.push_back((next, depth + 1));
        }
    }
    None
}

fn rebuild(from: EntityId, to: EntityId, parents: &FxHashMap<EntityId, (EntityId, RelationshipId)>) -> Path {
    let mut entities = vec![to];
    let mut relationships = Vec::new();
    let mut current = to;
    while current != from {
        match parents.get(&current) {
            Some((prev, rel)) => {
                relationships.push(*rel);
                entities.push(*prev);
                current = *prev;
            }
            None => break,
        }
    }
    entities.reverse();
    relationships.reverse();
    Path { entities, relationships }
}

/// Every relationship-unique path from `from` with `min..=max` hops
pub fn paths<V: GraphView + ?Sized>(
    view: &V,
    from: EntityId,
    direction: Direction,
    types: &[RelType],
    min: usize,
    max: usize,
) -> Vec<Path> {
    let mut out = Vec::new();
    if !view.contains_entity(from) {
        return out;
    }
    let mut current = Path::single(from);
    walk(view, &mut current, direction, types, min, max, &mut out);
    out
}

fn walk<V: GraphView + ?Sized>(
    view: &V,
    current: &mut Path,
    direction: Direction,
    types: &[RelType],
    min: usize,
    max: usize,
    out: &mut Vec<Path>,
) {
    if current.len() >= min {
        out.push(current.clone());
    }
    if current.len() >= max {
        return;
    }
    let at = current.end();
    for rel in view.relationships_of(at, direction, types) {
        if current.relationships.contains(&rel.id) {
            continue;
        }
        current.push(rel.id, rel.other_end(at));
        walk(view, current, direction, types, min, max, out);
        current.relationships.pop();
        current.entities.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStore, Label, PropertyMap};

    fn chain(n: usize) -> (GraphStore, Vec<EntityId>) {
        let mut store = GraphStore::new();
        let ids: Vec<EntityId> = (0..n)
            .map(|_| store.add_entity(vec![Label::new("N")], PropertyMap::new()).unwrap())
            .collect();
        for pair in ids.windows(2) {
            store.add_relationship(pair[0], pair[1], "NEXT", PropertyMap::new()).unwrap();
        }
        (store, ids)
    }

    #[test]
    fn test_shortest_path() {
        let (mut store, ids) = chain(5);
        let path = shortest_path(&store, ids[0], ids[4], Direction::Outgoing, &[], None).unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.start(), ids[0]);
        assert_eq!(path.end(), ids[4]);

        // A shortcut wins
        store.add_relationship(ids[0], ids[3], "NEXT", PropertyMap::new()).unwrap();
        let path = shortest_path(&store, ids[0], ids[4], Direction::Outgoing, &[], None).unwrap();
        assert_eq!(path.len(), 2);

        assert!(shortest_path(&store, ids[4], ids[0], Direction::Outgoing, &[], None).is_none());
        assert!(shortest_path(&store, ids[4], ids[0], Direction::Incoming, &[], None).is_some());
        assert!(shortest_path(&store, ids[0], ids[4], Direction::Outgoing, &[], Some(1)).is_none());
        assert!(shortest_path(&store, ids[0], ids[4], Direction::Outgoing, &[RelType::new("OTHER")], None).is_none());
    }

    #[test]
    fn test_bounded_paths() {
        let (store, ids) = chain(4);
        let found = paths(&store, ids[0], Direction::Outgoing, &[], 1, 2);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| (1..=2).contains(&p.len())));
        let all = paths(&store, ids[0], Direction::Outgoing, &[], 0, 10);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_paths_are_relationship_unique() {
        let mut store = GraphStore::new();
        let a = store.add_entity(vec![Label::new("N")], PropertyMap::new()).unwrap();
        let b = store.add_entity(vec![Label::new("N")], PropertyMap::new()).unwrap();
        store.add_relationship(a, b, "R", PropertyMap::new()).unwrap();
        // Undirected walks may not reuse the single relationship
        let found = paths(&store, a, Direction::Both, &[], 1, 5);
        assert_eq!(found.len(), 1);
    }
}
