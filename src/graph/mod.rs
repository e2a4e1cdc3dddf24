//! Property graph store
//!
//! This module implements the property graph data model:
//! - Entities with one or more labels, properties and metadata
//! - Directed, typed relationships with properties; parallel relationships allowed
//! - Arena storage with adjacency lists and label/type lookups
//! - Traversals, graph merging and content-addressed snapshots

pub mod entity;
pub mod merge;
pub mod operation;
pub mod path;
pub mod property;
pub mod relationship;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod view;

pub use entity::Entity;
pub use merge::{plan_merge, DedupStrategy, IdSource, MergePlan, MergeReport, SequentialIds};
pub use operation::Operation;
pub use path::Path;
pub use property::{PropertyMap, PropertyPath, PropertyValue, ValueType};
pub use relationship::Relationship;
pub use snapshot::{SnapshotManifest, SNAPSHOT_ROOT};
pub use store::{GraphError, GraphResult, GraphStatistics, GraphStore};
pub use types::{Direction, EntityId, Label, RecordId, RelType, RelationshipId};
pub use view::GraphView;

impl GraphStore {
    pub fn shortest_path(
        &self,
        from: EntityId,
        to: EntityId,
        direction: Direction,
        types: &[RelType],
        max_depth: Option<usize>,
    ) -> Option<Path> {
        path::shortest_path(self, from, to, direction, types, max_depth)
    }

    pub fn paths(&self, from: EntityId, direction: Direction, types: &[RelType], min: usize, max: usize) -> Vec<Path> {
        path::paths(self, from, direction, types, min, max)
    }
}
