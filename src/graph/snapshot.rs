//! Graph snapshots in the content store
//!
//! Every entity and relationship is written as its own block; a manifest
//! block lists their CIDs together with index definitions, declarative
//! constraints and id counters. The named root [`SNAPSHOT_ROOT`] points at
//! the latest manifest.

use super::entity::Entity;
use super::relationship::Relationship;
use super::store::{GraphError, GraphResult, GraphStore};
use crate::index::{Constraint, IndexDefinition};
use crate::storage::{Cid, ContentStore};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SNAPSHOT_ROOT: &str = "snapshot/latest";

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format: u32,
    /// Commit sequence the snapshot reflects
    pub version: u64,
    pub next_entity_id: u64,
    pub next_relationship_id: u64,
    pub entities: Vec<Cid>,
    pub relationships: Vec<Cid>,
    pub indexes: Vec<IndexDefinition>,
    pub constraints: Vec<Constraint>,
    pub created_at: i64,
}

/// Write `graph` and point [`SNAPSHOT_ROOT`] at the new manifest
pub fn save_snapshot(graph: &GraphStore, store: &ContentStore) -> GraphResult<Cid> {
    let entities = graph
        .all_entities()
        .map(|e| store.store(e))
        .collect::<Result<Vec<_>, _>>()?;
    let relationships = graph
        .all_relationships()
        .map(|r| store.store(r))
        .collect::<Result<Vec<_>, _>>()?;
    let (next_entity_id, next_relationship_id) = graph.next_ids();

    let manifest = SnapshotManifest {
        format: MANIFEST_VERSION,
        version: graph.version(),
        next_entity_id,
        next_relationship_id,
        entities,
        relationships,
        indexes: graph.index_manager().indexes().into_iter().cloned().collect(),
        constraints: graph
            .constraints()
            .all()
            .iter()
            .filter(|c| c.kind.is_persistable())
            .cloned()
            .collect(),
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    let root = store.store(&manifest)?;
    store.set_root(SNAPSHOT_ROOT, Some(&root))?;
    store.pin(&root);
    info!(
        "Saved snapshot {} ({} entities, {} relationships, version {})",
        root,
        manifest.entities.len(),
        manifest.relationships.len(),
        manifest.version
    );
    Ok(root)
}

pub fn load_manifest(store: &ContentStore, root: &Cid) -> GraphResult<SnapshotManifest> {
    Ok(store.retrieve(root)?)
}

/// Rebuild a graph from the manifest at `root`
pub fn load_snapshot(store: &ContentStore, root: &Cid, index_order: usize) -> GraphResult<GraphStore> {
    let manifest = load_manifest(store, root)?;
    let mut graph = GraphStore::with_index_order(index_order);

    for cid in &manifest.entities {
        let entity: Entity = store.retrieve(cid)?;
        graph.put_new_entity(entity)?;
    }
    for cid in &manifest.relationships {
        let rel: Relationship = store.retrieve(cid)?;
        if let Some(missing) = [rel.source, rel.target].into_iter().find(|id| !graph.has_entity(*id)) {
            return Err(GraphError::DanglingEndpoint {
                relationship: rel.id,
                entity: missing,
            });
        }
        graph.put_new_relationship(rel)?;
    }
    for def in manifest.indexes {
        graph.create_index(def)?;
    }
    for constraint in manifest.constraints {
        graph.add_constraint(constraint)?;
    }
    graph.reserve_ids(manifest.next_entity_id, manifest.next_relationship_id);
    graph.set_version(manifest.version);

    info!(
        "Loaded snapshot {} ({} entities, {} relationships)",
        root,
        graph.entity_count(),
        graph.relationship_count()
    );
    Ok(graph)
}

/// CID of the latest snapshot manifest, if any
pub fn latest_snapshot(store: &ContentStore) -> GraphResult<Option<Cid>> {
    Ok(store.root(SNAPSHOT_ROOT)?)
}

/// Every block reachable from a manifest, including the manifest itself
pub fn reachable_blocks(store: &ContentStore, root: &Cid) -> GraphResult<Vec<Cid>> {
    let manifest = load_manifest(store, root)?;
    let mut out = Vec::with_capacity(manifest.entities.len() + manifest.relationships.len() + 1);
    out.push(*root);
    out.extend(manifest.entities);
    out.extend(manifest.relationships);
    Ok(out)
}
