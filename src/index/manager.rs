//! Manager for secondary indexes
//!
//! Handles creation, deletion, maintenance and lookup of label, property and
//! composite indexes. The graph store calls the maintenance hooks on every
//! insert, removal and replacement, so indexes always reflect committed data.

use super::btree::BPlusTree;
use super::{IndexError, IndexResult};
use crate::graph::{Entity, Label, PropertyMap, PropertyPath, PropertyValue, RelType, Relationship};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use tracing::{debug, info};

/// What an index covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexScope {
    Label(Label),
    RelType(RelType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Ordered id set of every entity with the label
    Label,
    /// One property
    Property,
    /// Ordered tuple of two or more properties
    Composite,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub scope: IndexScope,
    pub properties: Vec<PropertyPath>,
    pub kind: IndexKind,
}

impl IndexDefinition {
    pub fn label(label: impl Into<Label>) -> Self {
        IndexDefinition {
            scope: IndexScope::Label(label.into()),
            properties: Vec::new(),
            kind: IndexKind::Label,
        }
    }

    pub fn property(label: impl Into<Label>, path: impl Into<PropertyPath>) -> Self {
        IndexDefinition {
            scope: IndexScope::Label(label.into()),
            properties: vec![path.into()],
            kind: IndexKind::Property,
        }
    }

    pub fn composite(label: impl Into<Label>, paths: Vec<PropertyPath>) -> Self {
        IndexDefinition {
            scope: IndexScope::Label(label.into()),
            properties: paths,
            kind: IndexKind::Composite,
        }
    }

    pub fn relationship_property(rel_type: impl Into<RelType>, path: impl Into<PropertyPath>) -> Self {
        IndexDefinition {
            scope: IndexScope::RelType(rel_type.into()),
            properties: vec![path.into()],
            kind: IndexKind::Property,
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        let ok = match self.kind {
            IndexKind::Label => self.properties.is_empty() && matches!(self.scope, IndexScope::Label(_)),
            IndexKind::Property => self.properties.len() == 1,
            IndexKind::Composite => self.properties.len() >= 2,
        };
        if ok {
            Ok(())
        } else {
            Err(IndexError::InvalidDefinition(self.to_string()))
        }
    }

    /// Build the key for a record, or `None` if the record is not indexed
    fn key_for(&self, props: &PropertyMap) -> Option<IndexKey> {
        match self.kind {
            IndexKind::Label => Some(Vec::new()),
            IndexKind::Property | IndexKind::Composite => self
                .properties
                .iter()
                .map(|path| path.resolve(props).filter(|v| !v.is_null()).cloned())
                .collect(),
        }
    }

    fn covers_entity(&self, entity: &Entity) -> bool {
        matches!(&self.scope, IndexScope::Label(l) if entity.has_label(l))
    }

    fn covers_relationship(&self, rel: &Relationship) -> bool {
        matches!(&self.scope, IndexScope::RelType(t) if &rel.rel_type == t)
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            IndexScope::Label(l) => write!(f, ":{}", l)?,
            IndexScope::RelType(t) => write!(f, "[:{}]", t)?,
        }
        if !self.properties.is_empty() {
            let paths: Vec<String> = self.properties.iter().map(|p| p.to_string()).collect();
            write!(f, "({})", paths.join(", "))?;
        }
        Ok(())
    }
}

/// Index key: one value for property indexes, a tuple for composites, empty
/// for label indexes
pub type IndexKey = Vec<PropertyValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub definition: IndexDefinition,
    pub keys: usize,
    pub entries: usize,
    pub height: usize,
}

/// Manager for all indexes of one graph
#[derive(Debug, Clone)]
pub struct IndexManager {
    order: usize,
    indexes: IndexMap<IndexDefinition, BPlusTree<IndexKey>>,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new(super::DEFAULT_ORDER)
    }
}

impl IndexManager {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            indexes: IndexMap::new(),
        }
    }

    pub fn btree_order(&self) -> usize {
        self.order
    }

    /// Register an empty index; the caller backfills it
    pub fn create_index(&mut self, def: IndexDefinition) -> IndexResult<()> {
        def.validate()?;
        if self.indexes.contains_key(&def) {
            return Err(IndexError::AlreadyExists(def.to_string()));
        }
        info!("Creating index {}", def);
        self.indexes.insert(def, BPlusTree::new(self.order));
        Ok(())
    }

    /// Create and fill an index from existing records
    pub fn create_and_backfill<'a>(
        &mut self,
        def: IndexDefinition,
        entities: impl Iterator<Item = &'a Entity>,
        relationships: impl Iterator<Item = &'a Relationship>,
    ) -> IndexResult<()> {
        self.create_index(def.clone())?;
        let tree = match self.indexes.get_mut(&def) {
            Some(tree) => tree,
            None => return Err(IndexError::NotFound(def.to_string())),
        };
        match def.scope {
            IndexScope::Label(_) => {
                for entity in entities.filter(|e| def.covers_entity(e)) {
                    if let Some(key) = def.key_for(&entity.properties) {
                        tree.insert(key, entity.id.as_u64());
                    }
                }
            }
            IndexScope::RelType(_) => {
                for rel in relationships.filter(|r| def.covers_relationship(r)) {
                    if let Some(key) = def.key_for(&rel.properties) {
                        tree.insert(key, rel.id.as_u64());
                    }
                }
            }
        }
        debug!("Backfilled index {} with {} entries", def, tree.entry_count());
        Ok(())
    }

    pub fn drop_index(&mut self, def: &IndexDefinition) -> IndexResult<()> {
        match self.indexes.shift_remove(def) {
            Some(_) => {
                info!("Dropped index {}", def);
                Ok(())
            }
            None => Err(IndexError::NotFound(def.to_string())),
        }
    }

    pub fn has_index(&self, def: &IndexDefinition) -> bool {
        self.indexes.contains_key(def)
    }

    pub fn indexes(&self) -> Vec<&IndexDefinition> {
        self.indexes.keys().collect()
    }

    /// Single-property index on a label and path
    pub fn find_property_index(&self, label: &Label, path: &PropertyPath) -> Option<&IndexDefinition> {
        self.indexes.keys().find(|def| {
            def.kind == IndexKind::Property
                && matches!(&def.scope, IndexScope::Label(l) if l == label)
                && def.properties.first() == Some(path)
        })
    }

    pub fn on_entity_insert(&mut self, entity: &Entity) {
        for (def, tree) in self.indexes.iter_mut() {
            if def.covers_entity(entity) {
                if let Some(key) = def.key_for(&entity.properties) {
                    tree.insert(key, entity.id.as_u64());
                }
            }
        }
    }

    pub fn on_entity_remove(&mut self, entity: &Entity) {
        for (def, tree) in self.indexes.iter_mut() {
            if def.covers_entity(entity) {
                if let Some(key) = def.key_for(&entity.properties) {
                    tree.remove(&key, entity.id.as_u64());
                }
            }
        }
    }

    /// Property or label change: drop the old keys and add the new ones
    pub fn on_entity_update(&mut self, old: &Entity, new: &Entity) {
        self.on_entity_remove(old);
        self.on_entity_insert(new);
    }

    pub fn on_relationship_insert(&mut self, rel: &Relationship) {
        for (def, tree) in self.indexes.iter_mut() {
            if def.covers_relationship(rel) {
                if let Some(key) = def.key_for(&rel.properties) {
                    tree.insert(key, rel.id.as_u64());
                }
            }
        }
    }

    pub fn on_relationship_remove(&mut self, rel: &Relationship) {
        for (def, tree) in self.indexes.iter_mut() {
            if def.covers_relationship(rel) {
                if let Some(key) = def.key_for(&rel.properties) {
                    tree.remove(&key, rel.id.as_u64());
                }
            }
        }
    }

    pub fn on_relationship_update(&mut self, old: &Relationship, new: &Relationship) {
        self.on_relationship_remove(old);
        self.on_relationship_insert(new);
    }

    /// Ids with `path = value` under `scope`; `None` when no such index exists
    pub fn point_search(
        &self,
        scope: &IndexScope,
        path: &PropertyPath,
        value: &PropertyValue,
    ) -> Option<Vec<u64>> {
        let tree = self.property_tree(scope, path)?;
        let key = vec![value.clone()];
        Some(tree.get(&key).map(|ids| ids.iter().copied().collect()).unwrap_or_default())
    }

    /// Ids whose value lies within the bounds, in value order
    pub fn range_search(
        &self,
        scope: &IndexScope,
        path: &PropertyPath,
        lower: Bound<&PropertyValue>,
        upper: Bound<&PropertyValue>,
    ) -> Option<Vec<u64>> {
        let tree = self.property_tree(scope, path)?;
        let lower = lower.map(|v| vec![v.clone()]);
        let upper = upper.map(|v| vec![v.clone()]);
        Some(tree.range(lower.as_ref(), upper.as_ref()))
    }

    /// Ids matching a full tuple or a leading prefix of a composite index
    pub fn composite_search(&self, def: &IndexDefinition, prefix: &[PropertyValue]) -> IndexResult<Vec<u64>> {
        let tree = self
            .indexes
            .get(def)
            .ok_or_else(|| IndexError::NotFound(def.to_string()))?;
        if prefix.len() > def.properties.len() {
            return Err(IndexError::InvalidDefinition(format!(
                "{} values given for {}",
                prefix.len(),
                def
            )));
        }
        let start = prefix.to_vec();
        let mut ids = BTreeSet::new();
        for (key, posting) in tree.range_entries(Bound::Included(&start), Bound::Unbounded) {
            if !key.starts_with(prefix) {
                break;
            }
            ids.extend(posting.iter().copied());
        }
        Ok(ids.into_iter().collect())
    }

    /// Ordered ids of a label index, if one exists
    pub fn label_ids(&self, label: &Label) -> Option<Vec<u64>> {
        let def = IndexDefinition::label(label.clone());
        let tree = self.indexes.get(&def)?;
        Some(tree.get(&Vec::new()).map(|ids| ids.iter().copied().collect()).unwrap_or_default())
    }

    fn property_tree(&self, scope: &IndexScope, path: &PropertyPath) -> Option<&BPlusTree<IndexKey>> {
        self.indexes
            .iter()
            .find(|(def, _)| def.kind == IndexKind::Property && &def.scope == scope && def.properties.first() == Some(path))
            .map(|(_, tree)| tree)
    }

    /// Clear every index and refill from the given records
    pub fn rebuild<'a>(
        &mut self,
        entities: impl Iterator<Item = &'a Entity>,
        relationships: impl Iterator<Item = &'a Relationship>,
    ) {
        for tree in self.indexes.values_mut() {
            tree.clear();
        }
        for entity in entities {
            self.on_entity_insert(entity);
        }
        for rel in relationships {
            self.on_relationship_insert(rel);
        }
        info!("Rebuilt {} indexes", self.indexes.len());
    }

    pub fn verify(&self) -> IndexResult<()> {
        for (def, tree) in &self.indexes {
            tree.verify()
                .map_err(|e| IndexError::Invariant(format!("{}: {}", def, e)))?;
        }
        Ok(())
    }

    pub fn statistics(&self) -> Vec<IndexStats> {
        self.indexes
            .iter()
            .map(|(def, tree)| IndexStats {
                definition: def.clone(),
                keys: tree.len(),
                entries: tree.entry_count(),
                height: tree.height(),
            })
            .collect()
    }
}
