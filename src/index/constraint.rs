//! Per-label constraints
//!
//! Constraints are checked against a [`GraphView`], so the same code validates
//! a staged write (committed state plus the transaction's pending writes) and
//! the final state at commit.

use crate::graph::{Entity, EntityId, GraphView, Label, PropertyPath, PropertyValue, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Predicate for custom constraints
pub type CustomPredicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// No two entities with the label share a value
    Unique(PropertyPath),
    /// Every entity with the label has the property
    Existence(PropertyPath),
    /// The property, when present, has the given type
    Type(PropertyPath, ValueType),
    /// Arbitrary predicate; not persisted in snapshots
    #[serde(skip)]
    Custom { name: String, predicate: CustomPredicate },
}

impl ConstraintKind {
    pub fn custom(name: impl Into<String>, predicate: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        ConstraintKind::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn is_persistable(&self) -> bool {
        !matches!(self, ConstraintKind::Custom { .. })
    }
}

impl fmt::Debug for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Unique(p) => write!(f, "Unique({})", p),
            ConstraintKind::Existence(p) => write!(f, "Existence({})", p),
            ConstraintKind::Type(p, t) => write!(f, "Type({}, {})", p, t),
            ConstraintKind::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

impl PartialEq for ConstraintKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstraintKind::Unique(a), ConstraintKind::Unique(b)) => a == b,
            (ConstraintKind::Existence(a), ConstraintKind::Existence(b)) => a == b,
            (ConstraintKind::Type(a, x), ConstraintKind::Type(b, y)) => a == b && x == y,
            (ConstraintKind::Custom { name: a, .. }, ConstraintKind::Custom { name: b, .. }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub label: Label,
    pub kind: ConstraintKind,
}

impl Constraint {
    pub fn new(label: impl Into<Label>, kind: ConstraintKind) -> Self {
        Constraint {
            label: label.into(),
            kind,
        }
    }

    pub fn name(&self) -> String {
        match &self.kind {
            ConstraintKind::Unique(p) => format!("unique :{}({})", self.label, p),
            ConstraintKind::Existence(p) => format!("exists :{}({})", self.label, p),
            ConstraintKind::Type(p, t) => format!("type :{}({}) {}", self.label, p, t),
            ConstraintKind::Custom { name, .. } => format!("{} :{}", name, self.label),
        }
    }
}

/// Constraint violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Unique constraint on :{label}({property}) violated by {entity}: value {value} already held by {existing}")]
    Unique {
        entity: EntityId,
        label: Label,
        property: PropertyPath,
        value: PropertyValue,
        existing: EntityId,
    },

    #[error("Existence constraint on :{label}({property}) violated by {entity}")]
    Existence {
        entity: EntityId,
        label: Label,
        property: PropertyPath,
    },

    #[error("Type constraint on :{label}({property}) requires {expected}, {entity} has {found}")]
    Type {
        entity: EntityId,
        label: Label,
        property: PropertyPath,
        expected: ValueType,
        found: String,
    },

    #[error("Constraint '{name}' on :{label} rejected {entity}")]
    Custom { entity: EntityId, label: Label, name: String },
}

impl ConstraintError {
    pub fn entity(&self) -> EntityId {
        match self {
            ConstraintError::Unique { entity, .. }
            | ConstraintError::Existence { entity, .. }
            | ConstraintError::Type { entity, .. }
            | ConstraintError::Custom { entity, .. } => *entity,
        }
    }
}

pub type ConstraintResult<T> = Result<T, ConstraintError>;

/// Registered constraints of one graph
#[derive(Debug, Clone, Default)]
pub struct ConstraintManager {
    constraints: Vec<Constraint>,
}

impl ConstraintManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constraint; returns false if an equal one exists
    pub fn add(&mut self, constraint: Constraint) -> bool {
        if self.constraints.contains(&constraint) {
            return false;
        }
        self.constraints.push(constraint);
        true
    }

    pub fn remove(&mut self, constraint: &Constraint) -> bool {
        let before = self.constraints.len();
        self.constraints.retain(|c| c != constraint);
        self.constraints.len() != before
    }

    pub fn all(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn for_label<'a>(&'a self, label: &'a Label) -> impl Iterator<Item = &'a Constraint> + 'a {
        self.constraints.iter().filter(move |c| &c.label == label)
    }

    /// Check every constraint that applies to `entity` as it would exist in `view`
    pub fn validate_entity<V: GraphView + ?Sized>(&self, entity: &Entity, view: &V) -> ConstraintResult<()> {
        for constraint in self.constraints.iter().filter(|c| entity.has_label(&c.label)) {
            check(constraint, entity, view)?;
        }
        Ok(())
    }
}

fn check<V: GraphView + ?Sized>(constraint: &Constraint, entity: &Entity, view: &V) -> ConstraintResult<()> {
    let label = &constraint.label;
    match &constraint.kind {
        ConstraintKind::Existence(path) => match entity.property_at(path) {
            Some(v) if !v.is_null() => Ok(()),
            _ => Err(ConstraintError::Existence {
                entity: entity.id,
                label: label.clone(),
                property: path.clone(),
            }),
        },
        ConstraintKind::Type(path, expected) => match entity.property_at(path) {
            Some(v) if !v.is_null() && !v.has_type(*expected) => Err(ConstraintError::Type {
                entity: entity.id,
                label: label.clone(),
                property: path.clone(),
                expected: *expected,
                found: v.type_name().to_string(),
            }),
            _ => Ok(()),
        },
        ConstraintKind::Unique(path) => {
            let value = match entity.property_at(path) {
                Some(v) if !v.is_null() => v,
                _ => return Ok(()),
            };
            let candidates = match view.index_lookup(label, path, value) {
                Some(ids) => ids,
                None => view.entity_ids_with_label(label),
            };
            for other in candidates {
                if other == entity.id {
                    continue;
                }
                let clash = view
                    .entity(other)
                    .map(|e| e.has_label(label) && e.property_at(path) == Some(value))
                    .unwrap_or(false);
                if clash {
                    return Err(ConstraintError::Unique {
                        entity: entity.id,
                        label: label.clone(),
                        property: path.clone(),
                        value: value.clone(),
                        existing: other,
                    });
                }
            }
            Ok(())
        }
        ConstraintKind::Custom { name, predicate } => {
            if predicate(entity) {
                Ok(())
            } else {
                Err(ConstraintError::Custom {
                    entity: entity.id,
                    label: label.clone(),
                    name: name.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::graph::PropertyMap;

    fn store_with_alice() -> GraphStore {
        let mut store = GraphStore::new();
        let mut props = PropertyMap::new();
        props.insert("email".to_string(), "alice@example.com".into());
        store.add_entity(vec![Label::new("Person")], props).unwrap();
        store
    }

    #[test]
    fn test_unique_constraint() {
        let store = store_with_alice();
        let mut mgr = ConstraintManager::new();
        mgr.add(Constraint::new("Person", ConstraintKind::Unique(PropertyPath::single("email"))));

        let mut dup = Entity::new(EntityId::new(99), "Person");
        dup.set_property("email", "alice@example.com");
        let err = mgr.validate_entity(&dup, &store).unwrap_err();
        assert_eq!(err.entity(), EntityId::new(99));
        assert!(matches!(err, ConstraintError::Unique { .. }));

        let mut other = Entity::new(EntityId::new(99), "Person");
        other.set_property("email", "bob@example.com");
        assert!(mgr.validate_entity(&other, &store).is_ok());

        // Re-validating the holder itself is fine
        let alice = store.get_entity(EntityId::new(1)).unwrap().clone();
        assert!(mgr.validate_entity(&alice, &store).is_ok());
    }

    #[test]
    fn test_existence_and_type() {
        let store = GraphStore::new();
        let mut mgr = ConstraintManager::new();
        mgr.add(Constraint::new("Person", ConstraintKind::Existence(PropertyPath::single("name"))));
        mgr.add(Constraint::new("Person", ConstraintKind::Type(PropertyPath::single("age"), ValueType::Integer)));

        let mut e = Entity::new(EntityId::new(1), "Person");
        assert!(matches!(
            mgr.validate_entity(&e, &store),
            Err(ConstraintError::Existence { .. })
        ));
        e.set_property("name", "Ann");
        assert!(mgr.validate_entity(&e, &store).is_ok());
        e.set_property("age", "old");
        assert!(matches!(mgr.validate_entity(&e, &store), Err(ConstraintError::Type { .. })));

        // Constraints only apply to their label
        let company = Entity::new(EntityId::new(2), "Company");
        assert!(mgr.validate_entity(&company, &store).is_ok());
    }

    #[test]
    fn test_custom_constraint() {
        let store = GraphStore::new();
        let mut mgr = ConstraintManager::new();
        mgr.add(Constraint::new(
            "Account",
            ConstraintKind::custom("non_negative_balance", |e| {
                e.get_property("balance").and_then(|v| v.as_float()).map(|b| b >= 0.0).unwrap_or(true)
            }),
        ));
        let mut acct = Entity::new(EntityId::new(1), "Account");
        acct.set_property("balance", -5i64);
        let err = mgr.validate_entity(&acct, &store).unwrap_err();
        assert!(err.to_string().contains("non_negative_balance"));
        assert!(!mgr.all()[0].kind.is_persistable());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut mgr = ConstraintManager::new();
        let c = Constraint::new("Person", ConstraintKind::Unique(PropertyPath::single("email")));
        assert!(mgr.add(c.clone()));
        assert!(!mgr.add(c.clone()));
        assert!(mgr.remove(&c));
        assert!(mgr.is_empty());
    }
}
