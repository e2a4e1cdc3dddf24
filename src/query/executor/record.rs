//! Records flowing through the operator pipeline
//!
//! Entities and relationships travel as id references and are materialised
//! when a row leaves the pipeline, so writes staged earlier in the same query
//! are visible to later property reads.

use crate::graph::{Entity, EntityId, GraphView, Path, PropertyValue, Relationship, RelationshipId};
use crate::graph::property::{cmp_numbers, hash_number};
use indexmap::IndexMap;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Entity by id, resolved through the transaction view on access
    EntityRef(EntityId),
    /// A materialised entity
    Entity(Entity),
    RelationshipRef(RelationshipId),
    Relationship(Relationship),
    Path(Path),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Value::EntityRef(id) => Some(*id),
            Value::Entity(e) => Some(e.id),
            _ => None,
        }
    }

    pub fn relationship_id(&self) -> Option<RelationshipId> {
        match self {
            Value::RelationshipRef(id) => Some(*id),
            Value::Relationship(r) => Some(r.id),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::EntityRef(_) | Value::Entity(_) => "Node",
            Value::RelationshipRef(_) | Value::Relationship(_) => "Relationship",
            Value::Path(_) => "Path",
        }
    }

    /// Storable form; `None` for graph elements and containers holding them
    pub fn to_property(&self) -> Option<PropertyValue> {
        Some(match self {
            Value::Null => PropertyValue::Null,
            Value::Boolean(b) => PropertyValue::Boolean(*b),
            Value::Integer(i) => PropertyValue::Integer(*i),
            Value::Float(f) => PropertyValue::Float(*f),
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::List(items) => PropertyValue::List(items.iter().map(Value::to_property).collect::<Option<_>>()?),
            Value::Map(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| Some((k.clone(), v.to_property()?)))
                    .collect::<Option<_>>()?,
            ),
            _ => return None,
        })
    }

    /// Replace id references with the records `view` holds for them;
    /// references to records the view no longer has are kept
    pub fn materialize<V: GraphView + ?Sized>(self, view: &V) -> Value {
        match self {
            Value::EntityRef(id) => match view.entity(id) {
                Some(e) => Value::Entity(e.clone()),
                None => Value::EntityRef(id),
            },
            Value::RelationshipRef(id) => match view.relationship(id) {
                Some(r) => Value::Relationship(r.clone()),
                None => Value::RelationshipRef(id),
            },
            Value::List(items) => Value::List(items.into_iter().map(|v| v.materialize(view)).collect()),
            Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, v.materialize(view))).collect()),
            other => other,
        }
    }

    /// Three-valued equality: `None` when either side involves null
    pub fn equals(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::List(a), Value::List(b)) => {
                if a.len() != b.len() {
                    return Some(false);
                }
                let mut unknown = false;
                for (x, y) in a.iter().zip(b) {
                    match x.equals(y) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            _ => Some(self == other),
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`; `None` when the values are not
    /// comparable
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                let (a, b) = (self.as_float()?, other.as_float()?);
                if a.is_nan() || b.is_nan() {
                    return None;
                }
                Some(numeric_cmp(self, other))
            }
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    fn order_rank(&self) -> u8 {
        match self {
            Value::Map(_) => 0,
            Value::EntityRef(_) | Value::Entity(_) => 1,
            Value::RelationshipRef(_) | Value::Relationship(_) => 2,
            Value::List(_) => 3,
            Value::Path(_) => 4,
            Value::String(_) => 5,
            Value::Boolean(_) => 6,
            Value::Integer(_) | Value::Float(_) => 7,
            Value::Null => 8,
        }
    }

    /// Total order used by ORDER BY, DISTINCT and MIN/MAX; nulls sort last
    pub fn order_cmp(&self, other: &Value) -> Ordering {
        let (ra, rb) = (self.order_rank(), other.order_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Integer(_) | Value::Float(_), _) => numeric_cmp(self, other),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.order_cmp(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                    match ka.cmp(kb).then_with(|| va.order_cmp(vb)) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Path(a), Value::Path(b)) => a.entities.cmp(&b.entities).then_with(|| a.relationships.cmp(&b.relationships)),
            _ => match (self.entity_id(), other.entity_id()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.relationship_id().cmp(&other.relationship_id()),
            },
        }
    }

    /// JSON form for export; entities become `{id, labels, properties}`
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => json!(b),
            Value::Integer(i) => json!(i),
            Value::Float(f) if f.is_finite() => json!(f),
            Value::Float(f) => json!(float_text(*f)),
            Value::String(s) => json!(s),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::EntityRef(id) => json!({ "id": id.as_u64() }),
            Value::Entity(e) => json!({
                "id": e.id.as_u64(),
                "labels": e.labels.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
                "properties": properties_json(&e.properties),
            }),
            Value::RelationshipRef(id) => json!({ "id": id.as_u64() }),
            Value::Relationship(r) => json!({
                "id": r.id.as_u64(),
                "type": r.rel_type.as_str(),
                "source": r.source.as_u64(),
                "target": r.target.as_u64(),
                "properties": properties_json(&r.properties),
            }),
            Value::Path(p) => json!({
                "entities": p.entities.iter().map(|e| e.as_u64()).collect::<Vec<_>>(),
                "relationships": p.relationships.iter().map(|r| r.as_u64()).collect::<Vec<_>>(),
            }),
        }
    }
}

/// Text of a float, spelling the non-finite values `Infinity`, `-Infinity` and `NaN`
pub(crate) fn float_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        f.to_string()
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Ordering {
    let to_prop = |v: &Value| match v {
        Value::Integer(i) => PropertyValue::Integer(*i),
        Value::Float(f) => PropertyValue::Float(*f),
        _ => PropertyValue::Null,
    };
    cmp_numbers(&to_prop(a), &to_prop(b)).unwrap_or(Ordering::Equal)
}

fn properties_json(props: &crate::graph::PropertyMap) -> serde_json::Value {
    serde_json::Value::Object(
        props
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone()).to_json()))
            .collect(),
    )
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Boolean(b) => Value::Boolean(b),
            PropertyValue::Integer(i) => Value::Integer(i),
            PropertyValue::Float(f) => Value::Float(f),
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            PropertyValue::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

// entities and relationships compare by id; 1 = 1.0
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                numeric_cmp(self, other) == Ordering::Equal
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Path(a), Value::Path(b)) => a == b,
            _ => match (self.entity_id(), other.entity_id()) {
                (Some(a), Some(b)) => a == b,
                (None, None) => match (self.relationship_id(), other.relationship_id()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
                _ => false,
            },
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Integer(i) => {
                2u8.hash(state);
                hash_number(&PropertyValue::Integer(*i), state);
            }
            Value::Float(f) => {
                2u8.hash(state);
                hash_number(&PropertyValue::Float(*f), state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::List(items) => {
                4u8.hash(state);
                items.hash(state);
            }
            Value::Map(map) => {
                5u8.hash(state);
                map.hash(state);
            }
            Value::EntityRef(id) => {
                6u8.hash(state);
                id.hash(state);
            }
            Value::Entity(e) => {
                6u8.hash(state);
                e.id.hash(state);
            }
            Value::RelationshipRef(id) => {
                7u8.hash(state);
                id.hash(state);
            }
            Value::Relationship(r) => {
                7u8.hash(state);
                r.id.hash(state);
            }
            Value::Path(p) => {
                8u8.hash(state);
                p.hash(state);
            }
        }
    }
}

/// A single row: ordered variable bindings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    bindings: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, variable: impl Into<String>, value: Value) {
        self.bindings.insert(variable.into(), value);
    }

    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.bindings.get(variable)
    }

    pub fn has(&self, variable: &str) -> bool {
        self.bindings.contains_key(variable)
    }

    /// Later bindings win
    pub fn merge(&mut self, other: Record) {
        self.bindings.extend(other.bindings);
    }

    /// Only the named variables, in the given order; missing ones are skipped
    pub fn project(&self, variables: &[String]) -> Record {
        let mut out = Record::new();
        for var in variables {
            if let Some(value) = self.bindings.get(var) {
                out.bind(var.clone(), value.clone());
            }
        }
        out
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(|k| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.bindings.values()
    }

    /// Value at column position `i`
    pub fn value_at(&self, i: usize) -> Option<&Value> {
        self.bindings.get_index(i).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn into_materialized<V: GraphView + ?Sized>(self, view: &V) -> Record {
        Record {
            bindings: self
                .bindings
                .into_iter()
                .map(|(k, v)| (k, v.materialize(view)))
                .collect(),
        }
    }

    /// `{column: value}` object in column order
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.bindings.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Label;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_entity_identity() {
        let e = Entity::new(EntityId::new(3), Label::new("Person"));
        assert_eq!(Value::Entity(e), Value::EntityRef(EntityId::new(3)));
        assert_ne!(Value::EntityRef(EntityId::new(3)), Value::RelationshipRef(RelationshipId::new(3)));
        let mut set = FxHashSet::default();
        set.insert(Value::Integer(1));
        assert!(set.contains(&Value::Float(1.0)));
    }

    #[test]
    fn test_three_valued_comparisons() {
        assert_eq!(Value::Null.equals(&Value::Integer(1)), None);
        assert_eq!(Value::Integer(1).equals(&Value::Float(1.0)), Some(true));
        assert_eq!(
            Value::List(vec![Value::Integer(1), Value::Null]).equals(&Value::List(vec![Value::Integer(2), Value::Null])),
            Some(false)
        );
        assert_eq!(Value::Integer(1).compare(&Value::from("a")), None);
        assert_eq!(Value::from("a").compare(&Value::from("b")), Some(Ordering::Less));
    }

    #[test]
    fn test_order_puts_nulls_last() {
        let mut values = vec![Value::Null, Value::Integer(3), Value::from("x"), Value::Float(1.5)];
        values.sort_by(|a, b| a.order_cmp(b));
        assert_eq!(
            values,
            vec![Value::from("x"), Value::Float(1.5), Value::Integer(3), Value::Null]
        );
    }

    #[test]
    fn test_record_projection_and_json() {
        let mut r = Record::new();
        r.bind("b", Value::Integer(2));
        r.bind("a", Value::List(vec![Value::from("x"), Value::Null]));
        assert_eq!(r.columns().collect::<Vec<_>>(), vec!["b", "a"]);
        let p = r.project(&["a".to_string()]);
        assert_eq!(p.len(), 1);
        assert_eq!(r.to_json(), json!({"b": 2, "a": ["x", null]}));
        assert_eq!(
            Value::List(vec![Value::Integer(1)]).to_property(),
            Some(PropertyValue::List(vec![PropertyValue::Integer(1)]))
        );
        assert_eq!(Value::EntityRef(EntityId::new(1)).to_property(), None);
    }

    #[test]
    fn test_non_finite_floats_in_json() {
        assert_eq!(Value::Float(f64::INFINITY).to_json(), json!("Infinity"));
        assert_eq!(Value::Float(f64::NEG_INFINITY).to_json(), json!("-Infinity"));
        assert_eq!(Value::Float(f64::NAN).to_json(), json!("NaN"));
        assert_eq!(Value::Float(0.5).to_json(), json!(0.5));
    }
}
