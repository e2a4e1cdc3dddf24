//! Property values for entities and relationships
//!
//! Values are totally ordered and hashable so they can key B+-tree indexes and
//! uniqueness checks. Integers and floats compare numerically (`1 = 1.0`) and
//! hash consistently with that equality.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Property value
///
/// Lists and maps may only hold scalars (see [`PropertyValue::validate`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

/// Property map; ordered so that encoded blocks hash deterministically
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Declared type for type constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
    /// Integer or float
    Number,
    String,
    List,
    Map,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Boolean => "Boolean",
            ValueType::Integer => "Integer",
            ValueType::Float => "Float",
            ValueType::Number => "Number",
            ValueType::String => "String",
            ValueType::List => "List",
            ValueType::Map => "Map",
        };
        write!(f, "{}", name)
    }
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, PropertyValue::List(_) | PropertyValue::Map(_))
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as f64 (integers are widened)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<PropertyValue>> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            PropertyValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "Null",
            PropertyValue::Boolean(_) => "Boolean",
            PropertyValue::Integer(_) => "Integer",
            PropertyValue::Float(_) => "Float",
            PropertyValue::String(_) => "String",
            PropertyValue::List(_) => "List",
            PropertyValue::Map(_) => "Map",
        }
    }

    pub fn has_type(&self, ty: ValueType) -> bool {
        matches!(
            (self, ty),
            (PropertyValue::Boolean(_), ValueType::Boolean)
                | (PropertyValue::Integer(_), ValueType::Integer)
                | (PropertyValue::Float(_), ValueType::Float)
                | (PropertyValue::Integer(_), ValueType::Number)
                | (PropertyValue::Float(_), ValueType::Number)
                | (PropertyValue::String(_), ValueType::String)
                | (PropertyValue::List(_), ValueType::List)
                | (PropertyValue::Map(_), ValueType::Map)
        )
    }

    /// Check the storable shape: lists and maps hold scalars only
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PropertyValue::List(items) => {
                if let Some(bad) = items.iter().find(|v| !v.is_scalar()) {
                    return Err(format!("list elements must be scalars, found {}", bad.type_name()));
                }
                Ok(())
            }
            PropertyValue::Map(map) => {
                if let Some((key, bad)) = map.iter().find(|(_, v)| !v.is_scalar()) {
                    return Err(format!(
                        "map values must be scalars, found {} at key '{}'",
                        bad.type_name(),
                        key
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rank used to order values of different kinds; nulls sort last
    fn kind_rank(&self) -> u8 {
        match self {
            PropertyValue::Map(_) => 0,
            PropertyValue::List(_) => 1,
            PropertyValue::String(_) => 2,
            PropertyValue::Boolean(_) => 3,
            PropertyValue::Integer(_) | PropertyValue::Float(_) => 4,
            PropertyValue::Null => 5,
        }
    }
}

/// Float that holds an exact i64 value
fn integral(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts above every number and equals itself
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Total numeric comparison across integers and floats
pub(crate) fn cmp_numbers(a: &PropertyValue, b: &PropertyValue) -> Option<Ordering> {
    match (a, b) {
        (PropertyValue::Integer(x), PropertyValue::Integer(y)) => Some(x.cmp(y)),
        (PropertyValue::Float(x), PropertyValue::Float(y)) => Some(cmp_f64(*x, *y)),
        (PropertyValue::Integer(x), PropertyValue::Float(y)) => Some(match integral(*y) {
            Some(y) => x.cmp(&y),
            None => cmp_f64(*x as f64, *y),
        }),
        (PropertyValue::Float(x), PropertyValue::Integer(y)) => Some(match integral(*x) {
            Some(x) => x.cmp(y),
            None => cmp_f64(*x, *y as f64),
        }),
        _ => None,
    }
}

/// Hash a number so that equal integers and floats collide
pub(crate) fn hash_number<H: Hasher>(value: &PropertyValue, state: &mut H) {
    match value {
        PropertyValue::Integer(i) => i.hash(state),
        PropertyValue::Float(f) => match integral(*f) {
            Some(i) => i.hash(state),
            None if f.is_nan() => u64::MAX.hash(state),
            None => f.to_bits().hash(state),
        },
        _ => {}
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        if let Some(ord) = cmp_numbers(self, other) {
            return ord;
        }
        match (self, other) {
            (PropertyValue::Null, PropertyValue::Null) => Ordering::Equal,
            (PropertyValue::Boolean(a), PropertyValue::Boolean(b)) => a.cmp(b),
            (PropertyValue::String(a), PropertyValue::String(b)) => a.cmp(b),
            (PropertyValue::List(a), PropertyValue::List(b)) => a.cmp(b),
            (PropertyValue::Map(a), PropertyValue::Map(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl Hash for PropertyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match self {
            PropertyValue::Null => {}
            PropertyValue::Boolean(b) => b.hash(state),
            PropertyValue::Integer(_) | PropertyValue::Float(_) => hash_number(self, state),
            PropertyValue::String(s) => s.hash(state),
            PropertyValue::List(items) => items.hash(state),
            PropertyValue::Map(map) => map.hash(state),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(fl) => write!(f, "{}", fl),
            PropertyValue::String(s) => write!(f, "\"{}\"", s),
            PropertyValue::List(items) => {
                write!(f, "[")?;
                for (i, val) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val)?;
                }
                write!(f, "]")
            }
            PropertyValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, val)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, val)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Integer(i)
    }
}

impl From<i32> for PropertyValue {
    fn from(i: i32) -> Self {
        PropertyValue::Integer(i as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(items: Vec<PropertyValue>) -> Self {
        PropertyValue::List(items)
    }
}

impl From<BTreeMap<String, PropertyValue>> for PropertyValue {
    fn from(map: BTreeMap<String, PropertyValue>) -> Self {
        PropertyValue::Map(map)
    }
}

/// Dotted property path such as `address.city`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    pub fn parse(path: &str) -> Self {
        PropertyPath(path.split('.').map(|s| s.to_string()).collect())
    }

    pub fn single(key: impl Into<String>) -> Self {
        PropertyPath(vec![key.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_simple(&self) -> bool {
        self.0.len() == 1
    }

    /// First segment, the top-level property key
    pub fn root(&self) -> &str {
        self.0.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Resolve the path through nested maps
    pub fn resolve<'a>(&self, props: &'a PropertyMap) -> Option<&'a PropertyValue> {
        let mut segments = self.0.iter();
        let mut current = props.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for PropertyPath {
    fn from(s: &str) -> Self {
        PropertyPath::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &PropertyValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_property_value_types() {
        assert_eq!(PropertyValue::String("test".to_string()).type_name(), "String");
        assert_eq!(PropertyValue::Integer(42).type_name(), "Integer");
        assert_eq!(PropertyValue::Float(3.14).type_name(), "Float");
        assert_eq!(PropertyValue::Boolean(true).type_name(), "Boolean");
        assert_eq!(PropertyValue::List(vec![]).type_name(), "List");
        assert_eq!(PropertyValue::Map(BTreeMap::new()).type_name(), "Map");
        assert_eq!(PropertyValue::Null.type_name(), "Null");
    }

    #[test]
    fn test_numeric_equality_and_hash() {
        let i = PropertyValue::Integer(3);
        let f = PropertyValue::Float(3.0);
        assert_eq!(i, f);
        assert_eq!(hash_of(&i), hash_of(&f));
        assert!(PropertyValue::Integer(2) < PropertyValue::Float(2.5));
        assert_ne!(PropertyValue::Integer((1 << 53) + 1), PropertyValue::Float((1u64 << 53) as f64));
        assert_eq!(PropertyValue::Float(-0.0), PropertyValue::Float(0.0));
    }

    #[test]
    fn test_cross_type_order() {
        let mut values = vec![
            PropertyValue::Null,
            PropertyValue::Integer(1),
            PropertyValue::String("a".into()),
            PropertyValue::Boolean(false),
        ];
        values.sort();
        assert_eq!(values[0], PropertyValue::String("a".into()));
        assert_eq!(values[3], PropertyValue::Null);
    }

    #[test]
    fn test_validate_nesting() {
        let ok = PropertyValue::List(vec![1i64.into(), "x".into()]);
        assert!(ok.validate().is_ok());
        let nested = PropertyValue::List(vec![PropertyValue::List(vec![])]);
        assert!(nested.validate().is_err());
        let mut map = BTreeMap::new();
        map.insert("inner".to_string(), PropertyValue::Map(BTreeMap::new()));
        assert!(PropertyValue::Map(map).validate().is_err());
    }

    #[test]
    fn test_type_checks() {
        assert!(PropertyValue::Integer(1).has_type(ValueType::Number));
        assert!(PropertyValue::Float(1.5).has_type(ValueType::Number));
        assert!(!PropertyValue::String("1".into()).has_type(ValueType::Integer));
    }

    #[test]
    fn test_property_path_resolve() {
        let mut address = BTreeMap::new();
        address.insert("city".to_string(), PropertyValue::from("Berlin"));
        let mut props = PropertyMap::new();
        props.insert("address".to_string(), PropertyValue::Map(address));
        props.insert("name".to_string(), "Ada".into());

        let path = PropertyPath::parse("address.city");
        assert_eq!(path.resolve(&props), Some(&PropertyValue::from("Berlin")));
        assert_eq!(PropertyPath::single("name").resolve(&props), Some(&"Ada".into()));
        assert_eq!(PropertyPath::parse("address.zip").resolve(&props), None);
        assert_eq!(path.to_string(), "address.city");
    }
}
