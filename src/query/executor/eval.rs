//! Expression evaluation
//!
//! Null propagates through operators and functions; comparisons are
//! three-valued. Entity and relationship properties are always read through
//! the transaction view so staged writes are visible.

use super::record::{float_text, Record, Value};
use super::{ExecContext, ExecutionError, ExecutionResult};
use crate::graph::{EntityId, GraphView, Path, RelationshipId};
use crate::query::ast::{BinaryOp, Expr, UnaryOp};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Scalar and list functions callable from queries (lower-case names)
const FUNCTIONS: &[&str] = &[
    "id",
    "labels",
    "type",
    "keys",
    "properties",
    "size",
    "length",
    "nodes",
    "relationships",
    "startnode",
    "endnode",
    "coalesce",
    "head",
    "last",
    "tail",
    "range",
    "reverse",
    "toupper",
    "tolower",
    "trim",
    "ltrim",
    "rtrim",
    "substring",
    "replace",
    "split",
    "tostring",
    "tointeger",
    "tofloat",
    "toboolean",
    "abs",
    "ceil",
    "floor",
    "round",
    "sqrt",
    "sign",
    "exists",
    "timestamp",
];

pub fn is_known_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

fn type_error(message: impl Into<String>) -> ExecutionError {
    ExecutionError::TypeError(message.into())
}

/// `true` only for boolean true; null counts as false
pub fn is_true(value: &Value) -> ExecutionResult<bool> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(type_error(format!("Expected a boolean predicate, got {}", other.type_name()))),
    }
}

pub fn evaluate(expr: &Expr, record: &Record, ctx: &mut ExecContext) -> ExecutionResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(Value::from(value.clone())),
        Expr::Parameter(name) => ctx
            .params
            .get(name)
            .map(|v| Value::from(v.clone()))
            .ok_or_else(|| ExecutionError::MissingParameter(name.clone())),
        Expr::Variable(name) => record
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::VariableNotFound(name.trim_start().to_string())),
        Expr::Property(base, key) => {
            let base = evaluate(base, record, ctx)?;
            property(&base, key, ctx)
        }
        Expr::Index(base, index) => {
            let base = evaluate(base, record, ctx)?;
            let index = evaluate(index, record, ctx)?;
            index_into(base, index, ctx)
        }
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|e| evaluate(e, record, ctx))
                .collect::<ExecutionResult<_>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, e) in entries {
                map.insert(key.clone(), evaluate(e, record, ctx)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Unary(op, operand) => {
            let value = evaluate(operand, record, ctx)?;
            unary(*op, value)
        }
        Expr::Binary(op, lhs, rhs) => binary(*op, lhs, rhs, record, ctx),
        Expr::IsNull { expr, negated } => {
            let null = evaluate(expr, record, ctx)?.is_null();
            Ok(Value::Boolean(null != *negated))
        }
        Expr::HasLabels { expr, labels } => match evaluate(expr, record, ctx)? {
            Value::Null => Ok(Value::Null),
            value => match value.entity_id() {
                Some(id) => Ok(Value::Boolean(
                    ctx.view().entity(id).map(|e| e.has_labels(labels)).unwrap_or(false),
                )),
                None => Err(type_error(format!("Expected a node, got {}", value.type_name()))),
            },
        },
        Expr::Function { name, args, .. } => {
            if expr.is_aggregate() {
                return Err(type_error(format!("Aggregate {}() used outside WITH or RETURN", name)));
            }
            let args = args
                .iter()
                .map(|a| evaluate(a, record, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?;
            call(name, args, ctx)
        }
        Expr::CountStar => Err(type_error("count(*) used outside WITH or RETURN")),
        Expr::Case {
            operand,
            branches,
            default,
        } => {
            let subject = match operand {
                Some(e) => Some(evaluate(e, record, ctx)?),
                None => None,
            };
            for (when, then) in branches {
                let hit = match &subject {
                    Some(subject) => subject.equals(&evaluate(when, record, ctx)?) == Some(true),
                    None => is_true(&evaluate(when, record, ctx)?)?,
                };
                if hit {
                    return evaluate(then, record, ctx);
                }
            }
            match default {
                Some(e) => evaluate(e, record, ctx),
                None => Ok(Value::Null),
            }
        }
    }
}

fn property(base: &Value, key: &str, ctx: &ExecContext) -> ExecutionResult<Value> {
    let view = ctx.view();
    let found = match base {
        Value::Null => return Ok(Value::Null),
        Value::Map(map) => return Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        Value::EntityRef(id) => view.entity(*id).and_then(|e| e.get_property(key)).cloned(),
        Value::Entity(e) => match view.entity(e.id) {
            Some(current) => current.get_property(key).cloned(),
            None => e.get_property(key).cloned(),
        },
        Value::RelationshipRef(id) => view.relationship(*id).and_then(|r| r.get_property(key)).cloned(),
        Value::Relationship(r) => match view.relationship(r.id) {
            Some(current) => current.get_property(key).cloned(),
            None => r.get_property(key).cloned(),
        },
        other => {
            return Err(type_error(format!(
                "Cannot read property `{}` of {}",
                key,
                other.type_name()
            )))
        }
    };
    Ok(found.map(Value::from).unwrap_or(Value::Null))
}

fn index_into(base: Value, index: Value, ctx: &ExecContext) -> ExecutionResult<Value> {
    match (base, index) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::List(items), Value::Integer(i)) => {
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            if i < 0 || i >= len {
                return Ok(Value::Null);
            }
            Ok(items.into_iter().nth(i as usize).unwrap_or(Value::Null))
        }
        (base @ (Value::Map(_) | Value::EntityRef(_) | Value::Entity(_) | Value::RelationshipRef(_) | Value::Relationship(_)), Value::String(key)) => {
            property(&base, &key, ctx)
        }
        (base, index) => Err(type_error(format!(
            "Cannot index {} with {}",
            base.type_name(),
            index.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> ExecutionResult<Value> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, Value::Boolean(b)) => Ok(Value::Boolean(!b)),
        (UnaryOp::Neg, Value::Integer(i)) => i
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| ExecutionError::Arithmetic("integer overflow".to_string())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, other) => Err(type_error(format!("NOT expects a boolean, got {}", other.type_name()))),
        (UnaryOp::Neg, other) => Err(type_error(format!("Cannot negate {}", other.type_name()))),
    }
}

fn logical(value: &Value, op: BinaryOp) -> ExecutionResult<Option<bool>> {
    match value {
        Value::Boolean(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(type_error(format!("{} expects booleans, got {}", op, other.type_name()))),
    }
}

fn binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, record: &Record, ctx: &mut ExecContext) -> ExecutionResult<Value> {
    // AND / OR short-circuit on a decided left side
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let left = logical(&evaluate(lhs, record, ctx)?, op)?;
        match (op, left) {
            (BinaryOp::And, Some(false)) => return Ok(Value::Boolean(false)),
            (BinaryOp::Or, Some(true)) => return Ok(Value::Boolean(true)),
            _ => {}
        }
        let right = logical(&evaluate(rhs, record, ctx)?, op)?;
        return Ok(match (op, left, right) {
            (BinaryOp::And, _, Some(false)) => Value::Boolean(false),
            (BinaryOp::And, Some(true), Some(true)) => Value::Boolean(true),
            (BinaryOp::Or, _, Some(true)) => Value::Boolean(true),
            (BinaryOp::Or, Some(false), Some(false)) => Value::Boolean(false),
            _ => Value::Null,
        });
    }

    let left = evaluate(lhs, record, ctx)?;
    let right = evaluate(rhs, record, ctx)?;
    match op {
        BinaryOp::Xor => Ok(match (logical(&left, op)?, logical(&right, op)?) {
            (Some(a), Some(b)) => Value::Boolean(a != b),
            _ => Value::Null,
        }),
        BinaryOp::Eq => Ok(left.equals(&right).map(Value::Boolean).unwrap_or(Value::Null)),
        BinaryOp::Neq => Ok(left.equals(&right).map(|b| Value::Boolean(!b)).unwrap_or(Value::Null)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => Ok(match left.compare(&right) {
            None => Value::Null,
            Some(ord) => Value::Boolean(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
        }),
        BinaryOp::In => membership(&left, &right),
        BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Contains => match (&left, &right) {
            (Value::String(a), Value::String(b)) => Ok(Value::Boolean(match op {
                BinaryOp::StartsWith => a.starts_with(b.as_str()),
                BinaryOp::EndsWith => a.ends_with(b.as_str()),
                _ => a.contains(b.as_str()),
            })),
            _ => Ok(Value::Null),
        },
        BinaryOp::Regex => match (&left, &right) {
            (Value::String(text), Value::String(pattern)) => {
                let re = compiled_regex(pattern, ctx)?;
                Ok(Value::Boolean(re.is_match(text)))
            }
            _ => Ok(Value::Null),
        },
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => arithmetic(op, left, right),
        BinaryOp::And | BinaryOp::Or => Ok(Value::Null),
    }
}

fn membership(needle: &Value, haystack: &Value) -> ExecutionResult<Value> {
    let items = match haystack {
        Value::Null => return Ok(Value::Null),
        Value::List(items) => items,
        other => return Err(type_error(format!("IN expects a list, got {}", other.type_name()))),
    };
    let mut unknown = false;
    for item in items {
        match needle.equals(item) {
            Some(true) => return Ok(Value::Boolean(true)),
            None => unknown = true,
            Some(false) => {}
        }
    }
    Ok(if unknown { Value::Null } else { Value::Boolean(false) })
}

fn compiled_regex<'c>(pattern: &str, ctx: &'c mut ExecContext) -> ExecutionResult<&'c Regex> {
    if !ctx.regexes.contains_key(pattern) {
        let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| ExecutionError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        ctx.regexes.insert(pattern.to_string(), re);
    }
    ctx.regexes
        .get(pattern)
        .ok_or_else(|| ExecutionError::InvalidArgument(pattern.to_string()))
}

fn overflow() -> ExecutionError {
    ExecutionError::Arithmetic("integer overflow".to_string())
}

fn add(left: Value, right: Value) -> ExecutionResult<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Integer(a), Value::Integer(b)) => a.checked_add(b).map(Value::Integer).ok_or_else(overflow),
        (a @ (Value::Integer(_) | Value::Float(_)), b @ (Value::Integer(_) | Value::Float(_))) => {
            Ok(Value::Float(a.as_float().unwrap_or_default() + b.as_float().unwrap_or_default()))
        }
        (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (Value::String(a), b @ (Value::Integer(_) | Value::Float(_) | Value::Boolean(_))) => {
            Ok(Value::String(a + &display(&b)))
        }
        (a @ (Value::Integer(_) | Value::Float(_) | Value::Boolean(_)), Value::String(b)) => {
            Ok(Value::String(display(&a) + &b))
        }
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::List(mut a), b) => {
            a.push(b);
            Ok(Value::List(a))
        }
        (a, Value::List(b)) => {
            let mut out = Vec::with_capacity(b.len() + 1);
            out.push(a);
            out.extend(b);
            Ok(Value::List(out))
        }
        (a, b) => Err(type_error(format!("Cannot add {} and {}", a.type_name(), b.type_name()))),
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> ExecutionResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if !left.is_number() || !right.is_number() {
        return Err(type_error(format!(
            "{} expects numbers, got {} and {}",
            op,
            left.type_name(),
            right.type_name()
        )));
    }
    if let (Value::Integer(a), Value::Integer(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        return match op {
            BinaryOp::Sub => a.checked_sub(b).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(b).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Div if b == 0 => Err(ExecutionError::Arithmetic("division by zero".to_string())),
            BinaryOp::Div => a.checked_div(b).map(Value::Integer).ok_or_else(overflow),
            BinaryOp::Mod if b == 0 => Err(ExecutionError::Arithmetic("modulo by zero".to_string())),
            BinaryOp::Mod => a.checked_rem(b).map(Value::Integer).ok_or_else(overflow),
            _ => Ok(Value::Float((a as f64).powf(b as f64))),
        };
    }
    let (a, b) = (left.as_float().unwrap_or_default(), right.as_float().unwrap_or_default());
    Ok(Value::Float(match op {
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        _ => a.powf(b),
    }))
}

/// String form used by `toString` and string concatenation
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                float_text(*f)
            }
        }
        Value::Boolean(b) => b.to_string(),
        other => other.to_json().to_string(),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ExecutionResult<()> {
    if args.len() < min || args.len() > max {
        return Err(ExecutionError::InvalidArgument(format!(
            "{}() takes {} argument(s), got {}",
            name,
            if min == max { min.to_string() } else { format!("{} to {}", min, max) },
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, value: &Value) -> ExecutionResult<i64> {
    value
        .as_integer()
        .ok_or_else(|| ExecutionError::InvalidArgument(format!("{}() expects an integer, got {}", name, value.type_name())))
}

fn as_path(name: &str, value: &Value) -> ExecutionResult<Path> {
    match value {
        Value::Path(p) => Ok(p.clone()),
        other => Err(ExecutionError::InvalidArgument(format!(
            "{}() expects a path, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn call(name: &str, args: Vec<Value>, ctx: &ExecContext) -> ExecutionResult<Value> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    match name {
        "coalesce" => return Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "timestamp" => {
            arity(name, &args, 0, 0)?;
            return Ok(Value::Integer(chrono::Utc::now().timestamp_millis()));
        }
        "range" => {
            arity(name, &args, 2, 3)?;
            let start = int_arg(name, &args[0])?;
            let end = int_arg(name, &args[1])?;
            let step = match args.get(2) {
                Some(v) => int_arg(name, v)?,
                None => 1,
            };
            if step == 0 {
                return Err(ExecutionError::InvalidArgument("range() step cannot be 0".to_string()));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i <= end) || (step < 0 && i >= end) {
                out.push(Value::Integer(i));
                i = match i.checked_add(step) {
                    Some(next) => next,
                    None => break,
                };
            }
            return Ok(Value::List(out));
        }
        "exists" => {
            arity(name, &args, 1, 1)?;
            return Ok(Value::Boolean(!first.is_null()));
        }
        "substring" => {
            arity(name, &args, 2, 3)?;
        }
        "replace" => arity(name, &args, 3, 3)?,
        "split" => arity(name, &args, 2, 2)?,
        "round" => arity(name, &args, 1, 2)?,
        _ => arity(name, &args, 1, 1)?,
    }
    if first.is_null() {
        return Ok(Value::Null);
    }

    let view = ctx.view();
    let got = first.type_name();
    let invalid = |what: &str| ExecutionError::InvalidArgument(format!("{}() expects {}, got {}", name, what, got));
    let value = match name {
        "id" => match (first.entity_id(), first.relationship_id()) {
            (Some(id), _) => Value::Integer(id.as_u64() as i64),
            (_, Some(id)) => Value::Integer(id.as_u64() as i64),
            _ => return Err(invalid("a node or relationship")),
        },
        "labels" => {
            let id = first.entity_id().ok_or_else(|| invalid("a node"))?;
            match view.entity(id) {
                Some(e) => Value::List(e.labels.iter().map(|l| Value::from(l.as_str())).collect()),
                None => Value::Null,
            }
        }
        "type" => {
            let id = first.relationship_id().ok_or_else(|| invalid("a relationship"))?;
            match view.relationship(id) {
                Some(r) => Value::from(r.rel_type.as_str()),
                None => Value::Null,
            }
        }
        "keys" | "properties" => {
            let props = match (&first, first.entity_id(), first.relationship_id()) {
                (Value::Map(map), _, _) => map.clone(),
                (_, Some(id), _) => property_values(view.entity(id).map(|e| &e.properties)),
                (_, _, Some(id)) => property_values(view.relationship(id).map(|r| &r.properties)),
                _ => return Err(invalid("a node, relationship or map")),
            };
            if name == "keys" {
                Value::List(props.into_keys().map(Value::String).collect())
            } else {
                Value::Map(props)
            }
        }
        "size" => match &first {
            Value::List(items) => Value::Integer(items.len() as i64),
            Value::String(s) => Value::Integer(s.chars().count() as i64),
            Value::Map(map) => Value::Integer(map.len() as i64),
            _ => return Err(invalid("a list or string")),
        },
        "length" => match &first {
            Value::Path(p) => Value::Integer(p.len() as i64),
            Value::List(items) => Value::Integer(items.len() as i64),
            Value::String(s) => Value::Integer(s.chars().count() as i64),
            _ => return Err(invalid("a path")),
        },
        "nodes" => Value::List(
            as_path(name, &first)?
                .entities
                .into_iter()
                .map(Value::EntityRef)
                .collect(),
        ),
        "relationships" => Value::List(
            as_path(name, &first)?
                .relationships
                .into_iter()
                .map(Value::RelationshipRef)
                .collect(),
        ),
        "startnode" | "endnode" => {
            let id = first.relationship_id().ok_or_else(|| invalid("a relationship"))?;
            match view.relationship(id) {
                Some(r) => Value::EntityRef(if name == "startnode" { r.source } else { r.target }),
                None => Value::Null,
            }
        }
        "head" => match first {
            Value::List(items) => items.into_iter().next().unwrap_or(Value::Null),
            _ => return Err(invalid("a list")),
        },
        "last" => match first {
            Value::List(items) => items.into_iter().last().unwrap_or(Value::Null),
            _ => return Err(invalid("a list")),
        },
        "tail" => match first {
            Value::List(items) => Value::List(items.into_iter().skip(1).collect()),
            _ => return Err(invalid("a list")),
        },
        "reverse" => match first {
            Value::List(mut items) => {
                items.reverse();
                Value::List(items)
            }
            Value::String(s) => Value::String(s.chars().rev().collect()),
            _ => return Err(invalid("a list or string")),
        },
        "toupper" => Value::String(first.as_str().ok_or_else(|| invalid("a string"))?.to_uppercase()),
        "tolower" => Value::String(first.as_str().ok_or_else(|| invalid("a string"))?.to_lowercase()),
        "trim" => Value::from(first.as_str().ok_or_else(|| invalid("a string"))?.trim()),
        "ltrim" => Value::from(first.as_str().ok_or_else(|| invalid("a string"))?.trim_start()),
        "rtrim" => Value::from(first.as_str().ok_or_else(|| invalid("a string"))?.trim_end()),
        "substring" => {
            let s = first.as_str().ok_or_else(|| invalid("a string"))?;
            let start = int_arg(name, &args[1])?;
            if start < 0 {
                return Err(ExecutionError::InvalidArgument("substring() start must not be negative".to_string()));
            }
            let chars = s.chars().skip(start as usize);
            match args.get(2) {
                Some(len) => {
                    let len = int_arg(name, len)?;
                    if len < 0 {
                        return Err(ExecutionError::InvalidArgument(
                            "substring() length must not be negative".to_string(),
                        ));
                    }
                    Value::String(chars.take(len as usize).collect())
                }
                None => Value::String(chars.collect()),
            }
        }
        "replace" => match (&args[1], &args[2]) {
            (Value::String(from), Value::String(to)) => {
                Value::String(first.as_str().ok_or_else(|| invalid("a string"))?.replace(from.as_str(), to))
            }
            _ => Value::Null,
        },
        "split" => match &args[1] {
            Value::String(sep) => Value::List(
                first
                    .as_str()
                    .ok_or_else(|| invalid("a string"))?
                    .split(sep.as_str())
                    .map(Value::from)
                    .collect(),
            ),
            _ => Value::Null,
        },
        "tostring" => match &first {
            Value::String(_) | Value::Integer(_) | Value::Float(_) | Value::Boolean(_) => Value::String(display(&first)),
            _ => return Err(invalid("a scalar")),
        },
        "tointeger" => match &first {
            Value::Integer(i) => Value::Integer(*i),
            Value::Float(f) if f.is_finite() => Value::Integer(f.trunc() as i64),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .or_else(|_| s.trim().parse::<f64>().map(|f| Value::Integer(f.trunc() as i64)))
                .unwrap_or(Value::Null),
            Value::Boolean(b) => Value::Integer(*b as i64),
            _ => Value::Null,
        },
        "tofloat" => match &first {
            Value::Integer(i) => Value::Float(*i as f64),
            Value::Float(f) => Value::Float(*f),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "toboolean" => match &first {
            Value::Boolean(b) => Value::Boolean(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        "abs" => match first {
            Value::Integer(i) => Value::Integer(i.checked_abs().ok_or_else(overflow)?),
            Value::Float(f) => Value::Float(f.abs()),
            _ => return Err(invalid("a number")),
        },
        "sign" => match first {
            Value::Integer(i) => Value::Integer(i.signum()),
            Value::Float(f) if f == 0.0 => Value::Integer(0),
            Value::Float(f) => Value::Integer(f.signum() as i64),
            _ => return Err(invalid("a number")),
        },
        "ceil" | "floor" | "sqrt" => {
            let f = first.as_float().ok_or_else(|| invalid("a number"))?;
            Value::Float(match name {
                "ceil" => f.ceil(),
                "floor" => f.floor(),
                _ => f.sqrt(),
            })
        }
        "round" => {
            let f = first.as_float().ok_or_else(|| invalid("a number"))?;
            match args.get(1) {
                Some(p) => {
                    let factor = 10f64.powi(int_arg(name, p)? as i32);
                    Value::Float((f * factor).round() / factor)
                }
                None => Value::Float(f.round()),
            }
        }
        other => return Err(ExecutionError::UnknownFunction(other.to_string())),
    };
    Ok(value)
}

fn property_values(props: Option<&crate::graph::PropertyMap>) -> BTreeMap<String, Value> {
    props
        .map(|p| p.iter().map(|(k, v)| (k.clone(), Value::from(v.clone()))).collect())
        .unwrap_or_default()
}

/// Entity id bound to an expression result, null passing through
pub(crate) fn entity_or_null(value: &Value) -> ExecutionResult<Option<EntityId>> {
    match value {
        Value::Null => Ok(None),
        other => other
            .entity_id()
            .map(Some)
            .ok_or_else(|| type_error(format!("Expected a node, got {}", other.type_name()))),
    }
}

pub(crate) fn relationship_or_null(value: &Value) -> ExecutionResult<Option<RelationshipId>> {
    match value {
        Value::Null => Ok(None),
        other => other
            .relationship_id()
            .map(Some)
            .ok_or_else(|| type_error(format!("Expected a relationship, got {}", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStore, PropertyMap};
    use crate::query::parser::parse_expression;
    use crate::transaction::{IsolationLevel, Transaction, TxId};
    use rustc_hash::FxHashMap;

    fn eval_with(src: &str, record: &Record, params: &PropertyMap) -> ExecutionResult<Value> {
        let graph = GraphStore::new();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        let ids = crate::transaction::IdAllocator::new(1, 1);
        let mut regexes = FxHashMap::default();
        let mut ctx = ExecContext::new(&graph, &mut tx, &ids, params, &mut regexes);
        let expr = parse_expression(src).unwrap();
        evaluate(&expr, record, &mut ctx)
    }

    fn eval(src: &str) -> ExecutionResult<Value> {
        eval_with(src, &Record::new(), &PropertyMap::new())
    }

    #[test]
    fn test_null_semantics() {
        assert_eq!(eval("null = null").unwrap(), Value::Null);
        assert_eq!(eval("null OR true").unwrap(), Value::Boolean(true));
        assert_eq!(eval("null AND true").unwrap(), Value::Null);
        assert_eq!(eval("false AND null").unwrap(), Value::Boolean(false));
        assert_eq!(eval("NOT null").unwrap(), Value::Null);
        assert_eq!(eval("2 IN [1, null]").unwrap(), Value::Null);
        assert_eq!(eval("1 IN [1, null]").unwrap(), Value::Boolean(true));
        assert_eq!(eval("null IS NULL").unwrap(), Value::Boolean(true));
        assert_eq!(eval("1 + null").unwrap(), Value::Null);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Integer(7));
        assert_eq!(eval("7 / 2").unwrap(), Value::Integer(3));
        assert_eq!(eval("7 % 3").unwrap(), Value::Integer(1));
        assert_eq!(eval("2 ^ 3").unwrap(), Value::Float(8.0));
        assert_eq!(eval("1.5 + 1").unwrap(), Value::Float(2.5));
        assert_eq!(eval("'a' + 1").unwrap(), Value::from("a1"));
        assert!(matches!(eval("1 / 0"), Err(ExecutionError::Arithmetic(_))));
        assert_eq!(eval("1.0 / 0").unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(eval("-1 / 0.0").unwrap(), Value::Float(f64::NEG_INFINITY));
        assert_eq!(eval("toString(1.0 / 0)").unwrap(), Value::from("Infinity"));
        assert_eq!(eval("toString(-1.0 / 0)").unwrap(), Value::from("-Infinity"));
        assert_eq!(eval("toString(0.0 / 0)").unwrap(), Value::from("NaN"));
        assert_eq!(eval("-9223372036854775808").unwrap(), Value::Integer(i64::MIN));
        assert!(matches!(eval("-9223372036854775808 - 1"), Err(ExecutionError::Arithmetic(_))));
        assert!(matches!(eval("1 - 'a'"), Err(ExecutionError::TypeError(_))));
    }

    #[test]
    fn test_string_predicates_and_regex() {
        assert_eq!(eval("'Alice' STARTS WITH 'Al'").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'Alice' ENDS WITH 'ce'").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'Alice' CONTAINS 'lic'").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'Alice' =~ 'A.*'").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'Alice' =~ 'li'").unwrap(), Value::Boolean(false));
        assert!(matches!(eval("'a' =~ '('"), Err(ExecutionError::InvalidRegex { .. })));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("toUpper('abc')").unwrap(), Value::from("ABC"));
        assert_eq!(eval("size([1, 2, 3])").unwrap(), Value::Integer(3));
        assert_eq!(eval("substring('hello', 1, 3)").unwrap(), Value::from("ell"));
        assert_eq!(
            eval("split('a,b', ',')").unwrap(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
        assert_eq!(
            eval("range(1, 5, 2)").unwrap(),
            Value::List(vec![Value::Integer(1), Value::Integer(3), Value::Integer(5)])
        );
        assert_eq!(eval("coalesce(null, 2)").unwrap(), Value::Integer(2));
        assert_eq!(eval("toInteger('42')").unwrap(), Value::Integer(42));
        assert_eq!(eval("toString(2.0)").unwrap(), Value::from("2.0"));
        assert_eq!(eval("head([])").unwrap(), Value::Null);
        assert_eq!(eval("[1, 2, 3][-1]").unwrap(), Value::Integer(3));
        assert_eq!(eval("round(2.567, 2)").unwrap(), Value::Float(2.57));
        assert_eq!(eval("toLower(null)").unwrap(), Value::Null);
    }

    #[test]
    fn test_case_and_parameters() {
        let mut params = PropertyMap::new();
        params.insert("x".to_string(), 2i64.into());
        let record = Record::new();
        assert_eq!(
            eval_with("CASE $x WHEN 1 THEN 'one' WHEN 2 THEN 'two' END", &record, &params).unwrap(),
            Value::from("two")
        );
        assert_eq!(
            eval_with("CASE WHEN $x > 5 THEN 'big' ELSE 'small' END", &record, &params).unwrap(),
            Value::from("small")
        );
        assert!(matches!(eval("$missing"), Err(ExecutionError::MissingParameter(_))));
    }
}
