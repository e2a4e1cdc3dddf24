//! Operator-tree IR produced by the compiler
//!
//! Every read operator takes an `input` and runs once per input row, so a
//! plan is a chain rooted in [`LogicalOp::Argument`]. Nested plans
//! (optional matches, MERGE matchers, FOREACH bodies, subqueries) start from
//! their own `Argument`, which yields the outer row they are applied to.

use super::ast::{Expr, PathPattern, RemoveItem, SetItem, VarLength};
use crate::graph::{Direction, Label, PropertyPath, RelType};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Collect,
    StDev,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "count" => AggregateFunction::Count,
            "sum" => AggregateFunction::Sum,
            "avg" => AggregateFunction::Avg,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            "collect" => AggregateFunction::Collect,
            "stdev" => AggregateFunction::StDev,
            _ => return None,
        };
        Some(f)
    }
}

/// One aggregate to compute per group; `arg: None` is `count(*)`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateCall {
    pub function: AggregateFunction,
    pub distinct: bool,
    pub arg: Option<Expr>,
}

impl fmt::Display for AggregateCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{:?}", self.function).to_lowercase();
        match &self.arg {
            None => write!(f, "{}(*)", name),
            Some(arg) if self.distinct => write!(f, "{}(DISTINCT {})", name, arg),
            Some(arg) => write!(f, "{}({})", name, arg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandSpec {
    pub from: String,
    pub rel_variable: String,
    pub to: String,
    /// `to` was bound before this expand: only rows reaching it are kept
    pub to_bound: bool,
    pub types: Vec<RelType>,
    pub direction: Direction,
    pub to_labels: Vec<Label>,
    pub rel_properties: Vec<(String, Expr)>,
    pub length: Option<VarLength>,
    /// Relationship variables bound earlier in the same MATCH, which this
    /// expand must not reuse
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalOp {
    /// Yields the row the enclosing plan is applied to, or one empty row
    Argument,
    ScanLabel {
        input: Box<LogicalOp>,
        variable: String,
        label: Option<Label>,
    },
    IndexSeek {
        input: Box<LogicalOp>,
        variable: String,
        label: Label,
        property: PropertyPath,
        value: Expr,
    },
    Expand {
        input: Box<LogicalOp>,
        spec: ExpandSpec,
    },
    /// Single-hop expand that binds nulls when nothing matches `filter`
    OptionalExpand {
        input: Box<LogicalOp>,
        spec: ExpandSpec,
        filter: Option<Expr>,
    },
    /// Runs `inner` per input row; binds `variables` to null when it yields nothing
    Optional {
        input: Box<LogicalOp>,
        inner: Box<LogicalOp>,
        variables: Vec<String>,
    },
    Filter {
        input: Box<LogicalOp>,
        predicate: Expr,
    },
    Project {
        input: Box<LogicalOp>,
        items: Vec<(String, Expr)>,
        /// Add the items to the input row instead of replacing it
        keep_existing: bool,
    },
    Distinct {
        input: Box<LogicalOp>,
    },
    Aggregate {
        input: Box<LogicalOp>,
        keys: Vec<(String, Expr)>,
        aggregates: Vec<(String, AggregateCall)>,
    },
    OrderBy {
        input: Box<LogicalOp>,
        keys: Vec<SortKey>,
        /// `(skip, limit)` when only the first `skip + limit` rows are needed
        top: Option<(Option<Expr>, Expr)>,
    },
    Skip {
        input: Box<LogicalOp>,
        count: Expr,
    },
    Limit {
        input: Box<LogicalOp>,
        count: Expr,
    },
    Unwind {
        input: Box<LogicalOp>,
        expr: Expr,
        variable: String,
    },
    Create {
        input: Box<LogicalOp>,
        patterns: Vec<PathPattern>,
    },
    Merge {
        input: Box<LogicalOp>,
        pattern: PathPattern,
        matcher: Box<LogicalOp>,
        on_create: Vec<SetItem>,
        on_match: Vec<SetItem>,
    },
    Delete {
        input: Box<LogicalOp>,
        exprs: Vec<Expr>,
        detach: bool,
    },
    SetProperty {
        input: Box<LogicalOp>,
        items: Vec<SetItem>,
    },
    Remove {
        input: Box<LogicalOp>,
        items: Vec<RemoveItem>,
    },
    Foreach {
        input: Box<LogicalOp>,
        variable: String,
        list: Expr,
        body: Box<LogicalOp>,
    },
    CallSubquery {
        input: Box<LogicalOp>,
        subquery: Box<LogicalOp>,
        /// `(inner column, outer name)`; empty for a subquery without RETURN
        yields: Vec<(String, String)>,
    },
    Union {
        left: Box<LogicalOp>,
        right: Box<LogicalOp>,
        all: bool,
    },
    BindPath {
        input: Box<LogicalOp>,
        variable: String,
        start: String,
        /// `(relationship variable, node variable)` per hop
        steps: Vec<(String, String)>,
    },
}

fn name(v: &str) -> &str {
    v.trim_start()
}

fn join<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

impl LogicalOp {
    pub fn is_write(&self) -> bool {
        match self {
            LogicalOp::Create { .. }
            | LogicalOp::Merge { .. }
            | LogicalOp::Delete { .. }
            | LogicalOp::SetProperty { .. }
            | LogicalOp::Remove { .. }
            | LogicalOp::Foreach { .. } => true,
            _ => self.children().iter().any(|c| c.is_write()),
        }
    }

    /// Input first, then any nested plans
    pub fn children(&self) -> Vec<&LogicalOp> {
        match self {
            LogicalOp::Argument => vec![],
            LogicalOp::Optional { input, inner, .. } => vec![input, inner],
            LogicalOp::Merge { input, matcher, .. } => vec![input, matcher],
            LogicalOp::Foreach { input, body, .. } => vec![input, body],
            LogicalOp::CallSubquery { input, subquery, .. } => vec![input, subquery],
            LogicalOp::Union { left, right, .. } => vec![left, right],
            LogicalOp::ScanLabel { input, .. }
            | LogicalOp::IndexSeek { input, .. }
            | LogicalOp::Expand { input, .. }
            | LogicalOp::OptionalExpand { input, .. }
            | LogicalOp::Filter { input, .. }
            | LogicalOp::Project { input, .. }
            | LogicalOp::Distinct { input }
            | LogicalOp::Aggregate { input, .. }
            | LogicalOp::OrderBy { input, .. }
            | LogicalOp::Skip { input, .. }
            | LogicalOp::Limit { input, .. }
            | LogicalOp::Unwind { input, .. }
            | LogicalOp::Create { input, .. }
            | LogicalOp::Delete { input, .. }
            | LogicalOp::SetProperty { input, .. }
            | LogicalOp::Remove { input, .. }
            | LogicalOp::BindPath { input, .. } => vec![input],
        }
    }

    /// One-line description used by EXPLAIN
    pub fn describe(&self) -> String {
        match self {
            LogicalOp::Argument => "Argument".to_string(),
            LogicalOp::ScanLabel { variable, label, .. } => match label {
                Some(l) => format!("ScanLabel {}:{}", name(variable), l),
                None => format!("ScanAll {}", name(variable)),
            },
            LogicalOp::IndexSeek {
                variable,
                label,
                property,
                value,
                ..
            } => format!("IndexSeek {}:{}({} = {})", name(variable), label, property, value),
            LogicalOp::Expand { spec, .. } => format!("Expand {}", describe_expand(spec)),
            LogicalOp::OptionalExpand { spec, filter, .. } => match filter {
                Some(f) => format!("OptionalExpand {} WHERE {}", describe_expand(spec), f),
                None => format!("OptionalExpand {}", describe_expand(spec)),
            },
            LogicalOp::Optional { variables, .. } => {
                format!(
                    "Optional [{}]",
                    join(variables.iter().filter(|v| !v.starts_with(' ')).map(|v| name(v)))
                )
            }
            LogicalOp::Filter { predicate, .. } => format!("Filter {}", predicate),
            LogicalOp::Project { items, .. } => format!(
                "Project [{}]",
                join(items.iter().map(|(n, e)| format!("{} AS {}", e, name(n))))
            ),
            LogicalOp::Distinct { .. } => "Distinct".to_string(),
            LogicalOp::Aggregate { keys, aggregates, .. } => format!(
                "Aggregate keys=[{}] aggregates=[{}]",
                join(keys.iter().map(|(n, _)| name(n))),
                join(aggregates.iter().map(|(_, a)| a))
            ),
            LogicalOp::OrderBy { keys, top, .. } => {
                let keys = join(
                    keys.iter()
                        .map(|k| format!("{}{}", k.expr, if k.descending { " DESC" } else { "" })),
                );
                match top {
                    Some((_, limit)) => format!("OrderBy [{}] top {}", keys, limit),
                    None => format!("OrderBy [{}]", keys),
                }
            }
            LogicalOp::Skip { count, .. } => format!("Skip {}", count),
            LogicalOp::Limit { count, .. } => format!("Limit {}", count),
            LogicalOp::Unwind { expr, variable, .. } => format!("Unwind {} AS {}", expr, name(variable)),
            LogicalOp::Create { patterns, .. } => format!("Create {} pattern(s)", patterns.len()),
            LogicalOp::Merge { on_create, on_match, .. } => format!(
                "Merge on_create={} on_match={}",
                on_create.len(),
                on_match.len()
            ),
            LogicalOp::Delete { exprs, detach, .. } => format!(
                "{} [{}]",
                if *detach { "DetachDelete" } else { "Delete" },
                join(exprs.iter())
            ),
            LogicalOp::SetProperty { items, .. } => format!("SetProperty {} item(s)", items.len()),
            LogicalOp::Remove { items, .. } => format!("Remove {} item(s)", items.len()),
            LogicalOp::Foreach { variable, list, .. } => format!("Foreach {} IN {}", name(variable), list),
            LogicalOp::CallSubquery { yields, .. } => format!(
                "CallSubquery [{}]",
                join(yields.iter().map(|(from, to)| format!("{} AS {}", from, to)))
            ),
            LogicalOp::Union { all, .. } => {
                if *all {
                    "UnionAll".to_string()
                } else {
                    "Union".to_string()
                }
            }
            LogicalOp::BindPath { variable, .. } => format!("BindPath {}", name(variable)),
        }
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter, depth: usize) -> fmt::Result {
        writeln!(f, "{}{}", "  ".repeat(depth), self.describe())?;
        for child in self.children() {
            child.fmt_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

fn describe_expand(spec: &ExpandSpec) -> String {
    let types = if spec.types.is_empty() {
        String::new()
    } else {
        format!(":{}", join(spec.types.iter()).replace(", ", "|"))
    };
    let length = match spec.length {
        None => String::new(),
        Some(VarLength { min, max: Some(max) }) => format!("*{}..{}", min, max),
        Some(VarLength { min, max: None }) => format!("*{}..", min),
    };
    let rel = format!("[{}{}{}]", name(&spec.rel_variable), types, length);
    let (left, right) = match spec.direction {
        Direction::Outgoing => ("-", "->"),
        Direction::Incoming => ("<-", "-"),
        Direction::Both => ("-", "-"),
    };
    format!("({}){}{}{}({})", name(&spec.from), left, rel, right, name(&spec.to))
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_tree(f, 0)
    }
}

/// A compiled query
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub root: LogicalOp,
    /// Result column names, in order; empty for write queries without RETURN
    pub columns: Vec<String>,
    pub is_write: bool,
}

impl Plan {
    /// EXPLAIN output, one operator per line
    pub fn explain_lines(&self) -> Vec<String> {
        self.root.to_string().lines().map(|l| l.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_display() {
        let plan = LogicalOp::Filter {
            input: Box::new(LogicalOp::ScanLabel {
                input: Box::new(LogicalOp::Argument),
                variable: "p".to_string(),
                label: Some(Label::new("Person")),
            }),
            predicate: Expr::IsNull {
                expr: Box::new(Expr::property(Expr::variable("p"), "age")),
                negated: false,
            },
        };
        assert_eq!(
            plan.to_string(),
            "Filter p.age IS NULL\n  ScanLabel p:Person\n    Argument\n"
        );
        assert!(!plan.is_write());
    }

    #[test]
    fn test_expand_description() {
        let spec = ExpandSpec {
            from: "a".to_string(),
            rel_variable: "  rel1".to_string(),
            to: "b".to_string(),
            to_bound: false,
            types: vec![RelType::new("KNOWS"), RelType::new("LIKES")],
            direction: Direction::Incoming,
            to_labels: vec![],
            rel_properties: vec![],
            length: Some(VarLength { min: 1, max: Some(3) }),
            exclude: vec![],
        };
        assert_eq!(describe_expand(&spec), "(a)<-[rel1:KNOWS|LIKES*1..3]-(b)");
    }
}
