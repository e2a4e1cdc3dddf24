//! Abstract syntax tree

use crate::graph::{Direction, Label, PropertyPath, PropertyValue, RelType};
use std::collections::BTreeSet;
use std::fmt;

/// A parsed statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub explain: bool,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Query(Query),
    /// `CREATE INDEX ON :Label(p1, p2, ...)`
    CreateIndex { label: Label, properties: Vec<PropertyPath> },
    /// `DROP INDEX ON :Label(p1, ...)`
    DropIndex { label: Label, properties: Vec<PropertyPath> },
}

/// One or more single queries joined by `UNION [ALL]`
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub first: SingleQuery,
    /// `(all, query)` for every UNION branch after the first
    pub unions: Vec<(bool, SingleQuery)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleQuery {
    pub clauses: Vec<Clause>,
}

impl Query {
    pub fn is_write(&self) -> bool {
        std::iter::once(&self.first)
            .chain(self.unions.iter().map(|(_, q)| q))
            .any(|q| q.clauses.iter().any(Clause::is_write))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Match {
        optional: bool,
        patterns: Vec<PathPattern>,
        predicate: Option<Expr>,
    },
    Unwind {
        expr: Expr,
        variable: String,
    },
    With(Projection),
    Return(Projection),
    Create {
        patterns: Vec<PathPattern>,
    },
    Merge {
        pattern: PathPattern,
        on_create: Vec<SetItem>,
        on_match: Vec<SetItem>,
    },
    Set(Vec<SetItem>),
    Remove(Vec<RemoveItem>),
    Delete {
        detach: bool,
        exprs: Vec<Expr>,
    },
    Foreach {
        variable: String,
        list: Expr,
        clauses: Vec<Clause>,
    },
    CallSubquery {
        query: Box<Query>,
        yields: Vec<YieldItem>,
    },
}

impl Clause {
    pub fn is_write(&self) -> bool {
        match self {
            Clause::Create { .. }
            | Clause::Merge { .. }
            | Clause::Set(_)
            | Clause::Remove(_)
            | Clause::Delete { .. }
            | Clause::Foreach { .. } => true,
            Clause::CallSubquery { query, .. } => query.is_write(),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Clause::Match { optional: true, .. } => "OPTIONAL MATCH",
            Clause::Match { .. } => "MATCH",
            Clause::Unwind { .. } => "UNWIND",
            Clause::With(_) => "WITH",
            Clause::Return(_) => "RETURN",
            Clause::Create { .. } => "CREATE",
            Clause::Merge { .. } => "MERGE",
            Clause::Set(_) => "SET",
            Clause::Remove(_) => "REMOVE",
            Clause::Delete { .. } => "DELETE",
            Clause::Foreach { .. } => "FOREACH",
            Clause::CallSubquery { .. } => "CALL",
        }
    }
}

/// Body of `WITH` / `RETURN`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    pub distinct: bool,
    /// `*`: every variable in scope
    pub star: bool,
    pub items: Vec<ProjectionItem>,
    pub order_by: Vec<SortItem>,
    pub skip: Option<Expr>,
    pub limit: Option<Expr>,
    /// `WITH ... WHERE`
    pub predicate: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expr: Expr,
    pub alias: Option<String>,
    /// Source text of the expression, used as the default column name
    pub text: String,
}

impl ProjectionItem {
    pub fn column_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YieldItem {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetItem {
    /// `n.key = expr`
    Property { variable: String, key: String, value: Expr },
    /// `n = {map}`
    Replace { variable: String, value: Expr },
    /// `n += {map}`
    MergeMap { variable: String, value: Expr },
    /// `n:Label:Other`
    Labels { variable: String, labels: Vec<Label> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoveItem {
    Property { variable: String, key: String },
    Labels { variable: String, labels: Vec<Label> },
}

/// `p = (a)-[r]->(b)...`
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    pub variable: Option<String>,
    pub start: NodePattern,
    pub segments: Vec<PatternSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternSegment {
    pub relationship: RelationshipPattern,
    pub node: NodePattern,
}

/// `(n:Label {key: expr})`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodePattern {
    pub variable: Option<String>,
    pub labels: Vec<Label>,
    pub properties: Vec<(String, Expr)>,
}

/// `-[r:TYPE|OTHER*1..3 {key: expr}]->`
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipPattern {
    pub variable: Option<String>,
    pub types: Vec<RelType>,
    pub direction: Direction,
    pub length: Option<VarLength>,
    pub properties: Vec<(String, Expr)>,
}

/// Hop bounds of a variable-length relationship; `max: None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLength {
    pub min: usize,
    pub max: Option<usize>,
}

impl PathPattern {
    /// Same path walked from the other end
    pub fn reversed(&self) -> PathPattern {
        let mut nodes: Vec<NodePattern> = std::iter::once(self.start.clone())
            .chain(self.segments.iter().map(|s| s.node.clone()))
            .collect();
        nodes.reverse();
        let mut rels: Vec<RelationshipPattern> = self.segments.iter().map(|s| s.relationship.clone()).collect();
        rels.reverse();
        let start = nodes.remove(0);
        let segments = rels
            .into_iter()
            .zip(nodes)
            .map(|(mut relationship, node)| {
                relationship.direction = relationship.direction.reverse();
                PatternSegment { relationship, node }
            })
            .collect();
        PathPattern {
            variable: self.variable.clone(),
            start,
            segments,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodePattern> {
        std::iter::once(&self.start).chain(self.segments.iter().map(|s| &s.node))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    Xor,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    StartsWith,
    EndsWith,
    Contains,
    Regex,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BinaryOp::Or => "OR",
            BinaryOp::Xor => "XOR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "IN",
            BinaryOp::StartsWith => "STARTS WITH",
            BinaryOp::EndsWith => "ENDS WITH",
            BinaryOp::Contains => "CONTAINS",
            BinaryOp::Regex => "=~",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
        };
        write!(f, "{}", s)
    }
}

pub const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max", "collect", "stdev"];

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(PropertyValue),
    Parameter(String),
    Variable(String),
    Property(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
    /// `n:Label` used as a predicate
    HasLabels { expr: Box<Expr>, labels: Vec<Label> },
    /// Function names are stored lower-case
    Function { name: String, distinct: bool, args: Vec<Expr> },
    CountStar,
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn property(base: Expr, key: impl Into<String>) -> Self {
        Expr::Property(Box::new(base), key.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { name, .. } => AGGREGATE_FUNCTIONS.contains(&name.as_str()),
            _ => false,
        }
    }

    /// True if this expression or any subexpression aggregates
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= e.is_aggregate());
        found
    }

    /// Variables referenced anywhere in the expression
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Variable(v) = e {
                out.insert(v.clone());
            }
        });
        out
    }

    /// Pre-order visit of every subexpression
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Parameter(_) | Expr::Variable(_) | Expr::CountStar => {}
            Expr::Property(base, _) => base.walk(f),
            Expr::Index(base, idx) => {
                base.walk(f);
                idx.walk(f);
            }
            Expr::List(items) => items.iter().for_each(|e| e.walk(f)),
            Expr::Map(entries) => entries.iter().for_each(|(_, e)| e.walk(f)),
            Expr::Unary(_, e) | Expr::IsNull { expr: e, .. } | Expr::HasLabels { expr: e, .. } => e.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Function { args, .. } => args.iter().for_each(|e| e.walk(f)),
            Expr::Case {
                operand,
                branches,
                default,
            } => {
                if let Some(op) = operand {
                    op.walk(f);
                }
                for (w, t) in branches {
                    w.walk(f);
                    t.walk(f);
                }
                if let Some(d) = default {
                    d.walk(f);
                }
            }
        }
    }

    /// Rebuild the tree bottom-up, replacing any node for which `f` returns
    /// `Some`; replaced nodes are not descended into
    pub fn rewrite(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        let boxed = |e: &Expr, f: &mut dyn FnMut(&Expr) -> Option<Expr>| Box::new(e.rewrite(f));
        match self {
            Expr::Literal(_) | Expr::Parameter(_) | Expr::Variable(_) | Expr::CountStar => self.clone(),
            Expr::Property(base, key) => Expr::Property(boxed(base, f), key.clone()),
            Expr::Index(base, idx) => {
                let base = boxed(base, f);
                Expr::Index(base, boxed(idx, f))
            }
            Expr::List(items) => Expr::List(items.iter().map(|e| e.rewrite(f)).collect()),
            Expr::Map(entries) => Expr::Map(entries.iter().map(|(k, e)| (k.clone(), e.rewrite(f))).collect()),
            Expr::Unary(op, e) => Expr::Unary(*op, boxed(e, f)),
            Expr::Binary(op, l, r) => {
                let l = boxed(l, f);
                Expr::Binary(*op, l, boxed(r, f))
            }
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: boxed(expr, f),
                negated: *negated,
            },
            Expr::HasLabels { expr, labels } => Expr::HasLabels {
                expr: boxed(expr, f),
                labels: labels.clone(),
            },
            Expr::Function { name, distinct, args } => Expr::Function {
                name: name.clone(),
                distinct: *distinct,
                args: args.iter().map(|e| e.rewrite(f)).collect(),
            },
            Expr::Case {
                operand,
                branches,
                default,
            } => Expr::Case {
                operand: operand.as_ref().map(|e| boxed(e, f)),
                branches: branches.iter().map(|(w, t)| (w.rewrite(f), t.rewrite(f))).collect(),
                default: default.as_ref().map(|e| boxed(e, f)),
            },
        }
    }

    /// Top-level `AND` operands
    pub fn conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Binary(BinaryOp::And, l, r) => {
                let mut out = l.conjuncts();
                out.extend(r.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// `AND` of all `exprs`; `None` when empty
    pub fn and_all(exprs: Vec<Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(|acc, e| Expr::binary(BinaryOp::And, acc, e))
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter, items: impl Iterator<Item = T>) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Literal(PropertyValue::String(s)) => write!(f, "{:?}", s),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Parameter(p) => write!(f, "${}", p),
            Expr::Variable(v) => write!(f, "{}", v.trim_start()),
            Expr::Property(base, key) => write!(f, "{}.{}", base, key),
            Expr::Index(base, idx) => write!(f, "{}[{}]", base, idx),
            Expr::List(items) => {
                write!(f, "[")?;
                write_list(f, items.iter())?;
                write!(f, "]")
            }
            Expr::Map(entries) => {
                write!(f, "{{")?;
                write_list(f, entries.iter().map(|(k, v)| format!("{}: {}", k, v)))?;
                write!(f, "}}")
            }
            Expr::Unary(UnaryOp::Not, e) => write!(f, "NOT {}", e),
            Expr::Unary(UnaryOp::Neg, e) => write!(f, "-{}", e),
            Expr::Binary(op, l, r) => write!(f, "({} {} {})", l, op, r),
            Expr::IsNull { expr, negated: false } => write!(f, "{} IS NULL", expr),
            Expr::IsNull { expr, negated: true } => write!(f, "{} IS NOT NULL", expr),
            Expr::HasLabels { expr, labels } => {
                write!(f, "{}", expr)?;
                for label in labels {
                    write!(f, ":{}", label)?;
                }
                Ok(())
            }
            Expr::Function { name, distinct, args } => {
                write!(f, "{}(", name)?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                write_list(f, args.iter())?;
                write!(f, ")")
            }
            Expr::CountStar => write!(f, "count(*)"),
            Expr::Case {
                operand,
                branches,
                default,
            } => {
                write!(f, "CASE")?;
                if let Some(op) = operand {
                    write!(f, " {}", op)?;
                }
                for (w, t) in branches {
                    write!(f, " WHEN {} THEN {}", w, t)?;
                }
                if let Some(d) = default {
                    write!(f, " ELSE {}", d)?;
                }
                write!(f, " END")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conjuncts_and_variables() {
        let a = Expr::binary(BinaryOp::Gt, Expr::property(Expr::variable("a"), "x"), Expr::Literal(1.into()));
        let b = Expr::binary(BinaryOp::Eq, Expr::variable("b"), Expr::variable("c"));
        let both = Expr::binary(BinaryOp::And, a.clone(), b.clone());
        assert_eq!(both.clone().conjuncts(), vec![a, b]);
        assert_eq!(
            both.variables().into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(!both.contains_aggregate());
    }

    #[test]
    fn test_reversed_pattern() {
        let rel = |t: &str, d| RelationshipPattern {
            variable: None,
            types: vec![RelType::new(t)],
            direction: d,
            length: None,
            properties: vec![],
        };
        let node = |v: &str| NodePattern {
            variable: Some(v.to_string()),
            ..NodePattern::default()
        };
        let path = PathPattern {
            variable: None,
            start: node("a"),
            segments: vec![
                PatternSegment {
                    relationship: rel("X", Direction::Outgoing),
                    node: node("b"),
                },
                PatternSegment {
                    relationship: rel("Y", Direction::Incoming),
                    node: node("c"),
                },
            ],
        };
        let rev = path.reversed();
        assert_eq!(rev.start.variable.as_deref(), Some("c"));
        assert_eq!(rev.segments[0].relationship.types[0], RelType::new("Y"));
        assert_eq!(rev.segments[0].relationship.direction, Direction::Outgoing);
        assert_eq!(rev.segments[1].node.variable.as_deref(), Some("a"));
        assert_eq!(rev.segments[1].relationship.direction, Direction::Incoming);
    }
}
