//! AST to IR lowering
//!
//! Operators are ordered by data dependency: patterns are walked from an
//! already-bound end when there is one, and each `WHERE` conjunct is placed
//! right after the first operator that binds all of its variables. The one
//! rewrite is rule based: `var.prop = expr` on an indexed label/property,
//! with `expr` independent of `var`, becomes an [`LogicalOp::IndexSeek`].

use super::ast::*;
use super::executor::eval::is_known_function;
use super::ir::{AggregateCall, AggregateFunction, ExpandSpec, LogicalOp, Plan, SortKey};
use crate::graph::{Direction, Label, PropertyPath};
use crate::index::IndexManager;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Variable `{0}` not defined")]
    UnresolvedVariable(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Multiple result columns named `{0}`")]
    DuplicateColumn(String),

    #[error("All sub queries in a UNION must have the same column names: {left:?} vs {right:?}")]
    UnionColumns { left: Vec<String>, right: Vec<String> },
}

pub type CompileResult<T> = Result<T, CompileError>;

type Scope = BTreeSet<String>;

/// Compile `query`, consulting `indexes` for seek rewrites
pub fn compile(query: &Query, indexes: &IndexManager) -> CompileResult<Plan> {
    let mut compiler = Compiler { indexes, hidden: 0 };
    let (root, columns) = compiler.query(query, LogicalOp::Argument, &Scope::new())?;
    let is_write = root.is_write();
    debug!("Compiled plan with {} column(s), write={}", columns.len(), is_write);
    Ok(Plan {
        root,
        columns,
        is_write,
    })
}

fn is_hidden(name: &str) -> bool {
    name.starts_with(' ')
}

fn boxed(op: LogicalOp) -> Box<LogicalOp> {
    Box::new(op)
}

struct Compiler<'a> {
    indexes: &'a IndexManager,
    hidden: usize,
}

impl<'a> Compiler<'a> {
    fn hidden_name(&mut self, kind: &str) -> String {
        self.hidden += 1;
        format!("  {}{}", kind, self.hidden)
    }

    fn query(&mut self, query: &Query, input: LogicalOp, scope: &Scope) -> CompileResult<(LogicalOp, Vec<String>)> {
        let mut inner = scope.clone();
        let (mut root, columns) = self.single(&query.first, input.clone(), &mut inner)?;
        for (all, branch) in &query.unions {
            let mut inner = scope.clone();
            let (right, right_columns) = self.single(branch, input.clone(), &mut inner)?;
            if right_columns != columns {
                return Err(CompileError::UnionColumns {
                    left: columns,
                    right: right_columns,
                });
            }
            root = LogicalOp::Union {
                left: boxed(root),
                right: boxed(right),
                all: *all,
            };
            if !*all {
                root = LogicalOp::Distinct { input: boxed(root) };
            }
        }
        Ok((root, columns))
    }

    fn single(
        &mut self,
        query: &SingleQuery,
        input: LogicalOp,
        scope: &mut Scope,
    ) -> CompileResult<(LogicalOp, Vec<String>)> {
        let mut op = input;
        let mut columns = Vec::new();
        for clause in &query.clauses {
            if let Clause::Return(projection) = clause {
                let (next, cols) = self.projection(projection, op, scope)?;
                op = next;
                columns = cols;
            } else {
                op = self.clause(clause, op, scope)?;
            }
        }
        Ok((op, columns))
    }

    fn clauses(&mut self, clauses: &[Clause], input: LogicalOp, scope: &mut Scope) -> CompileResult<LogicalOp> {
        let mut op = input;
        for clause in clauses {
            op = self.clause(clause, op, scope)?;
        }
        Ok(op)
    }

    fn clause(&mut self, clause: &Clause, op: LogicalOp, scope: &mut Scope) -> CompileResult<LogicalOp> {
        match clause {
            Clause::Match {
                optional: false,
                patterns,
                predicate,
            } => self.match_patterns(patterns, predicate.as_ref(), op, scope),
            Clause::Match {
                optional: true,
                patterns,
                predicate,
            } => self.optional_match(patterns, predicate.as_ref(), op, scope),
            Clause::Unwind { expr, variable } => {
                check_expr(expr, scope, false)?;
                self.declare(variable, scope)?;
                Ok(LogicalOp::Unwind {
                    input: boxed(op),
                    expr: expr.clone(),
                    variable: variable.clone(),
                })
            }
            Clause::With(projection) => {
                let (op, columns) = self.projection(projection, op, scope)?;
                *scope = columns.into_iter().collect();
                match &projection.predicate {
                    Some(pred) => {
                        check_expr(pred, scope, false)?;
                        Ok(LogicalOp::Filter {
                            input: boxed(op),
                            predicate: pred.clone(),
                        })
                    }
                    None => Ok(op),
                }
            }
            Clause::Return(_) => Err(CompileError::Unsupported("RETURN must be the final clause".to_string())),
            Clause::Create { patterns } => {
                let mut named = Vec::with_capacity(patterns.len());
                for pattern in patterns {
                    let pattern = self.name_pattern(pattern);
                    self.check_creatable(&pattern, scope, true)?;
                    named.push(pattern);
                }
                Ok(LogicalOp::Create {
                    input: boxed(op),
                    patterns: named,
                })
            }
            Clause::Merge {
                pattern,
                on_create,
                on_match,
            } => {
                let pattern = self.name_pattern(pattern);
                let mut match_scope = scope.clone();
                let matcher = self.match_patterns(
                    std::slice::from_ref(&pattern),
                    None,
                    LogicalOp::Argument,
                    &mut match_scope,
                )?;
                self.check_creatable(&pattern, scope, false)?;
                for item in on_create.iter().chain(on_match) {
                    check_set_item(item, scope)?;
                }
                Ok(LogicalOp::Merge {
                    input: boxed(op),
                    pattern,
                    matcher: boxed(matcher),
                    on_create: on_create.clone(),
                    on_match: on_match.clone(),
                })
            }
            Clause::Set(items) => {
                for item in items {
                    check_set_item(item, scope)?;
                }
                Ok(LogicalOp::SetProperty {
                    input: boxed(op),
                    items: items.clone(),
                })
            }
            Clause::Remove(items) => {
                for item in items {
                    let variable = match item {
                        RemoveItem::Property { variable, .. } | RemoveItem::Labels { variable, .. } => variable,
                    };
                    require_bound(variable, scope)?;
                }
                Ok(LogicalOp::Remove {
                    input: boxed(op),
                    items: items.clone(),
                })
            }
            Clause::Delete { detach, exprs } => {
                for expr in exprs {
                    check_expr(expr, scope, false)?;
                }
                Ok(LogicalOp::Delete {
                    input: boxed(op),
                    exprs: exprs.clone(),
                    detach: *detach,
                })
            }
            Clause::Foreach {
                variable,
                list,
                clauses,
            } => {
                check_expr(list, scope, false)?;
                let mut body_scope = scope.clone();
                self.declare(variable, &mut body_scope)?;
                let body = self.clauses(clauses, LogicalOp::Argument, &mut body_scope)?;
                Ok(LogicalOp::Foreach {
                    input: boxed(op),
                    variable: variable.clone(),
                    list: list.clone(),
                    body: boxed(body),
                })
            }
            Clause::CallSubquery { query, yields } => {
                let (subquery, columns) = self.query(query, LogicalOp::Argument, scope)?;
                let yields: Vec<(String, String)> = if yields.is_empty() {
                    columns.iter().map(|c| (c.clone(), c.clone())).collect()
                } else {
                    yields
                        .iter()
                        .map(|y| {
                            if !columns.contains(&y.name) {
                                return Err(CompileError::UnresolvedVariable(y.name.clone()));
                            }
                            Ok((y.name.clone(), y.alias.clone().unwrap_or_else(|| y.name.clone())))
                        })
                        .collect::<CompileResult<_>>()?
                };
                for (_, outer) in &yields {
                    self.declare(outer, scope)?;
                }
                Ok(LogicalOp::CallSubquery {
                    input: boxed(op),
                    subquery: boxed(subquery),
                    yields,
                })
            }
        }
    }

    fn declare(&self, variable: &str, scope: &mut Scope) -> CompileResult<()> {
        if !scope.insert(variable.to_string()) {
            return Err(CompileError::Unsupported(format!(
                "Variable `{}` already declared",
                variable.trim_start()
            )));
        }
        Ok(())
    }

    /// Give every anonymous node and relationship a hidden name
    fn name_pattern(&mut self, pattern: &PathPattern) -> PathPattern {
        let mut pattern = pattern.clone();
        if pattern.start.variable.is_none() {
            pattern.start.variable = Some(self.hidden_name("node"));
        }
        for seg in &mut pattern.segments {
            if seg.relationship.variable.is_none() {
                seg.relationship.variable = Some(self.hidden_name("rel"));
            }
            if seg.node.variable.is_none() {
                seg.node.variable = Some(self.hidden_name("node"));
            }
        }
        pattern
    }

    /// Validate a CREATE/MERGE pattern and declare the variables it introduces
    fn check_creatable(&self, pattern: &PathPattern, scope: &mut Scope, strict: bool) -> CompileResult<()> {
        let mut introduced = Vec::new();
        for node in pattern.nodes() {
            let var = node_var(node);
            if scope.contains(var) || introduced.contains(&var) {
                if strict && (!node.labels.is_empty() || !node.properties.is_empty()) {
                    return Err(CompileError::Unsupported(format!(
                        "Variable `{}` already declared; it cannot be created again",
                        var.trim_start()
                    )));
                }
            } else {
                introduced.push(var);
            }
            for (_, expr) in &node.properties {
                check_expr(expr, scope, false)?;
            }
        }
        for seg in &pattern.segments {
            let rel = &seg.relationship;
            let var = rel_var(rel);
            if scope.contains(var) {
                return Err(CompileError::Unsupported(format!(
                    "Relationship variable `{}` already declared",
                    var.trim_start()
                )));
            }
            if rel.types.len() != 1 {
                return Err(CompileError::Unsupported(
                    "A created relationship needs exactly one type".to_string(),
                ));
            }
            if rel.length.is_some() {
                return Err(CompileError::Unsupported(
                    "Variable-length relationships cannot be created".to_string(),
                ));
            }
            if strict && rel.direction == Direction::Both {
                return Err(CompileError::Unsupported(
                    "A created relationship needs a direction".to_string(),
                ));
            }
            for (_, expr) in &rel.properties {
                check_expr(expr, scope, false)?;
            }
            introduced.push(var);
        }
        if let Some(path) = &pattern.variable {
            introduced.push(path.as_str());
        }
        for var in introduced {
            scope.insert(var.to_string());
        }
        Ok(())
    }

    // ---- MATCH ----

    fn match_patterns(
        &mut self,
        patterns: &[PathPattern],
        predicate: Option<&Expr>,
        input: LogicalOp,
        scope: &mut Scope,
    ) -> CompileResult<LogicalOp> {
        let mut pending: Vec<Expr> = predicate.cloned().map(Expr::conjuncts).unwrap_or_default();
        for conj in &pending {
            check_functions(conj, false)?;
        }
        let mut op = input;
        let mut clause_rels: Vec<String> = Vec::new();
        for pattern in patterns {
            let mut pattern = self.name_pattern(pattern);
            let start_bound = scope.contains(node_var(&pattern.start));
            let end_bound = pattern
                .segments
                .last()
                .map(|s| scope.contains(node_var(&s.node)))
                .unwrap_or(false);
            if !start_bound && end_bound {
                pattern = pattern.reversed();
            }

            let start = node_var(&pattern.start).to_string();
            pending.extend(property_predicates(&start, &pattern.start.properties));
            if scope.contains(&start) {
                if !pattern.start.labels.is_empty() {
                    pending.push(has_labels(&start, &pattern.start.labels));
                }
            } else {
                op = self.scan(op, &start, &pattern.start.labels, &mut pending, scope);
                scope.insert(start.clone());
            }
            op = place_filters(op, &mut pending, scope);

            let mut steps = Vec::with_capacity(pattern.segments.len());
            let mut from = start.clone();
            for seg in &pattern.segments {
                let rel = &seg.relationship;
                let rel_name = rel_var(rel).to_string();
                let to = node_var(&seg.node).to_string();
                if scope.contains(&rel_name) {
                    return Err(CompileError::Unsupported(format!(
                        "Relationship variable `{}` is already bound",
                        rel_name.trim_start()
                    )));
                }
                for (_, expr) in &rel.properties {
                    check_expr(expr, scope, false)?;
                }
                let spec = ExpandSpec {
                    from: from.clone(),
                    rel_variable: rel_name.clone(),
                    to: to.clone(),
                    to_bound: scope.contains(&to),
                    types: rel.types.clone(),
                    direction: rel.direction,
                    to_labels: seg.node.labels.clone(),
                    rel_properties: rel.properties.clone(),
                    length: rel.length,
                    exclude: clause_rels.clone(),
                };
                op = LogicalOp::Expand { input: boxed(op), spec };
                scope.insert(rel_name.clone());
                scope.insert(to.clone());
                clause_rels.push(rel_name.clone());
                pending.extend(property_predicates(&to, &seg.node.properties));
                op = place_filters(op, &mut pending, scope);
                steps.push((rel_name, to.clone()));
                from = to;
            }

            if let Some(path_var) = &pattern.variable {
                self.declare(path_var, scope)?;
                op = LogicalOp::BindPath {
                    input: boxed(op),
                    variable: path_var.clone(),
                    start,
                    steps,
                };
                op = place_filters(op, &mut pending, scope);
            }
        }
        if let Some(pred) = pending.first() {
            check_expr(pred, scope, false)?;
        }
        Ok(op)
    }

    fn scan(
        &mut self,
        input: LogicalOp,
        variable: &str,
        labels: &[Label],
        pending: &mut Vec<Expr>,
        scope: &Scope,
    ) -> LogicalOp {
        for (li, label) in labels.iter().enumerate() {
            let seek = pending.iter().enumerate().find_map(|(i, conj)| {
                let (path, value) = equality_on(conj, variable)?;
                let independent = value.variables().iter().all(|v| v != variable && scope.contains(v));
                if independent && self.indexes.find_property_index(label, &path).is_some() {
                    Some((i, path, value.clone()))
                } else {
                    None
                }
            });
            if let Some((i, property, value)) = seek {
                pending.remove(i);
                let rest: Vec<Label> = labels
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != li)
                    .map(|(_, l)| l.clone())
                    .collect();
                if !rest.is_empty() {
                    pending.push(has_labels(variable, &rest));
                }
                debug!("Using index on :{}({}) for `{}`", label, property, variable.trim_start());
                return LogicalOp::IndexSeek {
                    input: boxed(input),
                    variable: variable.to_string(),
                    label: label.clone(),
                    property,
                    value,
                };
            }
        }
        if labels.len() > 1 {
            pending.push(has_labels(variable, &labels[1..]));
        }
        LogicalOp::ScanLabel {
            input: boxed(input),
            variable: variable.to_string(),
            label: labels.first().cloned(),
        }
    }

    fn optional_match(
        &mut self,
        patterns: &[PathPattern],
        predicate: Option<&Expr>,
        input: LogicalOp,
        scope: &mut Scope,
    ) -> CompileResult<LogicalOp> {
        if let Some(op) = self.optional_expand(patterns, predicate, &input, scope)? {
            return Ok(op);
        }
        let mut inner_scope = scope.clone();
        let inner = self.match_patterns(patterns, predicate, LogicalOp::Argument, &mut inner_scope)?;
        let variables: Vec<String> = inner_scope.difference(scope).cloned().collect();
        scope.extend(variables.iter().cloned());
        Ok(LogicalOp::Optional {
            input: boxed(input),
            inner: boxed(inner),
            variables,
        })
    }

    /// `OPTIONAL MATCH (bound)-[r]-(new)` as a single operator
    fn optional_expand(
        &mut self,
        patterns: &[PathPattern],
        predicate: Option<&Expr>,
        input: &LogicalOp,
        scope: &mut Scope,
    ) -> CompileResult<Option<LogicalOp>> {
        let [pattern] = patterns else {
            return Ok(None);
        };
        if pattern.variable.is_some() || pattern.segments.len() != 1 {
            return Ok(None);
        }
        let pattern = self.name_pattern(pattern);
        let seg = &pattern.segments[0];
        let from = node_var(&pattern.start);
        let to = node_var(&seg.node);
        let rel_name = rel_var(&seg.relationship);
        let simple = scope.contains(from)
            && pattern.start.labels.is_empty()
            && pattern.start.properties.is_empty()
            && !scope.contains(to)
            && !scope.contains(rel_name)
            && seg.relationship.length.is_none();
        if !simple {
            return Ok(None);
        }
        let mut inner_scope = scope.clone();
        inner_scope.insert(rel_name.to_string());
        inner_scope.insert(to.to_string());
        for (_, expr) in &seg.relationship.properties {
            check_expr(expr, scope, false)?;
        }
        let mut conjuncts = property_predicates(to, &seg.node.properties);
        if let Some(pred) = predicate {
            conjuncts.extend(pred.clone().conjuncts());
        }
        for conj in &conjuncts {
            check_expr(conj, &inner_scope, false)?;
        }
        let spec = ExpandSpec {
            from: from.to_string(),
            rel_variable: rel_name.to_string(),
            to: to.to_string(),
            to_bound: false,
            types: seg.relationship.types.clone(),
            direction: seg.relationship.direction,
            to_labels: seg.node.labels.clone(),
            rel_properties: seg.relationship.properties.clone(),
            length: None,
            exclude: Vec::new(),
        };
        *scope = inner_scope;
        Ok(Some(LogicalOp::OptionalExpand {
            input: boxed(input.clone()),
            spec,
            filter: Expr::and_all(conjuncts),
        }))
    }

    // ---- WITH / RETURN ----

    /// Lower a projection; returns the operator and its output columns
    fn projection(
        &mut self,
        projection: &Projection,
        input: LogicalOp,
        scope: &Scope,
    ) -> CompileResult<(LogicalOp, Vec<String>)> {
        let mut items: Vec<(String, Expr)> = Vec::new();
        if projection.star {
            let visible: Vec<&String> = scope.iter().filter(|v| !is_hidden(v)).collect();
            if visible.is_empty() && projection.items.is_empty() {
                return Err(CompileError::Unsupported(
                    "RETURN * is not allowed when there are no variables in scope".to_string(),
                ));
            }
            items.extend(visible.into_iter().map(|v| (v.clone(), Expr::Variable(v.clone()))));
        }
        for item in &projection.items {
            check_expr(&item.expr, scope, true)?;
            items.push((item.column_name(), item.expr.clone()));
        }
        let mut columns: Vec<String> = Vec::with_capacity(items.len());
        for (name, _) in &items {
            if columns.contains(name) {
                return Err(CompileError::DuplicateColumn(name.clone()));
            }
            columns.push(name.clone());
        }
        for expr in projection.skip.iter().chain(&projection.limit) {
            check_expr(expr, &Scope::new(), false)?;
        }

        let aggregating = items.iter().any(|(_, e)| e.contains_aggregate());
        // sort keys refer to projected items by expression or by alias
        let mut sort_keys: Vec<SortKey> = projection
            .order_by
            .iter()
            .map(|s| SortKey {
                expr: s.expr.rewrite(&mut |sub| {
                    items
                        .iter()
                        .find(|(_, e)| e == sub)
                        .map(|(n, _)| Expr::Variable(n.clone()))
                }),
                descending: s.descending,
            })
            .collect();

        let mut op = input;
        let mut visible_after: Scope = columns.iter().cloned().collect();
        if aggregating {
            let mut aggregates: Vec<(String, AggregateCall)> = Vec::new();
            let mut keys = Vec::new();
            let mut post = Vec::new();
            for (name, expr) in &items {
                if expr.contains_aggregate() {
                    let rewritten = self.extract_aggregates(expr, &mut aggregates)?;
                    post.push((name.clone(), rewritten));
                } else {
                    keys.push((name.clone(), expr.clone()));
                    post.push((name.clone(), Expr::Variable(name.clone())));
                }
            }
            for key in &mut sort_keys {
                key.expr = self.extract_aggregates(&key.expr, &mut aggregates)?;
            }
            let grouped: Scope = keys
                .iter()
                .map(|(n, _)| n.clone())
                .chain(aggregates.iter().map(|(n, _)| n.clone()))
                .collect();
            for (_, expr) in &post {
                for var in expr.variables() {
                    if !grouped.contains(&var) {
                        return Err(CompileError::Unsupported(format!(
                            "Variable `{}` must be a grouping key to be used next to an aggregate",
                            var.trim_start()
                        )));
                    }
                }
            }
            visible_after.extend(grouped);
            op = LogicalOp::Aggregate {
                input: boxed(op),
                keys,
                aggregates,
            };
            op = LogicalOp::Project {
                input: boxed(op),
                items: post,
                keep_existing: true,
            };
        } else {
            op = LogicalOp::Project {
                input: boxed(op),
                items: items.clone(),
                keep_existing: !projection.distinct,
            };
            if !projection.distinct {
                visible_after.extend(scope.iter().cloned());
            }
        }
        if projection.distinct {
            if aggregating {
                op = select_columns(op, &columns);
            }
            op = LogicalOp::Distinct { input: boxed(op) };
            visible_after = columns.iter().cloned().collect();
        }
        for key in &sort_keys {
            check_expr(&key.expr, &visible_after, false)?;
        }

        if !sort_keys.is_empty() {
            op = LogicalOp::OrderBy {
                input: boxed(op),
                keys: sort_keys,
                top: projection.limit.clone().map(|l| (projection.skip.clone(), l)),
            };
        }
        if let Some(skip) = &projection.skip {
            op = LogicalOp::Skip {
                input: boxed(op),
                count: skip.clone(),
            };
        }
        if let Some(limit) = &projection.limit {
            op = LogicalOp::Limit {
                input: boxed(op),
                count: limit.clone(),
            };
        }
        let needs_select = aggregating || !projection.distinct;
        if needs_select {
            op = select_columns(op, &columns);
        }
        Ok((op, columns))
    }

    /// Replace aggregate calls inside `expr` with hidden variables bound by
    /// the aggregate operator, reusing identical calls
    fn extract_aggregates(&mut self, expr: &Expr, aggregates: &mut Vec<(String, AggregateCall)>) -> CompileResult<Expr> {
        let mut error = None;
        let rewritten = expr.rewrite(&mut |sub| {
            let call = match sub {
                Expr::CountStar => AggregateCall {
                    function: AggregateFunction::Count,
                    distinct: false,
                    arg: None,
                },
                Expr::Function { name, distinct, args } => {
                    let function = AggregateFunction::from_name(name)?;
                    if args.len() != 1 {
                        error = Some(CompileError::Unsupported(format!("{}() takes exactly one argument", name)));
                        return Some(Expr::Literal(crate::graph::PropertyValue::Null));
                    }
                    if args[0].contains_aggregate() {
                        error = Some(CompileError::Unsupported("Aggregates cannot be nested".to_string()));
                        return Some(Expr::Literal(crate::graph::PropertyValue::Null));
                    }
                    AggregateCall {
                        function,
                        distinct: *distinct,
                        arg: Some(args[0].clone()),
                    }
                }
                _ => return None,
            };
            if let Some((name, _)) = aggregates.iter().find(|(_, c)| *c == call) {
                return Some(Expr::Variable(name.clone()));
            }
            self.hidden += 1;
            let name = format!("  agg{}", self.hidden);
            aggregates.push((name.clone(), call));
            Some(Expr::Variable(name))
        });
        match error {
            Some(e) => Err(e),
            None => Ok(rewritten),
        }
    }
}

fn select_columns(input: LogicalOp, columns: &[String]) -> LogicalOp {
    match input {
        // a projection binding exactly the columns only has to drop the rest
        LogicalOp::Project { input, items, .. } if items.iter().map(|(n, _)| n).eq(columns.iter()) => {
            LogicalOp::Project {
                input,
                items,
                keep_existing: false,
            }
        }
        input => LogicalOp::Project {
            input: boxed(input),
            items: columns.iter().map(|c| (c.clone(), Expr::Variable(c.clone()))).collect(),
            keep_existing: false,
        },
    }
}

fn node_var(node: &NodePattern) -> &str {
    node.variable.as_deref().unwrap_or_default()
}

fn rel_var(rel: &RelationshipPattern) -> &str {
    rel.variable.as_deref().unwrap_or_default()
}

fn has_labels(variable: &str, labels: &[Label]) -> Expr {
    Expr::HasLabels {
        expr: Box::new(Expr::variable(variable)),
        labels: labels.to_vec(),
    }
}

fn property_predicates(variable: &str, properties: &[(String, Expr)]) -> Vec<Expr> {
    properties
        .iter()
        .map(|(key, value)| {
            Expr::binary(
                BinaryOp::Eq,
                Expr::property(Expr::variable(variable), key.clone()),
                value.clone(),
            )
        })
        .collect()
}

/// Move every pending predicate whose variables are all bound into filters
fn place_filters(mut op: LogicalOp, pending: &mut Vec<Expr>, scope: &Scope) -> LogicalOp {
    let (ready, waiting): (Vec<Expr>, Vec<Expr>) = pending
        .drain(..)
        .partition(|p| p.variables().iter().all(|v| scope.contains(v)));
    *pending = waiting;
    if let Some(predicate) = Expr::and_all(ready) {
        op = LogicalOp::Filter {
            input: boxed(op),
            predicate,
        };
    }
    op
}

/// `var.a.b = value` (either side) as `(a.b, value)`
fn equality_on<'e>(expr: &'e Expr, variable: &str) -> Option<(PropertyPath, &'e Expr)> {
    let Expr::Binary(BinaryOp::Eq, lhs, rhs) = expr else {
        return None;
    };
    property_path_of(lhs, variable)
        .map(|p| (p, rhs.as_ref()))
        .or_else(|| property_path_of(rhs, variable).map(|p| (p, lhs.as_ref())))
}

fn property_path_of(expr: &Expr, variable: &str) -> Option<PropertyPath> {
    let mut keys = Vec::new();
    let mut current = expr;
    while let Expr::Property(base, key) = current {
        keys.push(key.as_str());
        current = base;
    }
    match current {
        Expr::Variable(v) if v == variable && !keys.is_empty() => {
            keys.reverse();
            Some(PropertyPath::parse(&keys.join(".")))
        }
        _ => None,
    }
}

fn require_bound(variable: &str, scope: &Scope) -> CompileResult<()> {
    if scope.contains(variable) {
        Ok(())
    } else {
        Err(CompileError::UnresolvedVariable(variable.trim_start().to_string()))
    }
}

fn check_set_item(item: &SetItem, scope: &Scope) -> CompileResult<()> {
    match item {
        SetItem::Property { variable, value, .. }
        | SetItem::Replace { variable, value }
        | SetItem::MergeMap { variable, value } => {
            require_bound(variable, scope)?;
            check_expr(value, scope, false)
        }
        SetItem::Labels { variable, .. } => require_bound(variable, scope),
    }
}

/// Every variable bound, every function known, aggregates only where allowed
fn check_expr(expr: &Expr, scope: &Scope, allow_aggregates: bool) -> CompileResult<()> {
    for var in expr.variables() {
        require_bound(&var, scope)?;
    }
    check_functions(expr, allow_aggregates)
}

fn check_functions(expr: &Expr, allow_aggregates: bool) -> CompileResult<()> {
    let mut error = None;
    expr.walk(&mut |e| {
        if error.is_some() {
            return;
        }
        if e.is_aggregate() && !allow_aggregates {
            error = Some(CompileError::Unsupported(format!(
                "Aggregate {} is only allowed in WITH or RETURN",
                e
            )));
        } else if let Expr::Function { name, .. } = e {
            if !e.is_aggregate() && !is_known_function(name) {
                error = Some(CompileError::UnknownFunction(name.clone()));
            }
        }
    });
    error.map_or(Ok(()), Err)
}
