//! Physical operators (Volcano iterator model)
//!
//! Each operator pulls rows from its input on demand. Operators that turn
//! one input row into several output rows are [`RowMapper`]s wrapped in
//! [`PerRow`], which buffers the rows produced for the current input row.

use super::aggregate::Accumulator;
use super::eval::{entity_or_null, evaluate, is_true, relationship_or_null};
use super::record::{Record, Value};
use super::{ExecContext, ExecutionError, ExecutionResult};
use crate::graph::{
    Direction, Entity, EntityId, GraphView, Label, Operation, Path, PropertyMap, PropertyPath, RecordId,
    Relationship, RelationshipId,
};
use crate::query::ast::{Expr, PathPattern, RemoveItem, SetItem};
use crate::query::ir::{AggregateCall, ExpandSpec, SortKey};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Physical operator trait - all operators implement this
pub trait PhysicalOperator: Send {
    /// Next row, or `None` once the operator is exhausted
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>>;

    /// Start over; the next call to `next` re-reads the input
    fn reset(&mut self);
}

/// Type alias for boxed operators
pub type OperatorBox = Box<dyn PhysicalOperator>;

/// Turns one input row into zero or more output rows
pub(crate) trait RowMapper: Send {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()>;
}

pub(crate) struct PerRow<M> {
    input: OperatorBox,
    buffer: VecDeque<Record>,
    mapper: M,
}

impl<M: RowMapper + 'static> PerRow<M> {
    pub(crate) fn boxed(input: OperatorBox, mapper: M) -> OperatorBox {
        Box::new(PerRow {
            input,
            buffer: VecDeque::new(),
            mapper,
        })
    }
}

impl<M: RowMapper> PhysicalOperator for PerRow<M> {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            let Some(row) = self.input.next(ctx)? else {
                return Ok(None);
            };
            ctx.check_deadline()?;
            self.mapper.map(row, ctx, &mut self.buffer)?;
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.buffer.clear();
    }
}

/// Run a nested plan against `row` and collect everything it yields
fn run_nested(plan: &mut OperatorBox, row: Record, ctx: &mut ExecContext) -> ExecutionResult<Vec<Record>> {
    ctx.arguments.push(row);
    plan.reset();
    let mut rows = Vec::new();
    let result = loop {
        match plan.next(ctx) {
            Ok(Some(r)) => rows.push(r),
            Ok(None) => break Ok(rows),
            Err(e) => break Err(e),
        }
    };
    ctx.arguments.pop();
    result
}

fn bound<'r>(row: &'r Record, variable: &str) -> ExecutionResult<&'r Value> {
    row.get(variable)
        .ok_or_else(|| ExecutionError::VariableNotFound(variable.trim_start().to_string()))
}

fn stage(ctx: &mut ExecContext, op: Operation) -> ExecutionResult<()> {
    ctx.tx.add_operation(op, ctx.graph)?;
    Ok(())
}

fn to_property(value: &Value, key: &str) -> ExecutionResult<crate::graph::PropertyValue> {
    value.to_property().ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "Property `{}` cannot hold a {}",
            key,
            value.type_name()
        ))
    })
}

// ---- leaves and scans ----

/// Yields the row the enclosing plan is applied to, once
pub struct ArgumentOperator {
    done: bool,
}

impl ArgumentOperator {
    pub fn new() -> Self {
        ArgumentOperator { done: false }
    }
}

impl Default for ArgumentOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalOperator for ArgumentOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(ctx.arguments.last().cloned().unwrap_or_default()))
    }

    fn reset(&mut self) {
        self.done = false;
    }
}

/// Label (or full) scan: MATCH (n:Person)
pub struct ScanOperator {
    input: OperatorBox,
    variable: String,
    label: Option<Label>,
    current: Option<Record>,
    ids: Vec<EntityId>,
    pos: usize,
}

impl ScanOperator {
    pub fn new(input: OperatorBox, variable: String, label: Option<Label>) -> Self {
        ScanOperator {
            input,
            variable,
            label,
            current: None,
            ids: Vec::new(),
            pos: 0,
        }
    }
}

impl PhysicalOperator for ScanOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        loop {
            if let Some(row) = &self.current {
                while self.pos < self.ids.len() {
                    let id = self.ids[self.pos];
                    self.pos += 1;
                    ctx.check_deadline()?;
                    if !ctx.view().contains_entity(id) {
                        continue;
                    }
                    ctx.tx.add_read(RecordId::Entity(id))?;
                    let mut out = row.clone();
                    out.bind(self.variable.clone(), Value::EntityRef(id));
                    return Ok(Some(out));
                }
            }
            let Some(row) = self.input.next(ctx)? else {
                self.current = None;
                return Ok(None);
            };
            let view = ctx.view();
            self.ids = match &self.label {
                Some(label) => view.entity_ids_with_label(label),
                None => view.entity_ids(),
            };
            self.pos = 0;
            self.current = Some(row);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current = None;
        self.ids.clear();
        self.pos = 0;
    }
}

pub(crate) struct IndexSeek {
    pub variable: String,
    pub label: Label,
    pub property: PropertyPath,
    pub value: Expr,
}

impl RowMapper for IndexSeek {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let wanted = evaluate(&self.value, &row, ctx)?;
        if wanted.is_null() {
            return Ok(());
        }
        let Some(wanted) = wanted.to_property() else {
            return Ok(());
        };
        let view = ctx.view();
        let candidates = view
            .index_lookup(&self.label, &self.property, &wanted)
            .unwrap_or_else(|| view.entity_ids_with_label(&self.label));
        // the index may be stale for entities this transaction changed
        let ids: Vec<EntityId> = candidates
            .into_iter()
            .filter(|id| {
                view.entity(*id)
                    .map(|e| e.has_label(&self.label) && e.property_at(&self.property) == Some(&wanted))
                    .unwrap_or(false)
            })
            .collect();
        for id in ids {
            ctx.tx.add_read(RecordId::Entity(id))?;
            let mut r = row.clone();
            r.bind(self.variable.clone(), Value::EntityRef(id));
            out.push_back(r);
        }
        Ok(())
    }
}

// ---- expansion ----

fn collect_relationship_ids(value: &Value, into: &mut FxHashSet<RelationshipId>) {
    match value {
        Value::List(items) => items.iter().for_each(|v| collect_relationship_ids(v, into)),
        other => {
            if let Some(id) = other.relationship_id() {
                into.insert(id);
            }
        }
    }
}

struct Hop {
    rels: Vec<RelationshipId>,
    end: EntityId,
}

/// Every way to expand `spec` from `row`, relationship-unique
fn expand_hops(spec: &ExpandSpec, row: &Record, ctx: &mut ExecContext) -> ExecutionResult<Vec<Hop>> {
    let Some(from) = entity_or_null(bound(row, &spec.from)?)? else {
        return Ok(Vec::new());
    };
    let target = if spec.to_bound {
        match entity_or_null(bound(row, &spec.to)?)? {
            Some(t) => Some(t),
            None => return Ok(Vec::new()),
        }
    } else {
        None
    };
    let mut excluded = FxHashSet::default();
    for var in &spec.exclude {
        if let Some(v) = row.get(var) {
            collect_relationship_ids(v, &mut excluded);
        }
    }
    let mut rel_props = Vec::with_capacity(spec.rel_properties.len());
    for (key, expr) in &spec.rel_properties {
        rel_props.push((key.as_str(), evaluate(expr, row, ctx)?));
    }

    let view = ctx.view();
    let rel_ok = |rel: &Relationship| {
        !excluded.contains(&rel.id)
            && rel_props.iter().all(|(k, v)| {
                rel.get_property(k)
                    .map(|p| Value::from(p.clone()).equals(v) == Some(true))
                    .unwrap_or(false)
            })
    };
    let end_ok = |id: EntityId| {
        target.map_or(true, |t| t == id)
            && view
                .entity(id)
                .map(|e| e.has_labels(&spec.to_labels))
                .unwrap_or(false)
    };

    let mut hops = Vec::new();
    match spec.length {
        None => {
            for rel in view.relationships_of(from, spec.direction, &spec.types) {
                let end = rel.other_end(from);
                if rel_ok(rel) && end_ok(end) {
                    hops.push(Hop { rels: vec![rel.id], end });
                }
            }
        }
        Some(length) => {
            let mut stack = vec![(from, Vec::<RelationshipId>::new())];
            while let Some((node, path)) = stack.pop() {
                if path.len() >= length.min && end_ok(node) {
                    hops.push(Hop {
                        rels: path.clone(),
                        end: node,
                    });
                }
                if length.max.map_or(false, |max| path.len() >= max) {
                    continue;
                }
                let rels = view.relationships_of(node, spec.direction, &spec.types);
                for rel in rels.into_iter().rev() {
                    if path.contains(&rel.id) || !rel_ok(rel) {
                        continue;
                    }
                    let mut next = path.clone();
                    next.push(rel.id);
                    stack.push((rel.other_end(node), next));
                }
            }
        }
    }
    for hop in &hops {
        for rid in &hop.rels {
            ctx.tx.add_read(RecordId::Relationship(*rid))?;
        }
        ctx.tx.add_read(RecordId::Entity(hop.end))?;
    }
    Ok(hops)
}

fn bind_hop(spec: &ExpandSpec, row: &Record, hop: Hop) -> Record {
    let mut out = row.clone();
    let rel_value = match spec.length {
        None => Value::RelationshipRef(hop.rels[0]),
        Some(_) => Value::List(hop.rels.into_iter().map(Value::RelationshipRef).collect()),
    };
    out.bind(spec.rel_variable.clone(), rel_value);
    if !spec.to_bound {
        out.bind(spec.to.clone(), Value::EntityRef(hop.end));
    }
    out
}

pub(crate) struct Expand {
    pub spec: ExpandSpec,
}

impl RowMapper for Expand {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        for hop in expand_hops(&self.spec, &row, ctx)? {
            out.push_back(bind_hop(&self.spec, &row, hop));
        }
        Ok(())
    }
}

pub(crate) struct OptionalExpand {
    pub spec: ExpandSpec,
    pub filter: Option<Expr>,
}

impl RowMapper for OptionalExpand {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let before = out.len();
        for hop in expand_hops(&self.spec, &row, ctx)? {
            let candidate = bind_hop(&self.spec, &row, hop);
            let keep = match &self.filter {
                Some(pred) => is_true(&evaluate(pred, &candidate, ctx)?)?,
                None => true,
            };
            if keep {
                out.push_back(candidate);
            }
        }
        if out.len() == before {
            let mut r = row;
            r.bind(self.spec.rel_variable.clone(), Value::Null);
            r.bind(self.spec.to.clone(), Value::Null);
            out.push_back(r);
        }
        Ok(())
    }
}

pub(crate) struct Optional {
    pub inner: OperatorBox,
    pub variables: Vec<String>,
}

impl RowMapper for Optional {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let rows = run_nested(&mut self.inner, row.clone(), ctx)?;
        if rows.is_empty() {
            let mut r = row;
            for var in &self.variables {
                r.bind(var.clone(), Value::Null);
            }
            out.push_back(r);
        } else {
            out.extend(rows);
        }
        Ok(())
    }
}

pub(crate) struct BindPath {
    pub variable: String,
    pub start: String,
    pub steps: Vec<(String, String)>,
}

impl RowMapper for BindPath {
    fn map(&mut self, mut row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let path = self.build(&row, ctx)?;
        row.bind(self.variable.clone(), path.map(Value::Path).unwrap_or(Value::Null));
        out.push_back(row);
        Ok(())
    }
}

impl BindPath {
    fn build(&self, row: &Record, ctx: &ExecContext) -> ExecutionResult<Option<Path>> {
        let Some(start) = entity_or_null(bound(row, &self.start)?)? else {
            return Ok(None);
        };
        let view = ctx.view();
        let mut path = Path::single(start);
        for (rel_var, node_var) in &self.steps {
            let rel_value = bound(row, rel_var)?;
            if rel_value.is_null() {
                return Ok(None);
            }
            // keep the hop order of a variable-length binding
            let ordered: Vec<RelationshipId> = match rel_value {
                Value::List(items) => items.iter().filter_map(Value::relationship_id).collect(),
                other => other.relationship_id().into_iter().collect(),
            };
            for rid in ordered {
                let Some(rel) = view.relationship(rid) else {
                    return Ok(None);
                };
                let next = rel.other_end(path.end());
                path.push(rid, next);
            }
            match entity_or_null(bound(row, node_var)?)? {
                Some(end) if end == path.end() => {}
                _ => return Ok(None),
            }
        }
        Ok(Some(path))
    }
}

// ---- relational operators ----

pub(crate) struct Filter {
    pub predicate: Expr,
}

impl RowMapper for Filter {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        if is_true(&evaluate(&self.predicate, &row, ctx)?)? {
            out.push_back(row);
        }
        Ok(())
    }
}

pub(crate) struct Project {
    pub items: Vec<(String, Expr)>,
    pub keep_existing: bool,
}

impl RowMapper for Project {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let mut projected = if self.keep_existing { row.clone() } else { Record::new() };
        for (name, expr) in &self.items {
            projected.bind(name.clone(), evaluate(expr, &row, ctx)?);
        }
        out.push_back(projected);
        Ok(())
    }
}

pub(crate) struct Unwind {
    pub expr: Expr,
    pub variable: String,
}

impl RowMapper for Unwind {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let items = match evaluate(&self.expr, &row, ctx)? {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            single => vec![single],
        };
        for item in items {
            let mut r = row.clone();
            r.bind(self.variable.clone(), item);
            out.push_back(r);
        }
        Ok(())
    }
}

/// Drops rows equal to one already produced
pub struct DistinctOperator {
    input: OperatorBox,
    seen: FxHashSet<Vec<Value>>,
}

impl DistinctOperator {
    pub fn new(input: OperatorBox) -> Self {
        DistinctOperator {
            input,
            seen: FxHashSet::default(),
        }
    }
}

impl PhysicalOperator for DistinctOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        while let Some(row) = self.input.next(ctx)? {
            if self.seen.insert(row.values().cloned().collect()) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.seen.clear();
    }
}

/// Groups the whole input, then yields one row per group in first-seen order
pub struct AggregateOperator {
    input: OperatorBox,
    keys: Vec<(String, Expr)>,
    aggregates: Vec<(String, AggregateCall)>,
    output: Option<VecDeque<Record>>,
}

impl AggregateOperator {
    pub fn new(input: OperatorBox, keys: Vec<(String, Expr)>, aggregates: Vec<(String, AggregateCall)>) -> Self {
        AggregateOperator {
            input,
            keys,
            aggregates,
            output: None,
        }
    }

    fn accumulators(&self) -> Vec<Accumulator> {
        self.aggregates.iter().map(|(_, call)| Accumulator::new(call)).collect()
    }

    fn consume(&mut self, ctx: &mut ExecContext) -> ExecutionResult<VecDeque<Record>> {
        let mut groups: IndexMap<Vec<Value>, Vec<Accumulator>> = IndexMap::new();
        while let Some(row) = self.input.next(ctx)? {
            let mut key = Vec::with_capacity(self.keys.len());
            for (_, expr) in &self.keys {
                key.push(evaluate(expr, &row, ctx)?);
            }
            if !groups.contains_key(&key) {
                let fresh = self.accumulators();
                groups.insert(key.clone(), fresh);
            }
            let Some(accs) = groups.get_mut(&key) else {
                continue;
            };
            for (acc, (_, call)) in accs.iter_mut().zip(&self.aggregates) {
                let value = match &call.arg {
                    Some(arg) => evaluate(arg, &row, ctx)?,
                    None => Value::Null,
                };
                acc.update(value)?;
            }
        }
        if groups.is_empty() && self.keys.is_empty() {
            groups.insert(Vec::new(), self.accumulators());
        }
        let mut out = VecDeque::with_capacity(groups.len());
        for (key, accs) in groups {
            let mut r = Record::new();
            for ((name, _), value) in self.keys.iter().zip(key) {
                r.bind(name.clone(), value);
            }
            for ((name, _), acc) in self.aggregates.iter().zip(accs) {
                r.bind(name.clone(), acc.finish());
            }
            out.push_back(r);
        }
        Ok(out)
    }
}

impl PhysicalOperator for AggregateOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = self.consume(ctx)?;
            self.output = Some(rows);
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }
}

/// Non-negative row count from a SKIP or LIMIT expression
fn row_count(expr: &Expr, ctx: &mut ExecContext, clause: &str) -> ExecutionResult<usize> {
    match evaluate(expr, &Record::new(), ctx)? {
        Value::Integer(n) if n >= 0 => Ok(n as usize),
        other => Err(ExecutionError::InvalidArgument(format!(
            "{} expects a non-negative integer, got {}",
            clause,
            other.to_json()
        ))),
    }
}

/// Sorts the whole input; with `top` only the first `skip + limit` rows are kept
pub struct OrderByOperator {
    input: OperatorBox,
    keys: Vec<SortKey>,
    top: Option<(Option<Expr>, Expr)>,
    output: Option<VecDeque<Record>>,
}

impl OrderByOperator {
    pub fn new(input: OperatorBox, keys: Vec<SortKey>, top: Option<(Option<Expr>, Expr)>) -> Self {
        OrderByOperator {
            input,
            keys,
            top,
            output: None,
        }
    }

    fn sort(&self, rows: &mut [(Vec<Value>, usize, Record)]) {
        rows.sort_by(|(a, ai, _), (b, bi, _)| {
            for (key, (x, y)) in self.keys.iter().zip(a.iter().zip(b)) {
                let ord = x.order_cmp(y);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            ai.cmp(bi)
        });
    }

    fn consume(&mut self, ctx: &mut ExecContext) -> ExecutionResult<VecDeque<Record>> {
        let keep = match &self.top {
            Some((skip, limit)) => {
                let skip = match skip {
                    Some(s) => row_count(s, ctx, "SKIP")?,
                    None => 0,
                };
                Some(skip.saturating_add(row_count(limit, ctx, "LIMIT")?))
            }
            None => None,
        };
        let mut rows = Vec::new();
        let mut seq = 0usize;
        while let Some(row) = self.input.next(ctx)? {
            let mut sort_key = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                sort_key.push(evaluate(&key.expr, &row, ctx)?);
            }
            rows.push((sort_key, seq, row));
            seq += 1;
            if let Some(n) = keep {
                if rows.len() > n.saturating_mul(2).max(64) {
                    self.sort(&mut rows);
                    rows.truncate(n);
                }
            }
        }
        self.sort(&mut rows);
        if let Some(n) = keep {
            rows.truncate(n);
        }
        Ok(rows.into_iter().map(|(_, _, r)| r).collect())
    }
}

impl PhysicalOperator for OrderByOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = self.consume(ctx)?;
            self.output = Some(rows);
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }
}

pub struct SkipOperator {
    input: OperatorBox,
    count: Expr,
    skipped: bool,
}

impl SkipOperator {
    pub fn new(input: OperatorBox, count: Expr) -> Self {
        SkipOperator {
            input,
            count,
            skipped: false,
        }
    }
}

impl PhysicalOperator for SkipOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        if !self.skipped {
            self.skipped = true;
            let n = row_count(&self.count, ctx, "SKIP")?;
            for _ in 0..n {
                if self.input.next(ctx)?.is_none() {
                    return Ok(None);
                }
            }
        }
        self.input.next(ctx)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.skipped = false;
    }
}

/// Stops pulling from its input once `count` rows were produced
pub struct LimitOperator {
    input: OperatorBox,
    count: Expr,
    remaining: Option<usize>,
}

impl LimitOperator {
    pub fn new(input: OperatorBox, count: Expr) -> Self {
        LimitOperator {
            input,
            count,
            remaining: None,
        }
    }
}

impl PhysicalOperator for LimitOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        let remaining = match self.remaining {
            Some(n) => n,
            None => row_count(&self.count, ctx, "LIMIT")?,
        };
        if remaining == 0 {
            self.remaining = Some(0);
            return Ok(None);
        }
        let row = self.input.next(ctx)?;
        self.remaining = Some(if row.is_some() { remaining - 1 } else { 0 });
        Ok(row)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.remaining = None;
    }
}

/// Left input to exhaustion, then right
pub struct UnionOperator {
    left: OperatorBox,
    right: OperatorBox,
    on_right: bool,
}

impl UnionOperator {
    pub fn new(left: OperatorBox, right: OperatorBox) -> Self {
        UnionOperator {
            left,
            right,
            on_right: false,
        }
    }
}

impl PhysicalOperator for UnionOperator {
    fn next(&mut self, ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
        if !self.on_right {
            if let Some(row) = self.left.next(ctx)? {
                return Ok(Some(row));
            }
            self.on_right = true;
        }
        self.right.next(ctx)
    }

    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.on_right = false;
    }
}

pub(crate) struct CallSubquery {
    pub subquery: OperatorBox,
    pub yields: Vec<(String, String)>,
}

impl RowMapper for CallSubquery {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let results = run_nested(&mut self.subquery, row.clone(), ctx)?;
        if self.yields.is_empty() {
            out.push_back(row);
            return Ok(());
        }
        for result in results {
            let mut r = row.clone();
            for (inner, outer) in &self.yields {
                r.bind(outer.clone(), result.get(inner).cloned().unwrap_or(Value::Null));
            }
            out.push_back(r);
        }
        Ok(())
    }
}

// ---- writes ----

/// Create the unbound parts of `pattern`, binding their variables in `row`
fn create_pattern(pattern: &PathPattern, row: &mut Record, ctx: &mut ExecContext) -> ExecutionResult<()> {
    let start = create_node(&pattern.start, row, ctx)?;
    let mut path = Path::single(start);
    let mut previous = start;
    for seg in &pattern.segments {
        let next = create_node(&seg.node, row, ctx)?;
        let rel = &seg.relationship;
        let (source, target) = match rel.direction {
            Direction::Incoming => (next, previous),
            Direction::Outgoing | Direction::Both => (previous, next),
        };
        let rel_type = rel
            .types
            .first()
            .cloned()
            .ok_or_else(|| ExecutionError::InvalidArgument("A created relationship needs a type".to_string()))?;
        let properties = evaluate_properties(&rel.properties, row, ctx)?;
        let id = ctx.ids.relationship();
        stage(
            ctx,
            Operation::CreateRelationship(Relationship::with_properties(id, source, target, rel_type, properties)),
        )?;
        if let Some(var) = &rel.variable {
            row.bind(var.clone(), Value::RelationshipRef(id));
        }
        path.push(id, next);
        previous = next;
    }
    if let Some(var) = &pattern.variable {
        row.bind(var.clone(), Value::Path(path));
    }
    Ok(())
}

fn create_node(
    node: &crate::query::ast::NodePattern,
    row: &mut Record,
    ctx: &mut ExecContext,
) -> ExecutionResult<EntityId> {
    if let Some(var) = &node.variable {
        if let Some(existing) = row.get(var) {
            return entity_or_null(existing)?.ok_or_else(|| {
                ExecutionError::InvalidArgument(format!(
                    "Cannot create a relationship to `{}`, which is null",
                    var.trim_start()
                ))
            });
        }
    }
    let properties = evaluate_properties(&node.properties, row, ctx)?;
    let id = ctx.ids.entity();
    stage(
        ctx,
        Operation::CreateEntity(Entity::with_properties(id, node.labels.clone(), properties)),
    )?;
    if let Some(var) = &node.variable {
        row.bind(var.clone(), Value::EntityRef(id));
    }
    Ok(id)
}

fn evaluate_properties(props: &[(String, Expr)], row: &Record, ctx: &mut ExecContext) -> ExecutionResult<PropertyMap> {
    let mut out = PropertyMap::new();
    for (key, expr) in props {
        let value = evaluate(expr, row, ctx)?;
        if !value.is_null() {
            out.insert(key.clone(), to_property(&value, key)?);
        }
    }
    Ok(out)
}

pub(crate) struct Create {
    pub patterns: Vec<PathPattern>,
}

impl RowMapper for Create {
    fn map(&mut self, mut row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        for pattern in &self.patterns {
            create_pattern(pattern, &mut row, ctx)?;
        }
        out.push_back(row);
        Ok(())
    }
}

pub(crate) struct Merge {
    pub pattern: PathPattern,
    pub matcher: OperatorBox,
    pub on_create: Vec<SetItem>,
    pub on_match: Vec<SetItem>,
}

impl RowMapper for Merge {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let matches = run_nested(&mut self.matcher, row.clone(), ctx)?;
        if matches.is_empty() {
            let mut created = row;
            create_pattern(&self.pattern, &mut created, ctx)?;
            apply_set_items(&self.on_create, &created, ctx)?;
            out.push_back(created);
        } else {
            for matched in matches {
                apply_set_items(&self.on_match, &matched, ctx)?;
                out.push_back(matched);
            }
        }
        Ok(())
    }
}

pub(crate) struct Delete {
    pub exprs: Vec<Expr>,
    pub detach: bool,
}

impl Delete {
    fn delete(&self, value: Value, ctx: &mut ExecContext) -> ExecutionResult<()> {
        match value {
            Value::Null => Ok(()),
            Value::List(items) => {
                for item in items {
                    self.delete(item, ctx)?;
                }
                Ok(())
            }
            Value::Path(path) => {
                for rid in path.relationships {
                    self.delete(Value::RelationshipRef(rid), ctx)?;
                }
                for id in path.entities {
                    self.delete(Value::EntityRef(id), ctx)?;
                }
                Ok(())
            }
            other => {
                if let Some(id) = other.entity_id() {
                    // an earlier row may already have removed it
                    if ctx.view().contains_entity(id) {
                        stage(ctx, Operation::DeleteEntity { id, detach: self.detach })?;
                    }
                    Ok(())
                } else if let Some(id) = other.relationship_id() {
                    if ctx.view().relationship(id).is_some() {
                        stage(ctx, Operation::DeleteRelationship { id })?;
                    }
                    Ok(())
                } else {
                    Err(ExecutionError::TypeError(format!(
                        "DELETE expects nodes, relationships or paths, got {}",
                        other.type_name()
                    )))
                }
            }
        }
    }
}

impl RowMapper for Delete {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        for expr in &self.exprs {
            let value = evaluate(expr, &row, ctx)?;
            self.delete(value, ctx)?;
        }
        out.push_back(row);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Target {
    Entity(EntityId),
    Relationship(RelationshipId),
}

fn target_of(row: &Record, variable: &str) -> ExecutionResult<Option<Target>> {
    let value = bound(row, variable)?;
    if value.is_null() {
        return Ok(None);
    }
    if let Some(id) = value.entity_id() {
        return Ok(Some(Target::Entity(id)));
    }
    match relationship_or_null(value)? {
        Some(id) => Ok(Some(Target::Relationship(id))),
        None => Ok(None),
    }
}

fn current_properties(target: Target, ctx: &ExecContext) -> PropertyMap {
    let view = ctx.view();
    match target {
        Target::Entity(id) => view.entity(id).map(|e| e.properties.clone()),
        Target::Relationship(id) => view.relationship(id).map(|r| r.properties.clone()),
    }
    .unwrap_or_default()
}

fn set_property(target: Target, key: &str, value: &Value, ctx: &mut ExecContext) -> ExecutionResult<()> {
    let key = key.to_string();
    let op = if value.is_null() {
        if !current_properties(target, ctx).contains_key(&key) {
            return Ok(());
        }
        match target {
            Target::Entity(id) => Operation::RemoveEntityProperty { id, key },
            Target::Relationship(id) => Operation::RemoveRelationshipProperty { id, key },
        }
    } else {
        let value = to_property(value, &key)?;
        match target {
            Target::Entity(id) => Operation::SetEntityProperty { id, key, value },
            Target::Relationship(id) => Operation::SetRelationshipProperty { id, key, value },
        }
    };
    stage(ctx, op)
}

/// Property map of a SET `=`/`+=` right-hand side
fn map_argument(value: Value, ctx: &ExecContext) -> ExecutionResult<Vec<(String, Value)>> {
    let view = ctx.view();
    let props = match &value {
        Value::Map(map) => return Ok(map.clone().into_iter().collect()),
        Value::Null => return Ok(Vec::new()),
        other => match (other.entity_id(), other.relationship_id()) {
            (Some(id), _) => view.entity(id).map(|e| e.properties.clone()),
            (_, Some(id)) => view.relationship(id).map(|r| r.properties.clone()),
            _ => {
                return Err(ExecutionError::TypeError(format!(
                    "SET expects a map, got {}",
                    other.type_name()
                )))
            }
        },
    };
    Ok(props
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect())
}

fn apply_set_items(items: &[SetItem], row: &Record, ctx: &mut ExecContext) -> ExecutionResult<()> {
    for item in items {
        match item {
            SetItem::Property { variable, key, value } => {
                let Some(target) = target_of(row, variable)? else {
                    continue;
                };
                let value = evaluate(value, row, ctx)?;
                set_property(target, key, &value, ctx)?;
            }
            SetItem::Replace { variable, value } | SetItem::MergeMap { variable, value } => {
                let Some(target) = target_of(row, variable)? else {
                    continue;
                };
                let value = evaluate(value, row, ctx)?;
                let entries = map_argument(value, ctx)?;
                if matches!(item, SetItem::Replace { .. }) {
                    let keep: FxHashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
                    for key in current_properties(target, ctx).into_keys() {
                        if !keep.contains(key.as_str()) {
                            set_property(target, &key, &Value::Null, ctx)?;
                        }
                    }
                }
                for (key, value) in &entries {
                    set_property(target, key, value, ctx)?;
                }
            }
            SetItem::Labels { variable, labels } => {
                let Some(id) = entity_or_null(bound(row, variable)?)? else {
                    continue;
                };
                for label in labels {
                    let present = ctx.view().entity(id).map(|e| e.has_label(label)).unwrap_or(false);
                    if !present {
                        stage(ctx, Operation::AddLabel { id, label: label.clone() })?;
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) struct SetProperties {
    pub items: Vec<SetItem>,
}

impl RowMapper for SetProperties {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        apply_set_items(&self.items, &row, ctx)?;
        out.push_back(row);
        Ok(())
    }
}

pub(crate) struct Remove {
    pub items: Vec<RemoveItem>,
}

impl RowMapper for Remove {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        for item in &self.items {
            match item {
                RemoveItem::Property { variable, key } => {
                    if let Some(target) = target_of(&row, variable)? {
                        set_property(target, key, &Value::Null, ctx)?;
                    }
                }
                RemoveItem::Labels { variable, labels } => {
                    let Some(id) = entity_or_null(bound(&row, variable)?)? else {
                        continue;
                    };
                    for label in labels {
                        let present = ctx.view().entity(id).map(|e| e.has_label(label)).unwrap_or(false);
                        if present {
                            stage(ctx, Operation::RemoveLabel { id, label: label.clone() })?;
                        }
                    }
                }
            }
        }
        out.push_back(row);
        Ok(())
    }
}

pub(crate) struct Foreach {
    pub variable: String,
    pub list: Expr,
    pub body: OperatorBox,
}

impl RowMapper for Foreach {
    fn map(&mut self, row: Record, ctx: &mut ExecContext, out: &mut VecDeque<Record>) -> ExecutionResult<()> {
        let items = match evaluate(&self.list, &row, ctx)? {
            Value::Null => Vec::new(),
            Value::List(items) => items,
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "FOREACH expects a list, got {}",
                    other.type_name()
                )))
            }
        };
        for item in items {
            let mut inner = row.clone();
            inner.bind(self.variable.clone(), item);
            run_nested(&mut self.body, inner, ctx)?;
        }
        out.push_back(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::query::ast::BinaryOp;
    use crate::transaction::{IdAllocator, IsolationLevel, Transaction, TransactionError, TxId, TxStatus};
    use regex::Regex;
    use rustc_hash::FxHashMap;
    use std::time::Duration;

    /// Fixed rows, standing in for a scan
    struct Rows {
        rows: Vec<Record>,
        pos: usize,
    }

    impl PhysicalOperator for Rows {
        fn next(&mut self, _ctx: &mut ExecContext) -> ExecutionResult<Option<Record>> {
            let row = self.rows.get(self.pos).cloned();
            self.pos += 1;
            Ok(row)
        }

        fn reset(&mut self) {
            self.pos = 0;
        }
    }

    fn rows(variable: &str, values: impl IntoIterator<Item = Value>) -> OperatorBox {
        let rows = values
            .into_iter()
            .map(|v| {
                let mut r = Record::new();
                r.bind(variable, v);
                r
            })
            .collect();
        Box::new(Rows { rows, pos: 0 })
    }

    fn ints(variable: &str, values: impl IntoIterator<Item = i64>) -> OperatorBox {
        rows(variable, values.into_iter().map(Value::Integer))
    }

    fn lit(n: i64) -> Expr {
        Expr::Literal(n.into())
    }

    fn run_in(mut op: OperatorBox, graph: &GraphStore, tx: &mut Transaction) -> ExecutionResult<Vec<Record>> {
        let ids = IdAllocator::new(100, 100);
        let params = PropertyMap::new();
        let mut regexes: FxHashMap<String, Regex> = FxHashMap::default();
        let mut ctx = ExecContext::new(graph, tx, &ids, &params, &mut regexes);
        let mut out = Vec::new();
        while let Some(row) = op.next(&mut ctx)? {
            out.push(row);
        }
        Ok(out)
    }

    fn run(op: OperatorBox, graph: &GraphStore) -> Vec<Record> {
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        run_in(op, graph, &mut tx).unwrap()
    }

    fn column(rows: &[Record], variable: &str) -> Vec<Value> {
        rows.iter().map(|r| r.get(variable).cloned().unwrap_or(Value::Null)).collect()
    }

    #[test]
    fn test_top_n_order_by_with_skip() {
        let graph = GraphStore::new();
        // every value in 1..=100 once, out of order
        let input = ints("x", (0..100).map(|i| (i * 37) % 100 + 1));
        let keys = vec![SortKey {
            expr: Expr::variable("x"),
            descending: true,
        }];
        let sorted = OrderByOperator::new(input, keys, Some((Some(lit(2)), lit(3))));
        let skipped = SkipOperator::new(Box::new(sorted), lit(2));
        let limited = LimitOperator::new(Box::new(skipped), lit(3));

        let out = run(Box::new(limited), &graph);
        assert_eq!(column(&out, "x"), vec![Value::Integer(98), Value::Integer(97), Value::Integer(96)]);
    }

    #[test]
    fn test_order_by_keeps_input_order_for_ties() {
        let graph = GraphStore::new();
        let mut input = Vec::new();
        for (k, tag) in [(2, "a"), (1, "b"), (2, "c"), (1, "d")] {
            let mut r = Record::new();
            r.bind("k", Value::Integer(k));
            r.bind("tag", tag.into());
            input.push(r);
        }
        let keys = vec![SortKey {
            expr: Expr::variable("k"),
            descending: false,
        }];
        let sorted = OrderByOperator::new(Box::new(Rows { rows: input, pos: 0 }), keys, None);
        let out = run(Box::new(sorted), &graph);
        assert_eq!(column(&out, "tag"), vec!["b".into(), "d".into(), "a".into(), "c".into()]);
    }

    #[test]
    fn test_negative_limit_is_rejected() {
        let graph = GraphStore::new();
        let limited = LimitOperator::new(ints("x", [1, 2]), lit(-1));
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        let err = run_in(Box::new(limited), &graph, &mut tx).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidArgument(_)));
    }

    #[test]
    fn test_union_keeps_duplicates_and_distinct_drops_them() {
        let graph = GraphStore::new();
        let union = || Box::new(UnionOperator::new(ints("x", [1, 2]), ints("x", [2, 3]))) as OperatorBox;

        let all = run(union(), &graph);
        assert_eq!(
            column(&all, "x"),
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(2), Value::Integer(3)]
        );

        let distinct = run(Box::new(DistinctOperator::new(union())), &graph);
        assert_eq!(column(&distinct, "x"), vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    }

    #[test]
    fn test_optional_expand_binds_null_when_nothing_matches() {
        let mut graph = GraphStore::new();
        let alice = graph.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        let bob = graph.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        let loner = graph.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        let knows = graph.add_relationship(alice, bob, "KNOWS", PropertyMap::new()).unwrap();

        let spec = ExpandSpec {
            from: "n".to_string(),
            rel_variable: "r".to_string(),
            to: "m".to_string(),
            to_bound: false,
            types: vec!["KNOWS".into()],
            direction: Direction::Outgoing,
            to_labels: Vec::new(),
            rel_properties: Vec::new(),
            length: None,
            exclude: Vec::new(),
        };
        let input = || rows("n", [Value::EntityRef(alice), Value::EntityRef(loner)]);

        let out = run(
            PerRow::boxed(
                input(),
                OptionalExpand {
                    spec: spec.clone(),
                    filter: None,
                },
            ),
            &graph,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("r"), Some(&Value::RelationshipRef(knows)));
        assert_eq!(out[0].get("m"), Some(&Value::EntityRef(bob)));
        assert_eq!(out[1].get("n"), Some(&Value::EntityRef(loner)));
        assert_eq!(out[1].get("r"), Some(&Value::Null));
        assert_eq!(out[1].get("m"), Some(&Value::Null));

        // a rejected match counts as no match
        let never = Expr::Literal(false.into());
        let out = run(
            PerRow::boxed(
                input(),
                OptionalExpand {
                    spec,
                    filter: Some(never),
                },
            ),
            &graph,
        );
        assert_eq!(column(&out, "m"), vec![Value::Null, Value::Null]);
    }

    #[test]
    fn test_optional_binds_every_inner_variable_to_null() {
        let graph = GraphStore::new();
        let inner = PerRow::boxed(
            Box::new(ArgumentOperator::new()),
            Filter {
                predicate: Expr::Binary(BinaryOp::Gt, Box::new(Expr::variable("x")), Box::new(lit(1))),
            },
        );
        let inner = PerRow::boxed(
            inner,
            Project {
                items: vec![("y".to_string(), Expr::variable("x"))],
                keep_existing: true,
            },
        );
        let op = PerRow::boxed(
            ints("x", [1, 2]),
            Optional {
                inner,
                variables: vec!["y".to_string()],
            },
        );
        let out = run(op, &graph);
        assert_eq!(column(&out, "x"), vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(column(&out, "y"), vec![Value::Null, Value::Integer(2)]);
    }

    #[test]
    fn test_call_subquery_sees_the_outer_row() {
        let graph = GraphStore::new();
        let doubled = PerRow::boxed(
            Box::new(ArgumentOperator::new()),
            Project {
                items: vec![(
                    "doubled".to_string(),
                    Expr::Binary(BinaryOp::Mul, Box::new(Expr::variable("x")), Box::new(lit(2))),
                )],
                keep_existing: false,
            },
        );
        let op = PerRow::boxed(
            ints("x", [1, 5]),
            CallSubquery {
                subquery: doubled,
                yields: vec![("doubled".to_string(), "d".to_string())],
            },
        );
        let out = run(op, &graph);
        assert_eq!(column(&out, "x"), vec![Value::Integer(1), Value::Integer(5)]);
        assert_eq!(column(&out, "d"), vec![Value::Integer(2), Value::Integer(10)]);
        // nothing from inside the subquery leaks except what it yields
        assert!(out.iter().all(|r| r.get("doubled").is_none()));
    }

    #[test]
    fn test_unit_subquery_passes_each_outer_row_once() {
        let graph = GraphStore::new();
        let fan_out = PerRow::boxed(
            Box::new(ArgumentOperator::new()),
            Unwind {
                expr: Expr::List(vec![lit(1), lit(2), lit(3)]),
                variable: "i".to_string(),
            },
        );
        let op = PerRow::boxed(
            ints("x", [7, 8]),
            CallSubquery {
                subquery: fan_out,
                yields: Vec::new(),
            },
        );
        let out = run(op, &graph);
        assert_eq!(column(&out, "x"), vec![Value::Integer(7), Value::Integer(8)]);
        assert!(out.iter().all(|r| r.get("i").is_none()));
    }

    #[test]
    fn test_scan_stops_once_the_deadline_passes() {
        let mut graph = GraphStore::new();
        for _ in 0..10 {
            graph.add_entity(vec![Label::new("T")], PropertyMap::new()).unwrap();
        }
        let mut tx = Transaction::new(
            TxId(9),
            IsolationLevel::ReadCommitted,
            0,
            Some(Duration::from_millis(1)),
        );
        std::thread::sleep(Duration::from_millis(5));
        let scan = ScanOperator::new(Box::new(ArgumentOperator::new()), "t".to_string(), Some(Label::new("T")));
        let err = run_in(Box::new(scan), &graph, &mut tx).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Transaction(TransactionError::Timeout(TxId(9)))
        ));
        assert_eq!(tx.status(), TxStatus::Aborted);
    }
}
