//! Query execution engine using the Volcano iterator model
//!
//! A compiled [`Plan`] is turned into a tree of [`PhysicalOperator`]s and
//! driven by a [`QueryStream`]. Read queries are pulled lazily, one row per
//! `next()`, each pull taking the graph read lock only for its own duration.
//! Write queries are run to completion when the stream is created, so a
//! caller that drops the stream early still gets every write staged.

pub mod aggregate;
pub mod eval;
pub mod operator;
pub mod record;

pub use operator::{OperatorBox, PhysicalOperator};
pub use record::{Record, Value};

use crate::graph::{GraphStore, PropertyMap};
use crate::query::ir::{LogicalOp, Plan};
use crate::transaction::{IdAllocator, Transaction, TransactionError, TransactionManager, TxView};
use operator::*;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Expected parameter: ${0}")]
    MissingParameter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid regular expression '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Transaction(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// State shared by every operator during one pull
pub struct ExecContext<'a> {
    pub graph: &'a GraphStore,
    pub tx: &'a mut Transaction,
    pub ids: &'a IdAllocator,
    pub params: &'a PropertyMap,
    /// Rows nested plans are applied to, innermost last
    pub(crate) arguments: Vec<Record>,
    pub(crate) regexes: &'a mut FxHashMap<String, Regex>,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        graph: &'a GraphStore,
        tx: &'a mut Transaction,
        ids: &'a IdAllocator,
        params: &'a PropertyMap,
        regexes: &'a mut FxHashMap<String, Regex>,
    ) -> Self {
        ExecContext {
            graph,
            tx,
            ids,
            params,
            arguments: Vec::new(),
            regexes,
        }
    }

    /// Committed graph overlaid with the transaction's staged writes
    pub fn view(&self) -> TxView<'_> {
        self.tx.view(self.graph)
    }

    /// Fails once the transaction has timed out, aborting it
    pub fn check_deadline(&mut self) -> ExecutionResult<()> {
        self.tx.ensure_active()?;
        Ok(())
    }
}

/// Build the operator tree for `op`
pub fn build(op: &LogicalOp) -> OperatorBox {
    match op {
        LogicalOp::Argument => Box::new(ArgumentOperator::new()),
        LogicalOp::ScanLabel { input, variable, label } => {
            Box::new(ScanOperator::new(build(input), variable.clone(), label.clone()))
        }
        LogicalOp::IndexSeek {
            input,
            variable,
            label,
            property,
            value,
        } => PerRow::boxed(
            build(input),
            IndexSeek {
                variable: variable.clone(),
                label: label.clone(),
                property: property.clone(),
                value: value.clone(),
            },
        ),
        LogicalOp::Expand { input, spec } => PerRow::boxed(build(input), Expand { spec: spec.clone() }),
        LogicalOp::OptionalExpand { input, spec, filter } => PerRow::boxed(
            build(input),
            OptionalExpand {
                spec: spec.clone(),
                filter: filter.clone(),
            },
        ),
        LogicalOp::Optional { input, inner, variables } => PerRow::boxed(
            build(input),
            Optional {
                inner: build(inner),
                variables: variables.clone(),
            },
        ),
        LogicalOp::Filter { input, predicate } => PerRow::boxed(
            build(input),
            Filter {
                predicate: predicate.clone(),
            },
        ),
        LogicalOp::Project {
            input,
            items,
            keep_existing,
        } => PerRow::boxed(
            build(input),
            Project {
                items: items.clone(),
                keep_existing: *keep_existing,
            },
        ),
        LogicalOp::Distinct { input } => Box::new(DistinctOperator::new(build(input))),
        LogicalOp::Aggregate {
            input,
            keys,
            aggregates,
        } => Box::new(AggregateOperator::new(build(input), keys.clone(), aggregates.clone())),
        LogicalOp::OrderBy { input, keys, top } => {
            Box::new(OrderByOperator::new(build(input), keys.clone(), top.clone()))
        }
        LogicalOp::Skip { input, count } => Box::new(SkipOperator::new(build(input), count.clone())),
        LogicalOp::Limit { input, count } => Box::new(LimitOperator::new(build(input), count.clone())),
        LogicalOp::Unwind { input, expr, variable } => PerRow::boxed(
            build(input),
            Unwind {
                expr: expr.clone(),
                variable: variable.clone(),
            },
        ),
        LogicalOp::Create { input, patterns } => PerRow::boxed(
            build(input),
            Create {
                patterns: patterns.clone(),
            },
        ),
        LogicalOp::Merge {
            input,
            pattern,
            matcher,
            on_create,
            on_match,
        } => PerRow::boxed(
            build(input),
            Merge {
                pattern: pattern.clone(),
                matcher: build(matcher),
                on_create: on_create.clone(),
                on_match: on_match.clone(),
            },
        ),
        LogicalOp::Delete { input, exprs, detach } => PerRow::boxed(
            build(input),
            Delete {
                exprs: exprs.clone(),
                detach: *detach,
            },
        ),
        LogicalOp::SetProperty { input, items } => {
            PerRow::boxed(build(input), SetProperties { items: items.clone() })
        }
        LogicalOp::Remove { input, items } => PerRow::boxed(build(input), Remove { items: items.clone() }),
        LogicalOp::Foreach {
            input,
            variable,
            list,
            body,
        } => PerRow::boxed(
            build(input),
            Foreach {
                variable: variable.clone(),
                list: list.clone(),
                body: build(body),
            },
        ),
        LogicalOp::CallSubquery {
            input,
            subquery,
            yields,
        } => PerRow::boxed(
            build(input),
            CallSubquery {
                subquery: build(subquery),
                yields: yields.clone(),
            },
        ),
        LogicalOp::Union { left, right, .. } => Box::new(UnionOperator::new(build(left), build(right))),
        LogicalOp::BindPath {
            input,
            variable,
            start,
            steps,
        } => PerRow::boxed(
            build(input),
            BindPath {
                variable: variable.clone(),
                start: start.clone(),
                steps: steps.clone(),
            },
        ),
    }
}

/// Rows of one query, pulled through an open transaction
///
/// An error from any pull aborts the transaction and ends the stream.
pub struct QueryStream<'a> {
    manager: &'a TransactionManager,
    tx: &'a mut Transaction,
    root: OperatorBox,
    columns: Vec<String>,
    params: PropertyMap,
    regexes: FxHashMap<String, Regex>,
    buffered: Option<VecDeque<Record>>,
    finished: bool,
}

impl<'a> QueryStream<'a> {
    /// Start executing `plan`; write plans run to completion here
    pub fn execute(
        manager: &'a TransactionManager,
        tx: &'a mut Transaction,
        plan: &Plan,
        params: PropertyMap,
    ) -> ExecutionResult<Self> {
        if let Err(e) = tx.ensure_active() {
            manager.abort(tx);
            return Err(e.into());
        }
        let mut stream = QueryStream {
            manager,
            tx,
            root: build(&plan.root),
            columns: plan.columns.clone(),
            params,
            regexes: FxHashMap::default(),
            buffered: None,
            finished: false,
        };
        if plan.is_write {
            let rows = stream.drain()?;
            debug!(
                "{} staged {} operation(s) for a write query",
                stream.tx.id(),
                stream.tx.operations().len()
            );
            stream.buffered = Some(if stream.columns.is_empty() {
                VecDeque::new()
            } else {
                rows.into()
            });
        }
        Ok(stream)
    }

    /// A stream over rows computed elsewhere (EXPLAIN output)
    pub fn from_rows(
        manager: &'a TransactionManager,
        tx: &'a mut Transaction,
        columns: Vec<String>,
        rows: Vec<Record>,
    ) -> Self {
        QueryStream {
            manager,
            tx,
            root: Box::new(ArgumentOperator::new()),
            columns,
            params: PropertyMap::new(),
            regexes: FxHashMap::default(),
            buffered: Some(rows.into()),
            finished: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn fail(&mut self, error: ExecutionError) -> ExecutionError {
        warn!("Query failed in {}: {}", self.tx.id(), error);
        self.finished = true;
        self.manager.abort(self.tx);
        error
    }

    fn pull(&mut self) -> ExecutionResult<Option<Record>> {
        self.tx.ensure_active()?;
        let graph = self.manager.graph();
        let mut ctx = ExecContext::new(&graph, self.tx, self.manager.ids(), &self.params, &mut self.regexes);
        let row = self.root.next(&mut ctx)?;
        Ok(row.map(|r| r.into_materialized(&ctx.view())))
    }

    /// Run the plan to the end; rows are materialised after the last write
    fn drain(&mut self) -> ExecutionResult<Vec<Record>> {
        self.run_to_end().map_err(|e| self.fail(e))
    }

    fn run_to_end(&mut self) -> ExecutionResult<Vec<Record>> {
        let graph = self.manager.graph();
        let mut ctx = ExecContext::new(&graph, self.tx, self.manager.ids(), &self.params, &mut self.regexes);
        let mut rows = Vec::new();
        while let Some(row) = self.root.next(&mut ctx)? {
            ctx.tx.ensure_active()?;
            rows.push(row);
        }
        let view = ctx.view();
        Ok(rows.into_iter().map(|r| r.into_materialized(&view)).collect())
    }

    /// Every remaining row
    pub fn collect_rows(self) -> ExecutionResult<Vec<Record>> {
        self.collect()
    }
}

impl fmt::Debug for QueryStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStream")
            .field("tx", &self.tx.id())
            .field("columns", &self.columns)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> Iterator for QueryStream<'a> {
    type Item = ExecutionResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(rows) = &mut self.buffered {
            let row = rows.pop_front();
            if row.is_none() {
                self.finished = true;
            }
            return row.map(Ok);
        }
        match self.pull() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => Some(Err(self.fail(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{IsolationLevel, TxStatus};
    use crate::GraphDatabase;

    fn xs(rows: &[Record]) -> Vec<Value> {
        rows.iter().filter_map(|r| r.get("x").cloned()).collect()
    }

    #[test]
    fn test_top_n_through_a_compiled_plan() {
        let db = GraphDatabase::in_memory().unwrap();
        let rows = db
            .query("UNWIND range(1, 100) AS x RETURN x ORDER BY x DESC SKIP 2 LIMIT 3")
            .unwrap();
        assert_eq!(xs(&rows), vec![Value::Integer(98), Value::Integer(97), Value::Integer(96)]);
    }

    #[test]
    fn test_read_stream_is_pulled_lazily() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let mut stream = db.execute("UNWIND [1, 2, 3] AS x RETURN x", &mut tx).unwrap();
        assert_eq!(stream.columns().to_vec(), vec!["x".to_string()]);
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.get("x"), Some(&Value::Integer(1)));
        let rest = stream.collect_rows().unwrap();
        assert_eq!(xs(&rest), vec![Value::Integer(2), Value::Integer(3)]);
        assert!(tx.is_active());
    }

    #[test]
    fn test_dropped_write_stream_still_stages_everything() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let stream = db
            .execute("UNWIND [1, 2, 3] AS i CREATE (n:Item {i: i}) RETURN n", &mut tx)
            .unwrap();
        drop(stream);
        assert_eq!(tx.operations().len(), 3);
        db.commit(&mut tx).unwrap();
        assert_eq!(db.statistics().entity_count, 3);
    }

    #[test]
    fn test_error_mid_stream_aborts_and_ends_the_stream() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let mut stream = db
            .execute("UNWIND [1, 0, 2] AS x RETURN 10 % x AS y", &mut tx)
            .unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(tx.status(), TxStatus::Aborted);
    }

    #[test]
    fn test_stream_debug_names_its_transaction() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let id = tx.id();
        let stream = db.execute("RETURN 1 AS one", &mut tx).unwrap();
        let shown = format!("{:?}", stream);
        assert!(shown.contains(&format!("{:?}", id)));
        assert!(shown.contains("one"));
    }
}
