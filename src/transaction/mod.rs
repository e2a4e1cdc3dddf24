//! Transactions
//!
//! A [`Transaction`] never touches the committed store. It stages
//! [`Operation`]s into a [`Delta`] overlay, records what it read, and hands
//! everything to the [`TransactionManager`] at commit:
//! - Isolation levels decide which conflicts abort the commit
//! - Savepoints roll the staged list back partially
//! - Every committed operation is appended to the CID-linked [`Wal`] first

pub mod delta;
pub mod manager;
pub mod wal;

pub use delta::{Delta, TxView};
pub use manager::{CommitInfo, IdAllocator, RecoveryReport, TransactionManager};
pub use wal::{Wal, WalEntry, WalError, WalRecord, WalResult, WalVerification, WAL_HEAD};

use crate::graph::{Direction, EntityId, GraphError, GraphStore, GraphView, Operation, RecordId};
use crate::index::ConstraintError;
use crate::storage::StorageError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    pub fn new(id: u64) -> Self {
        TxId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Active,
    Preparing,
    Committed,
    Aborted,
}

/// Transaction errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {tx} conflicts with {with} on {record}")]
    Conflict { tx: TxId, with: TxId, record: RecordId },

    #[error("Transaction {0} timed out")]
    Timeout(TxId),

    #[error("Transaction {tx} is {status:?}, expected Active")]
    NotActive { tx: TxId, status: TxStatus },

    #[error("Savepoint '{0}' not found")]
    SavepointNotFound(String),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Graph(GraphError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<GraphError> for TransactionError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Constraint(c) => TransactionError::Constraint(c),
            GraphError::Storage(s) => TransactionError::Storage(s),
            other => TransactionError::Graph(other),
        }
    }
}

impl TransactionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Conflict { .. } | TransactionError::Timeout(_) => true,
            TransactionError::Storage(e) => e.is_retryable(),
            TransactionError::Wal(WalError::Storage(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Debug, Clone)]
struct Savepoint {
    name: String,
    operations: usize,
    delta: Delta,
    write_set: FxHashSet<RecordId>,
}

/// An open transaction
#[derive(Debug)]
pub struct Transaction {
    id: TxId,
    isolation: IsolationLevel,
    status: TxStatus,
    /// Commit sequence visible when the transaction began
    snapshot: u64,
    operations: Vec<Operation>,
    delta: Delta,
    read_set: FxHashSet<RecordId>,
    write_set: FxHashSet<RecordId>,
    savepoints: Vec<Savepoint>,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl Transaction {
    pub(crate) fn new(id: TxId, isolation: IsolationLevel, snapshot: u64, timeout: Option<Duration>) -> Self {
        let started_at = Instant::now();
        Transaction {
            id,
            isolation,
            status: TxStatus::Active,
            snapshot,
            operations: Vec::new(),
            delta: Delta::default(),
            read_set: FxHashSet::default(),
            write_set: FxHashSet::default(),
            savepoints: Vec::new(),
            started_at,
            deadline: timeout.map(|t| started_at + t),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == TxStatus::Active
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn read_set(&self) -> &FxHashSet<RecordId> {
        &self.read_set
    }

    pub fn write_set(&self) -> &FxHashSet<RecordId> {
        &self.write_set
    }

    pub fn delta(&self) -> &Delta {
        &self.delta
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The committed store as this transaction sees it
    pub fn view<'a>(&'a self, base: &'a GraphStore) -> TxView<'a> {
        TxView::new(base, &self.delta)
    }

    pub(crate) fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    /// Fails once the transaction is no longer active or its deadline passed;
    /// an expired transaction is marked aborted
    pub fn ensure_active(&mut self) -> TransactionResult<()> {
        if self.status != TxStatus::Active {
            return Err(TransactionError::NotActive {
                tx: self.id,
                status: self.status,
            });
        }
        if self.deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            self.abort();
            return Err(TransactionError::Timeout(self.id));
        }
        Ok(())
    }

    pub fn add_read(&mut self, record: RecordId) -> TransactionResult<()> {
        self.ensure_active()?;
        self.read_set.insert(record);
        Ok(())
    }

    /// Validate `op` against `base` plus the pending writes and queue it
    ///
    /// A detaching entity delete first stages a delete for every visible
    /// relationship of that entity.
    pub fn add_operation(&mut self, op: Operation, base: &GraphStore) -> TransactionResult<()> {
        self.ensure_active()?;
        if let Operation::DeleteEntity { id, detach: true } = &op {
            self.detach_relationships(*id, base)?;
        }
        self.delta.stage(&op, base)?;
        debug!("{} staged {} on {}", self.id, op.name(), op.target());
        self.write_set.insert(op.target());
        self.operations.push(op);
        Ok(())
    }

    fn detach_relationships(&mut self, id: EntityId, base: &GraphStore) -> TransactionResult<()> {
        let attached = self.view(base).relationship_ids_of(id, Direction::Both);
        for rid in attached {
            let op = Operation::DeleteRelationship { id: rid };
            self.delta.stage(&op, base)?;
            self.write_set.insert(op.target());
            self.operations.push(op);
        }
        Ok(())
    }

    /// Remember the current staged state under `name`; names may repeat
    pub fn savepoint(&mut self, name: impl Into<String>) -> TransactionResult<()> {
        self.ensure_active()?;
        self.savepoints.push(Savepoint {
            name: name.into(),
            operations: self.operations.len(),
            delta: self.delta.clone(),
            write_set: self.write_set.clone(),
        });
        Ok(())
    }

    /// Discard everything staged since the most recent savepoint called
    /// `name`; the savepoint itself stays usable
    pub fn rollback_to_savepoint(&mut self, name: &str) -> TransactionResult<()> {
        self.ensure_active()?;
        let pos = self
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))?;
        self.savepoints.truncate(pos + 1);
        let sp = &self.savepoints[pos];
        self.operations.truncate(sp.operations);
        self.delta = sp.delta.clone();
        self.write_set = sp.write_set.clone();
        debug!("{} rolled back to savepoint '{}'", self.id, name);
        Ok(())
    }

    /// Forget the savepoint `name` and every later one, keeping their writes
    pub fn release_savepoint(&mut self, name: &str) -> TransactionResult<()> {
        self.ensure_active()?;
        let pos = self
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    pub fn savepoint_names(&self) -> Vec<&str> {
        self.savepoints.iter().map(|s| s.name.as_str()).collect()
    }

    /// Drop staged state and mark the transaction aborted
    pub(crate) fn abort(&mut self) {
        self.status = TxStatus::Aborted;
        self.operations.clear();
        self.delta.clear();
        self.savepoints.clear();
    }

    pub(crate) fn finish_commit(&mut self) {
        self.status = TxStatus::Committed;
        self.delta.clear();
        self.savepoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Entity, Label, PropertyMap};
    use crate::index::{Constraint, ConstraintKind};

    fn store() -> (GraphStore, EntityId) {
        let mut store = GraphStore::new();
        let mut props = PropertyMap::new();
        props.insert("email".to_string(), "a@x".into());
        let a = store.add_entity(vec![Label::new("Person")], props).unwrap();
        store
            .add_constraint(Constraint::new("Person", ConstraintKind::Unique("email".into())))
            .unwrap();
        (store, a)
    }

    fn set(id: EntityId, key: &str, value: &str) -> Operation {
        Operation::SetEntityProperty {
            id,
            key: key.to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn test_staging_tracks_write_set() {
        let (store, a) = store();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::Serializable, 0, None);
        tx.add_operation(set(a, "name", "Alice"), &store).unwrap();
        assert_eq!(tx.operations().len(), 1);
        assert!(tx.write_set().contains(&RecordId::Entity(a)));
        assert_eq!(
            tx.view(&store).entity(a).unwrap().get_property("name"),
            Some(&"Alice".into())
        );
        assert!(store.get_entity(a).unwrap().get_property("name").is_none());
    }

    #[test]
    fn test_constraint_checked_at_staging() {
        let (store, _) = store();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        let mut dup = Entity::new(EntityId::new(10), "Person");
        dup.set_property("email", "a@x");
        let err = tx.add_operation(Operation::CreateEntity(dup), &store).unwrap_err();
        assert!(matches!(err, TransactionError::Constraint(_)));
        assert!(tx.operations().is_empty());
    }

    #[test]
    fn test_savepoints() {
        let (store, a) = store();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        tx.add_operation(set(a, "name", "A"), &store).unwrap();
        tx.savepoint("s1").unwrap();
        tx.add_operation(set(a, "name", "B"), &store).unwrap();
        tx.savepoint("s2").unwrap();
        tx.add_operation(set(a, "city", "Paris"), &store).unwrap();

        tx.rollback_to_savepoint("s1").unwrap();
        assert_eq!(tx.operations().len(), 1);
        assert_eq!(tx.savepoint_names(), vec!["s1"]);
        let view = tx.view(&store);
        assert_eq!(view.entity(a).unwrap().get_property("name"), Some(&"A".into()));
        assert!(view.entity(a).unwrap().get_property("city").is_none());

        tx.release_savepoint("s1").unwrap();
        assert!(matches!(
            tx.rollback_to_savepoint("s1"),
            Err(TransactionError::SavepointNotFound(_))
        ));
    }

    #[test]
    fn test_detach_delete_stages_relationship_deletes() {
        let (mut store, a) = store();
        let b = store.add_entity(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        let r = store.add_relationship(a, b, "KNOWS", PropertyMap::new()).unwrap();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, None);
        tx.add_operation(Operation::DeleteEntity { id: a, detach: true }, &store)
            .unwrap();
        assert_eq!(tx.operations().len(), 2);
        assert!(tx.write_set().contains(&RecordId::Relationship(r)));
        assert!(tx.view(&store).entity(a).is_none());
    }

    #[test]
    fn test_expired_transaction_is_aborted() {
        let (store, a) = store();
        let mut tx = Transaction::new(TxId(1), IsolationLevel::ReadCommitted, 0, Some(Duration::ZERO));
        assert!(matches!(
            tx.add_operation(set(a, "x", "y"), &store),
            Err(TransactionError::Timeout(_))
        ));
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert!(matches!(tx.add_read(RecordId::Entity(a)), Err(TransactionError::NotActive { .. })));
    }
}
