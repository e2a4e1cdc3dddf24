//! Transaction manager
//!
//! Owns the committed [`GraphStore`], the WAL and the commit log. Commits
//! are serialised by the commit-state lock and validated optimistically
//! against every transaction that committed after the committer's snapshot.

use super::wal::{RecoveredAction, SchemaChange, Wal, WalRecord, WalVerification};
use super::{IsolationLevel, Transaction, TransactionError, TransactionResult, TxId, TxStatus};
use crate::config::WalConfig;
use crate::graph::snapshot::{load_snapshot, save_snapshot};
use crate::graph::{EntityId, GraphError, GraphStore, GraphView, IdSource, Operation, RecordId, RelationshipId};
use crate::index::{Constraint, IndexDefinition};
use crate::storage::{Cid, ContentStore};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Id of WAL entries that belong to no transaction
const SYSTEM_TX: TxId = TxId(0);

/// Shared id counters so concurrent transactions never hand out the same id
#[derive(Debug)]
pub struct IdAllocator {
    next_entity: AtomicU64,
    next_relationship: AtomicU64,
}

impl IdAllocator {
    pub fn new(next_entity: u64, next_relationship: u64) -> Self {
        IdAllocator {
            next_entity: AtomicU64::new(next_entity.max(1)),
            next_relationship: AtomicU64::new(next_relationship.max(1)),
        }
    }

    pub fn entity(&self) -> EntityId {
        EntityId::new(self.next_entity.fetch_add(1, Ordering::SeqCst))
    }

    pub fn relationship(&self) -> RelationshipId {
        RelationshipId::new(self.next_relationship.fetch_add(1, Ordering::SeqCst))
    }

    /// Raise the counters to at least the given values
    pub fn reserve(&self, next_entity: u64, next_relationship: u64) {
        self.next_entity.fetch_max(next_entity, Ordering::SeqCst);
        self.next_relationship.fetch_max(next_relationship, Ordering::SeqCst);
    }

    pub fn peek(&self) -> (u64, u64) {
        (
            self.next_entity.load(Ordering::SeqCst),
            self.next_relationship.load(Ordering::SeqCst),
        )
    }
}

impl IdSource for &IdAllocator {
    fn next_entity_id(&mut self) -> EntityId {
        self.entity()
    }

    fn next_relationship_id(&mut self) -> RelationshipId {
        self.relationship()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub tx_id: TxId,
    /// `None` for read-only transactions
    pub commit_seq: Option<u64>,
    pub operations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub checkpoint: Option<Cid>,
    pub transactions_replayed: usize,
    pub operations_replayed: usize,
    pub schema_changes: usize,
    pub incomplete_discarded: usize,
    pub aborted: usize,
    pub commit_seq: u64,
}

#[derive(Debug)]
struct CommitRecord {
    tx_id: TxId,
    seq: u64,
    writes: FxHashSet<RecordId>,
    deleted: FxHashSet<RecordId>,
}

#[derive(Debug, Default)]
struct CommitState {
    commit_seq: u64,
    log: VecDeque<CommitRecord>,
    /// Active transactions and their snapshots
    active: BTreeMap<TxId, u64>,
    commits_since_checkpoint: u64,
}

impl CommitState {
    /// Drop commit records no active transaction can still conflict with
    fn prune(&mut self) {
        let horizon = self.active.values().min().copied().unwrap_or(self.commit_seq);
        while self.log.front().map(|r| r.seq <= horizon).unwrap_or(false) {
            self.log.pop_front();
        }
    }

    fn release(&mut self, tx: TxId) {
        self.active.remove(&tx);
        self.prune();
    }

    fn find_conflict(&self, tx: &Transaction) -> Option<(TxId, RecordId)> {
        for record in self.log.iter().filter(|r| r.seq > tx.snapshot_version()) {
            let deleted_under_us = || tx.write_set().iter().find(|r| record.deleted.contains(r));
            let stale_read = || tx.read_set().iter().find(|r| record.writes.contains(r));
            let overlapping_write = || tx.write_set().iter().find(|r| record.writes.contains(r));
            let hit = match tx.isolation() {
                IsolationLevel::ReadUncommitted => None,
                IsolationLevel::ReadCommitted => deleted_under_us(),
                IsolationLevel::RepeatableRead => deleted_under_us().or_else(stale_read),
                IsolationLevel::Serializable => deleted_under_us().or_else(stale_read).or_else(overlapping_write),
            };
            if let Some(r) = hit {
                return Some((record.tx_id, *r));
            }
        }
        None
    }
}

pub struct TransactionManager {
    graph: RwLock<GraphStore>,
    wal: Mutex<Wal>,
    state: Mutex<CommitState>,
    store: Arc<ContentStore>,
    ids: IdAllocator,
    next_tx: AtomicU64,
    checkpoint_interval: u64,
    btree_order: usize,
}

impl TransactionManager {
    /// Lock order is commit state, then graph, then WAL.
    pub fn new(store: Arc<ContentStore>, wal_config: &WalConfig, btree_order: usize) -> TransactionResult<Self> {
        let wal = Wal::open(Arc::clone(&store), wal_config.sync_on_commit)?;
        Ok(TransactionManager {
            graph: RwLock::new(GraphStore::with_index_order(btree_order)),
            wal: Mutex::new(wal),
            state: Mutex::new(CommitState::default()),
            store,
            ids: IdAllocator::new(1, 1),
            next_tx: AtomicU64::new(1),
            checkpoint_interval: wal_config.checkpoint_interval,
            btree_order,
        })
    }

    pub fn begin(&self, isolation: IsolationLevel, timeout: Option<Duration>) -> Transaction {
        let id = TxId(self.next_tx.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        let snapshot = state.commit_seq;
        state.active.insert(id, snapshot);
        debug!("Began {} at {} (snapshot {})", id, isolation, snapshot);
        Transaction::new(id, isolation, snapshot, timeout)
    }

    /// Committed graph, read-locked
    pub fn graph(&self) -> RwLockReadGuard<'_, GraphStore> {
        self.graph.read()
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn commit_sequence(&self) -> u64 {
        self.state.lock().commit_seq
    }

    pub fn active_transactions(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Stage `op` on `tx`; a failure aborts the transaction
    pub fn stage(&self, tx: &mut Transaction, op: Operation) -> TransactionResult<()> {
        let result = {
            let graph = self.graph.read();
            tx.add_operation(op, &graph)
        };
        if result.is_err() {
            self.abort(tx);
        }
        result
    }

    /// Abort `tx` and forget it
    pub fn abort(&self, tx: &mut Transaction) {
        if tx.status() != TxStatus::Committed {
            tx.abort();
        }
        self.state.lock().release(tx.id());
    }

    /// Discard everything `tx` staged
    pub fn rollback(&self, tx: &mut Transaction) -> TransactionResult<()> {
        if tx.status() == TxStatus::Committed {
            return Err(TransactionError::NotActive {
                tx: tx.id(),
                status: tx.status(),
            });
        }
        let staged = tx.operations().len();
        self.abort(tx);
        info!("Rolled back {} ({} staged operations discarded)", tx.id(), staged);
        Ok(())
    }

    pub fn commit(&self, tx: &mut Transaction) -> TransactionResult<CommitInfo> {
        if let Err(e) = tx.ensure_active() {
            self.abort(tx);
            return Err(e);
        }
        tx.set_status(TxStatus::Preparing);

        let mut state = self.state.lock();
        let result = self.commit_locked(&mut state, tx);
        match &result {
            Ok(_) => tx.finish_commit(),
            Err(e) => {
                warn!("Aborted {}: {}", tx.id(), e);
                tx.abort();
            }
        }
        state.release(tx.id());

        let due = self.checkpoint_interval > 0 && state.commits_since_checkpoint >= self.checkpoint_interval;
        if result.is_ok() && due {
            if let Err(e) = self.checkpoint_locked(&mut state) {
                warn!("Automatic checkpoint failed: {}", e);
            }
        }
        result
    }

    fn commit_locked(&self, state: &mut CommitState, tx: &Transaction) -> TransactionResult<CommitInfo> {
        if let Some((with, record)) = state.find_conflict(tx) {
            return Err(TransactionError::Conflict {
                tx: tx.id(),
                with,
                record,
            });
        }
        if tx.operations().is_empty() {
            return Ok(CommitInfo {
                tx_id: tx.id(),
                commit_seq: None,
                operations: 0,
            });
        }

        let mut graph = self.graph.write();
        validate_staged(&graph, tx)?;

        let seq = state.commit_seq + 1;
        let mut wal = self.wal.lock();
        let logged = (|| {
            wal.append(tx.id(), WalRecord::Begin { isolation: tx.isolation() })?;
            for op in tx.operations() {
                wal.append(tx.id(), WalRecord::Op(op.clone()))?;
            }
            Ok::<_, TransactionError>(())
        })();
        if let Err(e) = logged {
            log_abort(&mut wal, tx.id());
            return Err(e);
        }

        let previous_version = graph.version();
        let undo = match graph.apply_batch(tx.operations(), seq) {
            Ok(undo) => undo,
            Err(e) => {
                log_abort(&mut wal, tx.id());
                return Err(e.into());
            }
        };
        if let Err(e) = wal.append(tx.id(), WalRecord::Commit { commit_seq: seq }) {
            graph.revert(undo);
            graph.set_version(previous_version);
            log_abort(&mut wal, tx.id());
            return Err(e.into());
        }
        let (next_entity, next_relationship) = self.ids.peek();
        graph.reserve_ids(next_entity, next_relationship);

        let delta = tx.delta();
        let deleted = delta
            .deleted_entities()
            .iter()
            .map(|id| RecordId::Entity(*id))
            .chain(delta.deleted_relationships().iter().map(|id| RecordId::Relationship(*id)))
            .collect();
        state.commit_seq = seq;
        state.commits_since_checkpoint += 1;
        state.log.push_back(CommitRecord {
            tx_id: tx.id(),
            seq,
            writes: tx.write_set().clone(),
            deleted,
        });
        info!(
            "Committed {} at sequence {} ({} operations)",
            tx.id(),
            seq,
            tx.operations().len()
        );
        Ok(CommitInfo {
            tx_id: tx.id(),
            commit_seq: Some(seq),
            operations: tx.operations().len(),
        })
    }

    /// Snapshot the committed graph and mark the WAL so recovery starts there
    pub fn checkpoint(&self) -> TransactionResult<Cid> {
        let mut state = self.state.lock();
        self.checkpoint_locked(&mut state)
    }

    fn checkpoint_locked(&self, state: &mut CommitState) -> TransactionResult<Cid> {
        let graph = self.graph.read();
        let mut wal = self.wal.lock();
        let snapshot = save_snapshot(&graph, &self.store)?;
        wal.append(
            SYSTEM_TX,
            WalRecord::Checkpoint {
                snapshot,
                commit_seq: state.commit_seq,
            },
        )?;
        state.commits_since_checkpoint = 0;
        info!("Checkpoint {} at commit sequence {}", snapshot, state.commit_seq);
        Ok(snapshot)
    }

    /// Write a snapshot without touching the WAL
    pub fn snapshot(&self) -> TransactionResult<Cid> {
        let graph = self.graph.read();
        Ok(save_snapshot(&graph, &self.store)?)
    }

    /// Replace the committed graph with the snapshot at `root`
    pub fn restore(&self, root: &Cid) -> TransactionResult<()> {
        let mut state = self.state.lock();
        let mut graph = self.graph.write();
        let mut restored = load_snapshot(&self.store, root, self.btree_order)?;
        carry_custom_constraints(&graph, &mut restored);

        let seq = state.commit_seq + 1;
        restored.set_version(seq);
        self.wal.lock().append(
            SYSTEM_TX,
            WalRecord::Checkpoint {
                snapshot: *root,
                commit_seq: seq,
            },
        )?;
        let (next_entity, next_relationship) = restored.next_ids();
        self.ids.reserve(next_entity, next_relationship);
        *graph = restored;
        state.commit_seq = seq;
        state.commits_since_checkpoint = 0;
        info!("Restored snapshot {} as commit sequence {}", root, seq);
        Ok(())
    }

    /// Rebuild the committed graph from the latest checkpoint and the WAL
    pub fn recover(&self) -> TransactionResult<RecoveryReport> {
        let mut state = self.state.lock();
        let mut graph = self.graph.write();
        let recovery = self.wal.lock().recover()?;

        let mut rebuilt = match recovery.checkpoint {
            Some((root, _)) => load_snapshot(&self.store, &root, self.btree_order)?,
            None => GraphStore::with_index_order(self.btree_order),
        };
        carry_custom_constraints(&graph, &mut rebuilt);

        let mut report = RecoveryReport {
            checkpoint: recovery.checkpoint.map(|(cid, _)| cid),
            incomplete_discarded: recovery.incomplete.len(),
            aborted: recovery.aborted,
            ..RecoveryReport::default()
        };
        let mut commit_seq = recovery.checkpoint.map(|(_, seq)| seq).unwrap_or(0);
        for action in recovery.actions {
            match action {
                RecoveredAction::Commit(tx) => {
                    rebuilt.apply_all(&tx.operations, tx.commit_seq)?;
                    report.transactions_replayed += 1;
                    report.operations_replayed += tx.operations.len();
                    commit_seq = commit_seq.max(tx.commit_seq);
                }
                RecoveredAction::Schema(change) => {
                    apply_schema(&mut rebuilt, change)?;
                    report.schema_changes += 1;
                }
            }
        }

        let (next_entity, next_relationship) = rebuilt.next_ids();
        self.ids.reserve(next_entity, next_relationship);
        *graph = rebuilt;
        state.commit_seq = state.commit_seq.max(commit_seq);
        state.log.clear();
        report.commit_seq = state.commit_seq;
        info!(
            "Recovered {} transactions ({} operations), discarded {} incomplete",
            report.transactions_replayed, report.operations_replayed, report.incomplete_discarded
        );
        Ok(report)
    }

    pub fn verify_wal(&self) -> TransactionResult<WalVerification> {
        Ok(self.wal.lock().verify()?)
    }

    pub fn wal_entries(&self) -> TransactionResult<Vec<super::WalEntry>> {
        Ok(self.wal.lock().entries()?)
    }

    // ---- schema changes, applied outside transactions and logged ----

    pub fn create_index(&self, def: IndexDefinition) -> TransactionResult<()> {
        let _state = self.state.lock();
        let mut graph = self.graph.write();
        graph.create_index(def.clone())?;
        if let Err(e) = self
            .wal
            .lock()
            .append(SYSTEM_TX, WalRecord::Schema(SchemaChange::CreateIndex(def.clone())))
        {
            graph.drop_index(&def)?;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn drop_index(&self, def: &IndexDefinition) -> TransactionResult<()> {
        let _state = self.state.lock();
        let mut graph = self.graph.write();
        graph.drop_index(def)?;
        self.wal
            .lock()
            .append(SYSTEM_TX, WalRecord::Schema(SchemaChange::DropIndex(def.clone())))?;
        Ok(())
    }

    /// Register a constraint after checking existing data; returns false when
    /// it was already present. Custom predicates are not logged.
    pub fn add_constraint(&self, constraint: Constraint) -> TransactionResult<bool> {
        let _state = self.state.lock();
        let mut graph = self.graph.write();
        let added = graph.add_constraint(constraint.clone())?;
        if added && constraint.kind.is_persistable() {
            if let Err(e) = self
                .wal
                .lock()
                .append(SYSTEM_TX, WalRecord::Schema(SchemaChange::AddConstraint(constraint.clone())))
            {
                graph.drop_constraint(&constraint);
                return Err(e.into());
            }
        }
        Ok(added)
    }

    pub fn drop_constraint(&self, constraint: &Constraint) -> TransactionResult<bool> {
        let _state = self.state.lock();
        let mut graph = self.graph.write();
        let dropped = graph.drop_constraint(constraint);
        if dropped && constraint.kind.is_persistable() {
            self.wal
                .lock()
                .append(SYSTEM_TX, WalRecord::Schema(SchemaChange::DropConstraint(constraint.clone())))?;
        }
        Ok(dropped)
    }
}

fn log_abort(wal: &mut Wal, tx: TxId) {
    if let Err(e) = wal.append(tx, WalRecord::Abort) {
        warn!("Could not log abort of {}: {}", tx, e);
    }
}

/// Constraint and endpoint checks on the final state a commit would produce
fn validate_staged(graph: &GraphStore, tx: &Transaction) -> TransactionResult<()> {
    let delta = tx.delta();
    let view = tx.view(graph);
    let exists = |id: EntityId| view.contains_entity(id) && (delta.is_created(id) || graph.has_entity(id));

    for id in delta.touched_entities() {
        if !exists(*id) {
            return Err(GraphError::EntityNotFound(*id).into());
        }
        if let Some(entity) = view.entity(*id) {
            graph.constraints().validate_entity(entity, &view)?;
        }
    }
    for rel in delta.created_relationships() {
        if let Some(missing) = [rel.source, rel.target].into_iter().find(|id| !exists(*id)) {
            return Err(GraphError::DanglingEndpoint {
                relationship: rel.id,
                entity: missing,
            }
            .into());
        }
    }
    Ok(())
}

fn apply_schema(graph: &mut GraphStore, change: SchemaChange) -> TransactionResult<()> {
    match change {
        SchemaChange::CreateIndex(def) => {
            if !graph.index_manager().has_index(&def) {
                graph.create_index(def)?;
            }
        }
        SchemaChange::DropIndex(def) => {
            if graph.index_manager().has_index(&def) {
                graph.drop_index(&def)?;
            }
        }
        SchemaChange::AddConstraint(c) => {
            graph.add_constraint(c)?;
        }
        SchemaChange::DropConstraint(c) => {
            graph.drop_constraint(&c);
        }
    }
    Ok(())
}

/// Custom predicates live only in memory; keep them across rebuilds
fn carry_custom_constraints(from: &GraphStore, to: &mut GraphStore) {
    for constraint in from.constraints().all() {
        if !constraint.kind.is_persistable() {
            if let Err(e) = to.add_constraint(constraint.clone()) {
                warn!("Dropping constraint {} during rebuild: {}", constraint.name(), e);
            }
        }
    }
}
