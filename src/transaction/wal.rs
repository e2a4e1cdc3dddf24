//! Write-Ahead Log
//!
//! Each entry is a content-addressed block that names its predecessor, so
//! the log is a hash chain from the head (named root [`WAL_HEAD`]) back to
//! genesis. Committed work is replayed from the latest checkpoint onwards.

use super::{IsolationLevel, TxId};
use crate::graph::Operation;
use crate::index::{Constraint, IndexDefinition};
use crate::storage::{Cid, ContentStore, StorageError};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const WAL_HEAD: &str = "wal/head";

/// WAL errors
#[derive(Error, Debug)]
pub enum WalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("WAL corruption: {0}")]
    Corruption(String),

    #[error("Invalid WAL entry: {0}")]
    InvalidEntry(String),
}

pub type WalResult<T> = Result<T, WalError>;

/// Schema changes are logged so recovery restores them in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaChange {
    CreateIndex(IndexDefinition),
    DropIndex(IndexDefinition),
    AddConstraint(Constraint),
    DropConstraint(Constraint),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Begin { isolation: IsolationLevel },
    Op(Operation),
    Commit { commit_seq: u64 },
    Abort,
    Schema(SchemaChange),
    Checkpoint { snapshot: Cid, commit_seq: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub tx_id: TxId,
    pub record: WalRecord,
    pub previous: Option<Cid>,
    pub timestamp: i64,
}

/// Outcome of [`Wal::verify`]
#[derive(Debug, Clone, PartialEq)]
pub struct WalVerification {
    pub entries: usize,
    pub head: Option<Cid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTransaction {
    pub tx_id: TxId,
    pub commit_seq: u64,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveredAction {
    Commit(RecoveredTransaction),
    Schema(SchemaChange),
}

/// Work to redo after the latest checkpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalRecovery {
    pub checkpoint: Option<(Cid, u64)>,
    pub actions: Vec<RecoveredAction>,
    /// Transactions with a `Begin` but no terminal entry
    pub incomplete: Vec<TxId>,
    pub aborted: usize,
}

impl WalRecovery {
    pub fn committed(&self) -> impl Iterator<Item = &RecoveredTransaction> {
        self.actions.iter().filter_map(|a| match a {
            RecoveredAction::Commit(tx) => Some(tx),
            RecoveredAction::Schema(_) => None,
        })
    }
}

/// CID-linked append-only log
pub struct Wal {
    store: Arc<ContentStore>,
    head: Option<Cid>,
    sequence: u64,
    sync_on_commit: bool,
}

impl Wal {
    /// Attach to the chain whose head is recorded in `store`
    pub fn open(store: Arc<ContentStore>, sync_on_commit: bool) -> WalResult<Self> {
        let head = store.root(WAL_HEAD)?;
        let sequence = match &head {
            Some(cid) => store.retrieve::<WalEntry>(cid)?.sequence,
            None => 0,
        };
        info!("Opened WAL at sequence {} (head {:?})", sequence, head);
        Ok(Wal {
            store,
            head,
            sequence,
            sync_on_commit,
        })
    }

    pub fn head(&self) -> Option<Cid> {
        self.head
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn append(&mut self, tx_id: TxId, record: WalRecord) -> WalResult<Cid> {
        let durable = matches!(
            record,
            WalRecord::Commit { .. } | WalRecord::Checkpoint { .. } | WalRecord::Schema(_)
        );
        let entry = WalEntry {
            sequence: self.sequence + 1,
            tx_id,
            record,
            previous: self.head,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let cid = self.store.store(&entry)?;
        self.store.set_root(WAL_HEAD, Some(&cid))?;
        self.head = Some(cid);
        self.sequence = entry.sequence;
        if durable && self.sync_on_commit {
            self.store.flush()?;
        }
        debug!("WAL append #{} {} {:?}", entry.sequence, tx_id, cid);
        Ok(cid)
    }

    /// Entries from `head` back to (and including) the first one accepted by
    /// `stop`, returned oldest first
    fn walk_back(&self, mut stop: impl FnMut(&WalEntry) -> bool) -> WalResult<Vec<WalEntry>> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(cid) = cursor {
            let entry: WalEntry = self.store.retrieve(&cid)?;
            cursor = entry.previous;
            let done = stop(&entry);
            out.push(entry);
            if done {
                break;
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Every entry, genesis first
    pub fn entries(&self) -> WalResult<Vec<WalEntry>> {
        self.walk_back(|_| false)
    }

    /// Check hash linkage and sequence continuity from head to genesis
    pub fn verify(&self) -> WalResult<WalVerification> {
        let mut count = 0usize;
        let mut cursor = self.head;
        let mut expected = self.sequence;
        while let Some(cid) = cursor {
            // read past the cache so on-disk damage is seen on a live store
            let entry: WalEntry = self.store.retrieve_verified(&cid).map_err(|e| match e {
                StorageError::Integrity { .. } | StorageError::NotFound(_) => {
                    WalError::Corruption(format!("entry {} unreadable: {}", cid, e))
                }
                other => WalError::Storage(other),
            })?;
            if entry.sequence != expected {
                return Err(WalError::Corruption(format!(
                    "entry {} has sequence {}, expected {}",
                    cid, entry.sequence, expected
                )));
            }
            if entry.sequence == 1 && entry.previous.is_some() {
                return Err(WalError::Corruption(format!("genesis entry {} has a predecessor", cid)));
            }
            if entry.sequence > 1 && entry.previous.is_none() {
                return Err(WalError::Corruption(format!("entry {} is detached from the chain", cid)));
            }
            count += 1;
            expected -= 1;
            cursor = entry.previous;
        }
        if expected != 0 {
            return Err(WalError::Corruption(format!("chain ends {} entries early", expected)));
        }
        Ok(WalVerification {
            entries: count,
            head: self.head,
        })
    }

    /// Committed work since the latest checkpoint, in commit order
    pub fn recover(&self) -> WalResult<WalRecovery> {
        let entries = self.walk_back(|e| matches!(e.record, WalRecord::Checkpoint { .. }))?;
        let mut recovery = WalRecovery::default();
        let mut pending: FxHashMap<TxId, Vec<Operation>> = FxHashMap::default();
        let mut begun: Vec<TxId> = Vec::new();

        for entry in entries {
            match entry.record {
                WalRecord::Checkpoint { snapshot, commit_seq } => {
                    recovery.checkpoint = Some((snapshot, commit_seq));
                }
                WalRecord::Begin { .. } => {
                    pending.insert(entry.tx_id, Vec::new());
                    begun.push(entry.tx_id);
                }
                WalRecord::Op(op) => match pending.get_mut(&entry.tx_id) {
                    Some(ops) => ops.push(op),
                    None => {
                        return Err(WalError::InvalidEntry(format!(
                            "operation for {} at #{} without Begin",
                            entry.tx_id, entry.sequence
                        )))
                    }
                },
                WalRecord::Commit { commit_seq } => {
                    let operations = pending.remove(&entry.tx_id).ok_or_else(|| {
                        WalError::InvalidEntry(format!("commit for {} at #{} without Begin", entry.tx_id, entry.sequence))
                    })?;
                    recovery.actions.push(RecoveredAction::Commit(RecoveredTransaction {
                        tx_id: entry.tx_id,
                        commit_seq,
                        operations,
                    }));
                }
                WalRecord::Abort => {
                    pending.remove(&entry.tx_id);
                    recovery.aborted += 1;
                }
                WalRecord::Schema(change) => recovery.actions.push(RecoveredAction::Schema(change)),
            }
        }

        recovery.incomplete = begun.into_iter().filter(|tx| pending.contains_key(tx)).collect();
        if !recovery.incomplete.is_empty() {
            warn!("Discarding {} incomplete transactions from WAL", recovery.incomplete.len());
        }
        info!(
            "WAL recovery: {} actions after checkpoint {:?}, {} aborted",
            recovery.actions.len(),
            recovery.checkpoint.map(|(cid, _)| cid),
            recovery.aborted
        );
        Ok(recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Entity, EntityId};
    use crate::storage::MemoryBackend;

    fn wal() -> Wal {
        let store = Arc::new(ContentStore::new(Box::new(MemoryBackend::new()), 64));
        Wal::open(store, true).unwrap()
    }

    fn create(id: u64) -> WalRecord {
        WalRecord::Op(Operation::CreateEntity(Entity::new(EntityId::new(id), "N")))
    }

    #[test]
    fn test_append_and_chain() {
        let mut wal = wal();
        let first = wal.append(TxId(1), WalRecord::Begin { isolation: IsolationLevel::ReadCommitted }).unwrap();
        wal.append(TxId(1), create(1)).unwrap();
        wal.append(TxId(1), WalRecord::Commit { commit_seq: 1 }).unwrap();

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].previous, None);
        assert_eq!(entries[1].previous, Some(first));
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(wal.verify().unwrap().entries, 3);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let store = Arc::new(ContentStore::new(Box::new(MemoryBackend::new()), 64));
        let mut wal = Wal::open(store.clone(), false).unwrap();
        wal.append(TxId(1), WalRecord::Abort).unwrap();
        let reopened = Wal::open(store, false).unwrap();
        assert_eq!(reopened.sequence(), 1);
        assert_eq!(reopened.head(), wal.head());
    }

    #[test]
    fn test_recover_skips_incomplete_and_aborted() {
        let mut wal = wal();
        let begin = WalRecord::Begin { isolation: IsolationLevel::Serializable };
        wal.append(TxId(1), begin.clone()).unwrap();
        wal.append(TxId(1), create(1)).unwrap();
        wal.append(TxId(1), WalRecord::Commit { commit_seq: 1 }).unwrap();
        wal.append(TxId(2), begin.clone()).unwrap();
        wal.append(TxId(2), create(2)).unwrap();
        wal.append(TxId(3), begin).unwrap();
        wal.append(TxId(3), create(3)).unwrap();
        wal.append(TxId(3), WalRecord::Abort).unwrap();

        let recovery = wal.recover().unwrap();
        let committed: Vec<_> = recovery.committed().collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].tx_id, TxId(1));
        assert_eq!(committed[0].operations.len(), 1);
        assert_eq!(recovery.incomplete, vec![TxId(2)]);
        assert_eq!(recovery.aborted, 1);
    }

    #[test]
    fn test_recover_starts_at_checkpoint() {
        let mut wal = wal();
        let begin = WalRecord::Begin { isolation: IsolationLevel::ReadCommitted };
        wal.append(TxId(1), begin.clone()).unwrap();
        wal.append(TxId(1), create(1)).unwrap();
        wal.append(TxId(1), WalRecord::Commit { commit_seq: 1 }).unwrap();
        let snapshot = Cid::of(b"snapshot");
        wal.append(TxId(0), WalRecord::Checkpoint { snapshot, commit_seq: 1 }).unwrap();
        wal.append(TxId(2), begin).unwrap();
        wal.append(TxId(2), create(2)).unwrap();
        wal.append(TxId(2), WalRecord::Commit { commit_seq: 2 }).unwrap();

        let recovery = wal.recover().unwrap();
        assert_eq!(recovery.checkpoint, Some((snapshot, 1)));
        let committed: Vec<_> = recovery.committed().collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].commit_seq, 2);
    }

    #[test]
    fn test_verify_detects_broken_chain() {
        let store = Arc::new(ContentStore::new(Box::new(MemoryBackend::new()), 0));
        let mut wal = Wal::open(store.clone(), false).unwrap();
        let first = wal.append(TxId(1), WalRecord::Abort).unwrap();
        wal.append(TxId(2), WalRecord::Abort).unwrap();
        store.delete(&first).unwrap();
        assert!(matches!(wal.verify(), Err(WalError::Corruption(_))));
    }
}
