//! WAL replay and restart behaviour on the persistent backends

use cidgraph::graph::Operation;
use cidgraph::storage::FileBackend;
use cidgraph::transaction::{TransactionError, Wal, WalError, WalRecord};
use cidgraph::{
    BackendKind, ContentStore, EngineConfig, Entity, EntityId, Error, GraphDatabase, IsolationLevel, TxId, Value,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn names(db: &GraphDatabase) -> Vec<Value> {
    db.query("MATCH (p:Person) RETURN p.name AS name ORDER BY name")
        .unwrap()
        .iter()
        .filter_map(|r| r.get("name").cloned())
        .collect()
}

/// Append an unfinished transaction straight to the log, as a crash between
/// staging and commit would leave it
fn append_incomplete(dir: &Path) {
    let store = Arc::new(ContentStore::new(Box::new(FileBackend::open(dir).unwrap()), 0));
    let mut wal = Wal::open(store, true).unwrap();
    let tx = TxId(10_000);
    wal.append(tx, WalRecord::Begin { isolation: IsolationLevel::ReadCommitted }).unwrap();
    let mut ghost = Entity::new(EntityId::new(9_999), "Person");
    ghost.set_property("name", "Ghost");
    wal.append(tx, WalRecord::Op(Operation::CreateEntity(ghost))).unwrap();
}

#[test]
fn test_recover_keeps_committed_and_drops_incomplete() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::with_backend(BackendKind::Filesystem, dir.path());
    {
        let db = GraphDatabase::open(config.clone()).unwrap();
        db.query("CREATE (:Person {name: 'Alice'})").unwrap();
    }
    append_incomplete(dir.path());

    let db = GraphDatabase::open(config).unwrap();
    assert_eq!(names(&db), vec![Value::from("Alice")]);

    let report = db.recover().unwrap();
    assert_eq!(report.transactions_replayed, 1);
    assert_eq!(report.incomplete_discarded, 1);

    // Fresh ids do not collide with anything replayed
    db.query("CREATE (:Person {name: 'Bob'})").unwrap();
    assert_eq!(names(&db), vec![Value::from("Alice"), Value::from("Bob")]);
}

#[test]
fn test_restart_after_checkpoint_on_rocksdb() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::with_backend(BackendKind::Rocksdb, dir.path().join("db"));
    {
        let db = GraphDatabase::open(config.clone()).unwrap();
        db.query("CREATE INDEX ON :Person(name)").unwrap();
        db.query("CREATE (:Person {name: 'Alice'})-[:KNOWS]->(:Person {name: 'Bob'})").unwrap();
        db.checkpoint().unwrap();
        db.query("CREATE (:Person {name: 'Carol'})").unwrap();
    }

    let db = GraphDatabase::open(config).unwrap();
    assert_eq!(
        names(&db),
        vec![Value::from("Alice"), Value::from("Bob"), Value::from("Carol")]
    );
    let stats = db.statistics();
    assert_eq!(stats.relationship_count, 1);
    assert_eq!(stats.indexes.len(), 1);
    assert!(db.verify_wal().unwrap().entries > 0);
}

#[test]
fn test_rolled_back_work_is_not_replayed() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::with_backend(BackendKind::Filesystem, dir.path());
    {
        let db = GraphDatabase::open(config.clone()).unwrap();
        db.query("CREATE (:Person {name: 'Kept'})").unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        db.execute("CREATE (:Person {name: 'Dropped'})", &mut tx).unwrap();
        db.rollback(&mut tx).unwrap();
    }
    let db = GraphDatabase::open(config).unwrap();
    assert_eq!(names(&db), vec![Value::from("Kept")]);
}

#[test]
fn test_restore_earlier_snapshot() {
    let db = GraphDatabase::in_memory().unwrap();
    db.query("CREATE (:Person {name: 'Alice'})").unwrap();
    let before = db.snapshot().unwrap();
    db.query("CREATE (:Person {name: 'Bob'})").unwrap();

    db.restore(&before).unwrap();
    assert_eq!(names(&db), vec![Value::from("Alice")]);

    // Restoring is logged, so recovery lands on the same state
    db.recover().unwrap();
    assert_eq!(names(&db), vec![Value::from("Alice")]);
}

#[test]
fn test_verify_wal_reads_past_the_block_cache() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::with_backend(BackendKind::Filesystem, dir.path());
    let db = GraphDatabase::open(config).unwrap();
    db.query("CREATE (:Person {name: 'Alice'})").unwrap();
    assert_eq!(db.verify_wal().unwrap().entries, 3);

    // Damage every block file while the live store still caches them
    let mut damaged = 0;
    for shard in std::fs::read_dir(dir.path().join("blocks")).unwrap() {
        let shard = shard.unwrap().path();
        if !shard.is_dir() {
            continue;
        }
        for block in std::fs::read_dir(&shard).unwrap() {
            std::fs::write(block.unwrap().path(), b"garbage").unwrap();
            damaged += 1;
        }
    }
    assert!(damaged >= 3);

    let err = db.verify_wal().unwrap_err();
    assert!(
        matches!(err, Error::Transaction(TransactionError::Wal(WalError::Corruption(_)))),
        "{:?}",
        err
    );
    assert_eq!(db.content_store().check_integrity().unwrap().len(), damaged);
}
