//! cidgraph: an embeddable property-graph database
//!
//! Data lives in a content-addressed block store: every snapshot and every
//! write-ahead-log entry is a block named by the SHA-256 of its bytes, and the
//! WAL is a hash-linked chain that can be replayed without the live indexes.
//!
//! # Architecture
//!
//! - [`storage`]: CIDs, block backends (memory, filesystem, RocksDB) and the
//!   LRU-cached [`ContentStore`]
//! - [`index`]: B+tree, label/property/composite indexes and constraints
//! - [`graph`]: entities, relationships and the committed [`GraphStore`]
//! - [`transaction`]: isolation levels, savepoints, optimistic conflict
//!   detection, the CID-linked WAL and recovery
//! - [`query`]: lexer, parser, compiler and the pull-based executor for the
//!   Cypher-style query language
//! - [`database`]: [`GraphDatabase`], the entry point tying them together
//!
//! # Example
//!
//! ```no_run
//! use cidgraph::{GraphDatabase, IsolationLevel};
//!
//! let db = GraphDatabase::in_memory().unwrap();
//! let mut tx = db.begin_transaction(IsolationLevel::Serializable);
//! db.execute("CREATE (a:Person {name: 'Alice'})-[:KNOWS]->(b:Person {name: 'Bob'})", &mut tx)
//!     .unwrap();
//! db.commit(&mut tx).unwrap();
//!
//! for row in db.query("MATCH (p:Person) RETURN p.name AS name").unwrap() {
//!     println!("{}", row.to_json());
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod graph;
pub mod index;
pub mod query;
pub mod storage;
pub mod transaction;

pub use config::{BackendKind, ConfigError, EngineConfig};
pub use database::GraphDatabase;
pub use error::{Error, Result};
pub use graph::{
    DedupStrategy, Direction, Entity, EntityId, GraphStore, Label, MergeReport, PropertyMap, PropertyValue, RelType,
    Relationship, RelationshipId,
};
pub use index::{Constraint, ConstraintKind, IndexDefinition, IndexKind, IndexScope};
pub use query::{QueryStream, Record, Value};
pub use storage::{Cid, ContentStore};
pub use transaction::{IsolationLevel, Transaction, TransactionError, TransactionManager, TxId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
