//! Embedding entry point
//!
//! [`GraphDatabase`] ties the storage backend, the transaction manager and
//! the query pipeline together. It is `Send + Sync`; share it through an
//! `Arc` and give every thread its own [`Transaction`].

use crate::config::{BackendKind, EngineConfig};
use crate::error::Result;
use crate::graph::{
    plan_merge, DedupStrategy, Entity, EntityId, GraphStatistics, GraphStore, Label, MergeReport, Operation,
    PropertyMap, PropertyPath, RelType, Relationship, RelationshipId,
};
use crate::index::{Constraint, ConstraintKind, IndexDefinition, IndexKind, IndexScope};
use crate::query::{compile, parse, QueryStream, Record, StatementKind};
use crate::storage::{BlockStore, Cid, ContentStore, FileBackend, MemoryBackend, RocksBackend};
use crate::transaction::{
    CommitInfo, IsolationLevel, RecoveryReport, Transaction, TransactionManager, WalVerification,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct GraphDatabase {
    config: EngineConfig,
    manager: TransactionManager,
}

impl GraphDatabase {
    /// Open the configured backend; persistent backends are recovered from
    /// their latest checkpoint and WAL before this returns
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend: Box<dyn BlockStore> = match (config.storage.backend, &config.storage.path) {
            (BackendKind::Filesystem, Some(path)) => Box::new(FileBackend::open(path)?),
            (BackendKind::Rocksdb, Some(path)) => Box::new(RocksBackend::open(path)?),
            _ => Box::new(MemoryBackend::new()),
        };
        let store = Arc::new(ContentStore::new(backend, config.storage.cache_capacity));
        let manager = TransactionManager::new(store, &config.wal, config.index.btree_order)?;

        if config.storage.backend != BackendKind::Memory {
            let report = manager.recover()?;
            debug!("Startup recovery: {:?}", report);
        }
        info!(
            "Opened {:?} graph database (commit sequence {})",
            config.storage.backend,
            manager.commit_sequence()
        );
        Ok(GraphDatabase { config, manager })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(EngineConfig::in_memory())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Begin with the configured default query timeout
    pub fn begin_transaction(&self, isolation: IsolationLevel) -> Transaction {
        self.manager.begin(isolation, self.config.transactions.query_timeout())
    }

    pub fn begin_transaction_with_timeout(&self, isolation: IsolationLevel, timeout: Duration) -> Transaction {
        self.manager.begin(isolation, Some(timeout))
    }

    pub fn execute<'a>(&'a self, query: &str, tx: &'a mut Transaction) -> Result<QueryStream<'a>> {
        self.execute_with_params(query, tx, PropertyMap::new())
    }

    /// Parse, compile and start executing `query` inside `tx`
    ///
    /// Lexical, parse and compile errors are returned before the transaction
    /// is touched. Any error after that aborts it.
    pub fn execute_with_params<'a>(
        &'a self,
        query: &str,
        tx: &'a mut Transaction,
        params: PropertyMap,
    ) -> Result<QueryStream<'a>> {
        let statement = parse(query)?;
        match statement.kind {
            StatementKind::CreateIndex { label, properties } => {
                let def = index_definition(label, properties);
                if statement.explain {
                    return Ok(explain_rows(&self.manager, tx, vec![format!("CreateIndex {:?}", def)]));
                }
                self.manager.create_index(def)?;
                Ok(QueryStream::from_rows(&self.manager, tx, Vec::new(), Vec::new()))
            }
            StatementKind::DropIndex { label, properties } => {
                let def = index_definition(label, properties);
                if statement.explain {
                    return Ok(explain_rows(&self.manager, tx, vec![format!("DropIndex {:?}", def)]));
                }
                self.manager.drop_index(&def)?;
                Ok(QueryStream::from_rows(&self.manager, tx, Vec::new(), Vec::new()))
            }
            StatementKind::Query(query) => {
                // The read guard must be released before execution takes its own
                let plan = {
                    let graph = self.manager.graph();
                    compile(&query, graph.index_manager())?
                };
                if statement.explain {
                    return Ok(explain_rows(&self.manager, tx, plan.explain_lines()));
                }
                Ok(QueryStream::execute(&self.manager, tx, &plan, params)?)
            }
        }
    }

    /// Run `query` in its own transaction and commit it
    pub fn query(&self, query: &str) -> Result<Vec<Record>> {
        self.query_with_params(query, PropertyMap::new())
    }

    pub fn query_with_params(&self, query: &str, params: PropertyMap) -> Result<Vec<Record>> {
        let mut tx = self.begin_transaction(self.config.transactions.default_isolation);
        let rows = self
            .execute_with_params(query, &mut tx, params)
            .and_then(|stream| Ok(stream.collect_rows()?));
        match rows {
            Ok(rows) => {
                self.manager.commit(&mut tx)?;
                Ok(rows)
            }
            Err(e) => {
                self.manager.abort(&mut tx);
                Err(e)
            }
        }
    }

    pub fn commit(&self, tx: &mut Transaction) -> Result<CommitInfo> {
        Ok(self.manager.commit(tx)?)
    }

    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        Ok(self.manager.rollback(tx)?)
    }

    // ---- direct mutation paths, staged on a transaction like query writes ----

    pub fn add_entity(&self, tx: &mut Transaction, labels: Vec<Label>, properties: PropertyMap) -> Result<EntityId> {
        let id = self.manager.ids().entity();
        self.manager
            .stage(tx, Operation::CreateEntity(Entity::with_properties(id, labels, properties)))?;
        Ok(id)
    }

    pub fn add_relationship(
        &self,
        tx: &mut Transaction,
        source: EntityId,
        target: EntityId,
        rel_type: impl Into<RelType>,
        properties: PropertyMap,
    ) -> Result<RelationshipId> {
        let id = self.manager.ids().relationship();
        let rel = Relationship::with_properties(id, source, target, rel_type, properties);
        self.manager.stage(tx, Operation::CreateRelationship(rel))?;
        Ok(id)
    }

    pub fn delete_entity(&self, tx: &mut Transaction, id: EntityId, detach: bool) -> Result<()> {
        self.manager.stage(tx, Operation::DeleteEntity { id, detach })?;
        Ok(())
    }

    /// Stage the merge of `source` into what `tx` currently sees
    pub fn merge_graph(&self, tx: &mut Transaction, source: &GraphStore, strategy: &DedupStrategy) -> Result<MergeReport> {
        tx.ensure_active()?;
        let plan = {
            let graph = self.manager.graph();
            let view = tx.view(&graph);
            let mut ids = self.manager.ids();
            plan_merge(&view, source, strategy, &mut ids)
        };
        debug!("{} staging merge of {} operation(s)", tx.id(), plan.operations.len());
        for op in plan.operations {
            self.manager.stage(tx, op)?;
        }
        Ok(plan.report)
    }

    // ---- schema ----

    pub fn create_index(&self, scope: IndexScope, properties: Vec<PropertyPath>, kind: IndexKind) -> Result<()> {
        let def = IndexDefinition {
            scope,
            properties,
            kind,
        };
        self.manager.create_index(def)?;
        Ok(())
    }

    pub fn drop_index(&self, def: &IndexDefinition) -> Result<()> {
        Ok(self.manager.drop_index(def)?)
    }

    /// Returns false when an identical constraint already exists
    pub fn add_constraint(&self, label: impl Into<Label>, kind: ConstraintKind) -> Result<bool> {
        Ok(self.manager.add_constraint(Constraint::new(label, kind))?)
    }

    pub fn drop_constraint(&self, constraint: &Constraint) -> Result<bool> {
        Ok(self.manager.drop_constraint(constraint)?)
    }

    // ---- durability ----

    pub fn checkpoint(&self) -> Result<Cid> {
        Ok(self.manager.checkpoint()?)
    }

    pub fn recover(&self) -> Result<RecoveryReport> {
        Ok(self.manager.recover()?)
    }

    pub fn snapshot(&self) -> Result<Cid> {
        Ok(self.manager.snapshot()?)
    }

    pub fn restore(&self, root: &Cid) -> Result<()> {
        Ok(self.manager.restore(root)?)
    }

    pub fn verify_wal(&self) -> Result<WalVerification> {
        Ok(self.manager.verify_wal()?)
    }

    pub fn statistics(&self) -> GraphStatistics {
        self.manager.graph().statistics()
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        self.manager.content_store()
    }
}

fn index_definition(label: Label, properties: Vec<PropertyPath>) -> IndexDefinition {
    match properties.len() {
        0 => IndexDefinition::label(label),
        1 => {
            let mut properties = properties;
            IndexDefinition::property(label, properties.remove(0))
        }
        _ => IndexDefinition::composite(label, properties),
    }
}

fn explain_rows<'a>(manager: &'a TransactionManager, tx: &'a mut Transaction, lines: Vec<String>) -> QueryStream<'a> {
    let rows = lines
        .into_iter()
        .map(|line| {
            let mut record = Record::new();
            record.bind("plan", line.as_str().into());
            record
        })
        .collect();
    QueryStream::from_rows(manager, tx, vec!["plan".to_string()], rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PropertyValue;
    use crate::query::Value;

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_query_autocommits() {
        let db = GraphDatabase::in_memory().unwrap();
        db.query("CREATE (:Person {name: 'Alice'})").unwrap();
        let rows = db.query("MATCH (p:Person) RETURN p.name AS name").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::from("Alice")));
        assert_eq!(db.transaction_manager().active_transactions(), 0);
    }

    #[test]
    fn test_parse_error_leaves_transaction_usable() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        assert!(db.execute("MATCH (n RETURN n", &mut tx).is_err());
        assert!(tx.is_active());
        db.execute("CREATE (:Tag {v: 1})", &mut tx).unwrap();
        db.commit(&mut tx).unwrap();
        assert_eq!(db.statistics().entity_count, 1);
    }

    #[test]
    fn test_explain_lists_operators() {
        let db = GraphDatabase::in_memory().unwrap();
        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let stream = db.execute("EXPLAIN MATCH (p:Person) RETURN p", &mut tx).unwrap();
        assert_eq!(stream.columns(), &["plan".to_string()]);
        let rows = stream.collect_rows().unwrap();
        assert!(!rows.is_empty());
        db.rollback(&mut tx).unwrap();
    }

    #[test]
    fn test_direct_mutations_and_index_ddl() {
        let db = GraphDatabase::in_memory().unwrap();
        db.query("CREATE INDEX ON :Person(name)").unwrap();
        assert_eq!(db.statistics().indexes.len(), 1);

        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        let a = db
            .add_entity(&mut tx, vec![Label::new("Person")], props(&[("name", PropertyValue::from("Ann"))]))
            .unwrap();
        let b = db
            .add_entity(&mut tx, vec![Label::new("Person")], props(&[("name", PropertyValue::from("Ben"))]))
            .unwrap();
        db.add_relationship(&mut tx, a, b, "KNOWS", PropertyMap::new()).unwrap();
        db.commit(&mut tx).unwrap();

        let rows = db
            .query("MATCH (a:Person {name: 'Ann'})-[:KNOWS]->(b) RETURN b.name AS name")
            .unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::from("Ben")));

        let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
        db.delete_entity(&mut tx, a, true).unwrap();
        db.commit(&mut tx).unwrap();
        let stats = db.statistics();
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.relationship_count, 0);
    }
}
