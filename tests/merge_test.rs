//! Whole-graph merges staged through transactions

use cidgraph::graph::snapshot::load_snapshot;
use cidgraph::graph::PropertyPath;
use cidgraph::{DedupStrategy, GraphDatabase, GraphStore, IsolationLevel, Label, PropertyMap, PropertyValue, Value};

fn committed_copy(db: &GraphDatabase) -> GraphStore {
    let root = db.snapshot().unwrap();
    load_snapshot(db.content_store(), &root, db.config().index.btree_order).unwrap()
}

fn person(name: &str, email: &str) -> PropertyMap {
    let mut props = PropertyMap::new();
    props.insert("name".to_string(), PropertyValue::from(name));
    props.insert("email".to_string(), PropertyValue::from(email));
    props
}

#[test]
fn test_self_merge_by_id_changes_nothing() {
    let db = GraphDatabase::in_memory().unwrap();
    db.query("CREATE (a:Person {name: 'A'})-[:KNOWS]->(b:Person {name: 'B'})-[:KNOWS]->(a)")
        .unwrap();
    let before = db.statistics();
    let copy = committed_copy(&db);

    let mut tx = db.begin_transaction(IsolationLevel::Serializable);
    let report = db.merge_graph(&mut tx, &copy, &DedupStrategy::ById).unwrap();
    assert!(tx.operations().is_empty());
    db.commit(&mut tx).unwrap();

    assert_eq!(report.entities_created, 0);
    assert_eq!(report.entities_merged, 2);
    assert_eq!(report.relationships_merged, 2);
    let after = db.statistics();
    assert_eq!(after.entity_count, before.entity_count);
    assert_eq!(after.relationship_count, before.relationship_count);
}

#[test]
fn test_merge_by_key_updates_and_remaps() {
    let db = GraphDatabase::in_memory().unwrap();
    db.query("CREATE (:Person {name: 'Ann', email: 'ann@x'})").unwrap();

    let mut incoming = GraphStore::new();
    let ann = incoming
        .add_entity(vec![Label::new("Person"), Label::new("Author")], person("Ann B.", "ann@x"))
        .unwrap();
    let cy = incoming
        .add_entity(vec![Label::new("Person")], person("Cy", "cy@x"))
        .unwrap();
    incoming.add_relationship(ann, cy, "CITES", PropertyMap::new()).unwrap();

    let strategy = DedupStrategy::ByKey {
        label: Label::new("Person"),
        property: PropertyPath::from("email"),
    };
    let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
    let report = db.merge_graph(&mut tx, &incoming, &strategy).unwrap();
    db.commit(&mut tx).unwrap();
    assert_eq!(report.entities_merged, 1);
    assert_eq!(report.entities_created, 1);
    assert_eq!(report.relationships_created, 1);

    let rows = db
        .query("MATCH (a:Author)-[:CITES]->(c:Person) RETURN a.name AS a, c.name AS c")
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::from("Ann B.")));
    assert_eq!(rows[0].get("c"), Some(&Value::from("Cy")));
    assert_eq!(db.statistics().entity_count, 2);

    // Merging the same source again is a no-op
    let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
    let again = db.merge_graph(&mut tx, &incoming, &strategy).unwrap();
    assert!(tx.operations().is_empty());
    db.commit(&mut tx).unwrap();
    assert_eq!(again.entities_created, 0);
    assert_eq!(again.relationships_created, 0);
}

#[test]
fn test_rolled_back_merge_leaves_no_trace() {
    let db = GraphDatabase::in_memory().unwrap();
    let mut incoming = GraphStore::new();
    incoming
        .add_entity(vec![Label::new("Person")], person("Dee", "dee@x"))
        .unwrap();

    let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
    db.merge_graph(&mut tx, &incoming, &DedupStrategy::ById).unwrap();
    db.rollback(&mut tx).unwrap();
    assert_eq!(db.statistics().entity_count, 0);
}
