use cidgraph::index::BPlusTree;
use cidgraph::query::parse;
use cidgraph::{GraphDatabase, IsolationLevel};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::ops::Bound;

fn populated(size: usize) -> GraphDatabase {
    let db = GraphDatabase::in_memory().unwrap();
    db.query(&format!(
        "UNWIND range(0, {}) AS i CREATE (:Person {{id: i, age: i % 80, name: 'p' + toString(i)}})",
        size - 1
    ))
    .unwrap();
    db
}

/// B+tree insert throughput
fn bench_btree_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert");
    for size in [1_000u64, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut tree = BPlusTree::new(32);
                for i in 0..size {
                    // Scatter keys so splits happen all over the tree
                    tree.insert(i.wrapping_mul(2_654_435_761) % size, i);
                }
                tree
            });
        });
    }
    group.finish();
}

fn bench_btree_range(c: &mut Criterion) {
    let mut tree = BPlusTree::new(32);
    for i in 0..100_000u64 {
        tree.insert(i, i);
    }
    c.bench_function("btree_range_1k", |b| {
        b.iter(|| tree.range(Bound::Included(&50_000), Bound::Excluded(&51_000)))
    });
}

fn bench_parse(c: &mut Criterion) {
    let query = "MATCH (a:Person {name: 'Alice'})-[:KNOWS*1..3]->(b:Person) \
                 WHERE b.age > 30 AND NOT b.name STARTS WITH 'Z' \
                 RETURN b.name AS name, count(*) AS paths ORDER BY paths DESC LIMIT 10";
    c.bench_function("parse_query", |b| b.iter(|| parse(query).unwrap()));
}

/// Label scan with filter versus an index seek on the same data
fn bench_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_by_property");
    for size in [1_000usize, 10_000].iter() {
        let db = populated(*size);
        group.bench_with_input(BenchmarkId::new("scan", size), size, |b, _| {
            b.iter(|| db.query("MATCH (p:Person) WHERE p.id = 500 RETURN p.name").unwrap())
        });
        db.query("CREATE INDEX ON :Person(id)").unwrap();
        group.bench_with_input(BenchmarkId::new("index", size), size, |b, _| {
            b.iter(|| db.query("MATCH (p:Person) WHERE p.id = 500 RETURN p.name").unwrap())
        });
    }
    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let db = populated(10_000);
    c.bench_function("aggregate_group_by_age", |b| {
        b.iter(|| {
            db.query("MATCH (p:Person) RETURN p.age AS age, count(*) AS n ORDER BY n DESC LIMIT 5")
                .unwrap()
        })
    });
}

fn bench_commit(c: &mut Criterion) {
    let db = GraphDatabase::in_memory().unwrap();
    c.bench_function("commit_small_write", |b| {
        b.iter(|| {
            let mut tx = db.begin_transaction(IsolationLevel::ReadCommitted);
            db.execute("CREATE (:Event {kind: 'tick'})", &mut tx).unwrap();
            db.commit(&mut tx).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_btree_insert,
    bench_btree_range,
    bench_parse,
    bench_match,
    bench_aggregate,
    bench_commit
);
criterion_main!(benches);
