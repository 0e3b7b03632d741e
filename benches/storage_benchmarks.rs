//! Storage backend benchmarks
//!
//! Document store vs SQLite store:
//! - Insert throughput (one atomic write per insert)
//! - Key search over a populated table
//! - Grouped inserts inside one transaction
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use perfcfg::storage::{Document, DocumentStore, SqliteStore, Storage};
use perfcfg::Query;
use rand::Rng;
use serde_json::json;

/// A target-like document with a random compiler choice.
fn create_test_document(rng: &mut impl Rng, i: usize) -> Document {
    let compilers = ["gcc", "clang", "icc"];
    let mut doc = Document::new();
    doc.insert("name".into(), json!(format!("target-{i}")));
    doc.insert("cc".into(), json!(compilers[rng.gen_range(0..compilers.len())]));
    doc.insert("host_arch".into(), json!("x86_64"));
    doc.insert("mpi".into(), json!(rng.gen_bool(0.5)));
    doc
}

fn open_stores(dir: &std::path::Path) -> Vec<(&'static str, Box<dyn Storage>)> {
    vec![
        (
            "document",
            Box::new(DocumentStore::open(dir.join("bench.json"), true).unwrap()),
        ),
        (
            "sqlite",
            Box::new(SqliteStore::open(dir.join("bench.sqlite3"), true).unwrap()),
        ),
    ]
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    let mut rng = rand::thread_rng();

    let dir = tempfile::tempdir().unwrap();
    for (name, store) in open_stores(dir.path()) {
        let mut i = 0;
        group.bench_function(BenchmarkId::new(name, "single"), |b| {
            b.iter(|| {
                i += 1;
                store
                    .insert("target", create_test_document(&mut rng, i))
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let mut rng = rand::thread_rng();

    for rows in [100, 1_000] {
        let dir = tempfile::tempdir().unwrap();
        for (name, store) in open_stores(dir.path()) {
            store
                .transaction(&mut || {
                    for i in 0..rows {
                        store.insert("target", create_test_document(&mut rng, i))?;
                    }
                    Ok(())
                })
                .unwrap();
            let query = Query::key("cc", "clang");
            group.bench_with_input(BenchmarkId::new(name, rows), &rows, |b, _| {
                b.iter(|| black_box(store.search("target", &query).unwrap()));
            });
        }
    }

    group.finish();
}

fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");
    let mut rng = rand::thread_rng();

    let dir = tempfile::tempdir().unwrap();
    for (name, store) in open_stores(dir.path()) {
        group.bench_function(BenchmarkId::new(name, "insert_10"), |b| {
            b.iter(|| {
                store
                    .transaction(&mut || {
                        for i in 0..10 {
                            store.insert("target", create_test_document(&mut rng, i))?;
                        }
                        Ok(())
                    })
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_transaction);
criterion_main!(benches);
