//! Criterion benchmarks for the two hot paths called out in §4.4/§4.5:
//! adaptive-batch document ingestion and lexical search over a populated
//! collection. Run with `cargo bench`.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hybrid_retrieval_engine::engine::{Document, Engine, InsertOptions, Query, SearchRequest};

fn make_docs(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document {
            id: Some(format!("bench-{i}")),
            title: None,
            content: format!("benchmark document number {i} about hybrid retrieval"),
            metadata: serde_json::json!({}),
            vector: None,
        })
        .collect()
}

fn bench_batch_insert(c: &mut Criterion) {
    c.bench_function("batch_insert_100_documents", |b| {
        b.iter_batched(
            || {
                let mut engine = Engine::new("./target/bench-blobs");
                engine.open(":memory:").unwrap();
                (engine, make_docs(100))
            },
            |(engine, docs)| {
                engine
                    .batch_insert_documents("default", &docs, &InsertOptions::default())
                    .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_lexical_search(c: &mut Criterion) {
    let mut engine = Engine::new("./target/bench-blobs");
    engine.open(":memory:").unwrap();
    let docs = make_docs(500);
    engine
        .batch_insert_documents("default", &docs, &InsertOptions::default())
        .unwrap();

    c.bench_function("lexical_search_over_500_documents", |b| {
        b.iter(|| {
            engine
                .search(
                    &SearchRequest {
                        query: Query::Lexical {
                            text: "hybrid".into(),
                        },
                        ..Default::default()
                    },
                    None,
                )
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_batch_insert, bench_lexical_search);
criterion_main!(benches);
