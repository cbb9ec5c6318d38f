use std::time::Instant;

use hybrid_retrieval_engine::engine::{Document, Engine, InsertOptions};

fn opened_engine() -> Engine {
    let mut engine = Engine::new("./target/perf-test-blobs");
    engine.open(":memory:").unwrap();
    engine
}

/// Not a hard SLA, just a guard against an accidental quadratic regression
/// in the adaptive batching path (§4.4): 500 documents should insert in a
/// small multiple of a single document's time, not hundreds of times it.
#[tokio::test]
async fn batch_insert_of_five_hundred_completes_quickly() {
    let engine = opened_engine();
    let docs: Vec<Document> = (0..500)
        .map(|i| Document {
            id: Some(format!("perf-{i}")),
            title: None,
            content: format!("performance probe document {i}"),
            metadata: serde_json::json!({}),
            vector: None,
        })
        .collect();

    let started = Instant::now();
    let report = engine
        .batch_insert_documents("default", &docs, &InsertOptions::default())
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.ids.len(), 500);
    assert!(
        elapsed.as_secs() < 10,
        "batch insert of 500 documents took {elapsed:?}, expected well under 10s"
    );
}

#[tokio::test]
async fn lexical_search_over_a_populated_collection_stays_fast() {
    let engine = opened_engine();
    let docs: Vec<Document> = (0..200)
        .map(|i| Document {
            id: Some(format!("perf-{i}")),
            title: None,
            content: format!("retrieval benchmark content block {i} about search quality"),
            metadata: serde_json::json!({}),
            vector: None,
        })
        .collect();
    engine
        .batch_insert_documents("default", &docs, &InsertOptions::default())
        .unwrap();

    let started = Instant::now();
    for _ in 0..20 {
        let _ = engine
            .search(
                &hybrid_retrieval_engine::engine::SearchRequest {
                    query: hybrid_retrieval_engine::engine::Query::Lexical {
                        text: "retrieval".into(),
                    },
                    ..Default::default()
                },
                None,
            )
            .unwrap();
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed.as_secs() < 5,
        "20 lexical searches took {elapsed:?}, expected well under 5s"
    );
}
