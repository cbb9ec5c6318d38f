use hybrid_retrieval_engine::engine::{
    Document, Engine, FusionMethod, InsertOptions, Query, SearchRequest,
};
use tempfile::TempDir;

fn opened_engine(dir: &TempDir) -> Engine {
    let mut engine = Engine::new(dir.path());
    engine.open("opfs:/store.db").unwrap();
    engine
}

#[tokio::test]
async fn open_ensures_schema_and_default_collection() {
    let dir = TempDir::new().unwrap();
    let engine = opened_engine(&dir);
    let info = engine.collection_info("default").unwrap();
    assert_eq!(info.document_count, 0);
}

#[tokio::test]
async fn insert_then_lexical_search_finds_the_document() {
    let dir = TempDir::new().unwrap();
    let engine = opened_engine(&dir);

    engine
        .insert_document(
            "default",
            &Document {
                id: Some("doc-1".into()),
                title: Some("Quokka facts".into()),
                content: "the quokka is native to western australia".into(),
                metadata: serde_json::json!({ "tag": "animal" }),
                vector: None,
            },
            &InsertOptions::default(),
        )
        .unwrap();

    let response = engine
        .search(
            &SearchRequest {
                collection: "default".into(),
                query: Query::Lexical {
                    text: "quokka".into(),
                },
                limit: 5,
                fusion: FusionMethod::Rrf,
                ..Default::default()
            },
            None,
        )
        .unwrap();

    assert_eq!(response.shape, "lexical");
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "doc-1");
}

#[tokio::test]
async fn empty_lexical_query_is_a_bad_request() {
    let dir = TempDir::new().unwrap();
    let engine = opened_engine(&dir);

    let err = engine
        .search(
            &SearchRequest {
                query: Query::Lexical { text: String::new() },
                ..Default::default()
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), "BadRequest");
}

#[tokio::test]
async fn export_import_round_trips_across_fresh_engines() {
    let dir = TempDir::new().unwrap();
    let mut engine = opened_engine(&dir);
    engine
        .insert_document(
            "default",
            &Document {
                id: Some("doc-1".into()),
                title: None,
                content: "durability check".into(),
                metadata: serde_json::json!({}),
                vector: None,
            },
            &InsertOptions::default(),
        )
        .unwrap();
    let bytes = engine.export().unwrap();

    let mut fresh = Engine::new(dir.path());
    fresh.open(":memory:").unwrap();
    fresh.import(bytes).unwrap();
    let info = fresh.collection_info("default").unwrap();
    assert_eq!(info.document_count, 1);
}

#[tokio::test]
async fn batch_insert_of_many_documents_is_all_searchable() {
    let dir = TempDir::new().unwrap();
    let engine = opened_engine(&dir);

    let docs: Vec<Document> = (0..40)
        .map(|i| Document {
            id: Some(format!("doc-{i}")),
            title: None,
            content: format!("batch document number {i} about retrieval"),
            metadata: serde_json::json!({}),
            vector: None,
        })
        .collect();

    let report = engine
        .batch_insert_documents("default", &docs, &InsertOptions::default())
        .unwrap();
    assert_eq!(report.ids.len(), 40);

    let info = engine.collection_info("default").unwrap();
    assert_eq!(info.document_count, 40);
}

#[tokio::test]
async fn concurrent_reads_against_a_shared_engine_all_succeed() {
    use std::sync::Arc;
    use tokio::sync::Mutex;

    let dir = TempDir::new().unwrap();
    let engine = Arc::new(Mutex::new(opened_engine(&dir)));
    {
        let engine = engine.lock().await;
        engine
            .insert_document(
                "default",
                &Document {
                    id: Some("doc-1".into()),
                    title: None,
                    content: "concurrent access check".into(),
                    metadata: serde_json::json!({}),
                    vector: None,
                },
                &InsertOptions::default(),
            )
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let engine = engine.lock().await;
            engine
                .search(
                    &SearchRequest {
                        query: Query::Lexical {
                            text: "concurrent".into(),
                        },
                        ..Default::default()
                    },
                    None,
                )
                .unwrap()
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.results.len(), 1);
    }
}
