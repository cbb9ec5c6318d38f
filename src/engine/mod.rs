//! The hybrid retrieval engine (§2): Storage Engine, Blob Persistence, Schema
//! Manager, Ingestion Pipeline, Hybrid Search Executor, and the Request
//! Dispatcher that wires them together behind a single serialized entry
//! point. `Engine` is the synchronous core; `dispatcher::Dispatcher` is the
//! async boundary RD adds on top (concurrency cap, per-call timeout, the
//! single SE-serializing lock).

pub mod blob;
pub mod dispatcher;
pub mod error;
pub mod ingest;
pub mod schema;
pub mod search;
pub mod storage;
pub mod value;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub use blob::{BlobPersistence, Quota};
pub use dispatcher::{Dispatcher, ErrorEnvelope, Response};
pub use error::{BlobErrorKind, EngineError};
pub use ingest::{BatchInsertReport, Document, IngestionPipeline, InsertOptions};
pub use schema::{CollectionInfo, SchemaManager};
pub use search::{
    FusionMethod, FusionWeights, HybridSearchExecutor, Query, QueryEmbedder, ResultRow,
    SearchRequest, SearchResponse,
};
pub use storage::{QueryResult, SessionPragmas, StorageEngine};
pub use value::Value;

/// Wall-clock milliseconds since the epoch. Used for `created_at`/`updated_at`
/// timestamps (§3) and for content-addressed id generation (§4.4). A clock
/// that runs backward only degrades id uniqueness slightly (blake3 is still
/// keyed on content); it never breaks an invariant.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `ping()`'s two observable states (§8: "after close, ping returns
/// not_initialized; after open, ready").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    Ready,
    NotInitialized,
}

impl PingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PingStatus::Ready => "ready",
            PingStatus::NotInitialized => "not_initialized",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub initialized: bool,
    pub operation_count: u64,
    pub vector_available: bool,
    pub default_collection_documents: i64,
}

/// The engine façade (§2, §9 "Global state"): one live connection, owned
/// exclusively by whichever layer serializes access to it (the dispatcher).
/// `Engine` itself does no locking or async scheduling — it is the thing the
/// dispatcher puts behind a `tokio::sync::Mutex`.
pub struct Engine {
    storage: StorageEngine,
    blob: BlobPersistence,
    pragmas: SessionPragmas,
}

impl Engine {
    pub fn new(blob_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageEngine::new(),
            blob: BlobPersistence::new(blob_base_dir),
            pragmas: SessionPragmas::default(),
        }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn is_initialized(&self) -> bool {
        self.storage.is_open()
    }

    pub fn ping(&self) -> PingStatus {
        if self.is_initialized() {
            PingStatus::Ready
        } else {
            PingStatus::NotInitialized
        }
    }

    /// Open sequence (§2): `SE.open → BP.load → SE.deserialize →
    /// SM.ensure_schema`. A failed restore is non-fatal (§4.2): the engine
    /// continues with an empty database rather than failing `open`.
    pub fn open(&mut self, logical_path: &str) -> Result<(), EngineError> {
        let effective_path = self.blob.initialize(logical_path)?;
        self.storage.open(&effective_path)?;

        if let Some(bytes) = self.blob.take_pending_restore() {
            if let Err(e) = self.storage.deserialize(bytes) {
                tracing::warn!(error = %e, "failed to restore snapshot; starting with an empty database");
            }
        }

        self.storage.configure(self.pragmas.clone())?;
        if let Err(e) = self.storage.init_vector_extension() {
            tracing::warn!(error = %e, "vector-index facility unavailable; falling back to lexical-only search");
        }
        SchemaManager::ensure_schema(&self.storage)?;
        Ok(())
    }

    /// Teardown (§9): close the connection and forget any leftover pending
    /// restore. Stopping auto-sync and the final force-sync are the
    /// dispatcher's responsibility since it owns the autosync task.
    pub fn close(&mut self) {
        self.storage.close();
        self.blob.forget_pending_restore();
    }

    pub fn configure_pragmas(&mut self, pragmas: SessionPragmas) -> Result<(), EngineError> {
        self.pragmas = pragmas.clone();
        if self.storage.is_open() {
            self.storage.configure(pragmas)?;
        }
        Ok(())
    }

    pub fn ensure_schema(&self) -> Result<(), EngineError> {
        SchemaManager::ensure_schema(&self.storage)
    }

    pub fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        config: &serde_json::Value,
    ) -> Result<(), EngineError> {
        SchemaManager::create_collection(&self.storage, name, dimensions, config)
    }

    pub fn collection_info(&self, name: &str) -> Result<CollectionInfo, EngineError> {
        SchemaManager::collection_info(&self.storage, name)
    }

    pub fn insert_document(
        &self,
        collection: &str,
        doc: &Document,
        opts: &InsertOptions,
    ) -> Result<String, EngineError> {
        IngestionPipeline::insert_document(&self.storage, collection, doc, opts)
    }

    pub fn batch_insert_documents(
        &self,
        collection: &str,
        docs: &[Document],
        opts: &InsertOptions,
    ) -> Result<BatchInsertReport, EngineError> {
        IngestionPipeline::batch_insert_documents(&self.storage, collection, docs, opts)
    }

    pub fn search(
        &self,
        request: &SearchRequest,
        embedder: Option<&dyn QueryEmbedder>,
    ) -> Result<SearchResponse, EngineError> {
        HybridSearchExecutor::search(&self.storage, request, embedder)
    }

    pub fn exec(&self, sql: &str, params: &[Value]) -> Result<usize, EngineError> {
        self.storage.exec(sql, params)
    }

    pub fn select(&self, sql: &str, params: &[Value]) -> Result<QueryResult, EngineError> {
        self.storage.select(sql, params)
    }

    pub fn export(&self) -> Result<Vec<u8>, EngineError> {
        self.storage.serialize()
    }

    /// `import({data})` — replace the live database with a previously
    /// exported image. Session state is not part of the image (§4.1), so
    /// pragmas and the vector extension are reapplied after the swap.
    pub fn import(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.storage.deserialize(bytes)?;
        self.storage.configure(self.pragmas.clone())?;
        if let Err(e) = self.storage.init_vector_extension() {
            tracing::warn!(error = %e, "vector-index facility unavailable after import");
        }
        Ok(())
    }

    /// `clear()` — wipe every collection's documents, lexical-index rows, and
    /// vector-index rows, then recreate the schema. Also clears the
    /// persisted snapshot so a restart does not resurrect the wiped state.
    pub fn clear(&mut self) -> Result<(), EngineError> {
        let vector_tables = self.storage.select(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'vec\\_%\\_dense' ESCAPE '\\'",
            &[],
        )?;
        for row in &vector_tables.rows {
            if let Some(name) = row.get("name").and_then(|v| v.as_str()) {
                self.storage.exec(&format!("DELETE FROM {name}"), &[])?;
            }
        }
        self.storage
            .exec_batch("DELETE FROM fts_default; DELETE FROM docs_default; DELETE FROM collections;")?;
        SchemaManager::ensure_schema(&self.storage)?;
        self.blob.clear();
        Ok(())
    }

    /// `force_sync()` — serialize the live database and persist it now,
    /// bypassing the autosync interval.
    pub fn force_sync(&self) -> Result<(), EngineError> {
        self.blob.save_snapshot(&self.storage)
    }

    pub fn blob(&self) -> &BlobPersistence {
        &self.blob
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let default_collection_documents = if self.storage.is_open() {
            self.collection_info("default").map(|i| i.document_count).unwrap_or(0)
        } else {
            0
        };
        Ok(EngineStats {
            initialized: self.is_initialized(),
            // Engine has no concept of a dispatched call; the dispatcher
            // overwrites this with its own counter before returning `stats`.
            operation_count: 0,
            vector_available: self.storage.vector_available(),
            default_collection_documents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_ping_cycle() {
        let mut engine = Engine::new("./target/test-blobs");
        assert_eq!(engine.ping(), PingStatus::NotInitialized);
        engine.open(":memory:").unwrap();
        assert_eq!(engine.ping(), PingStatus::Ready);
        engine.close();
        assert_eq!(engine.ping(), PingStatus::NotInitialized);
    }

    #[test]
    fn export_then_deserialize_into_fresh_engine_is_equivalent() {
        let mut engine = Engine::new("./target/test-blobs");
        engine.open(":memory:").unwrap();
        engine
            .insert_document(
                "default",
                &Document {
                    id: Some("a".into()),
                    title: None,
                    content: "hello world".into(),
                    metadata: serde_json::json!({}),
                    vector: None,
                },
                &InsertOptions::default(),
            )
            .unwrap();
        let bytes = engine.export().unwrap();

        let mut fresh = Engine::new("./target/test-blobs");
        fresh.open(":memory:").unwrap();
        fresh.import(bytes).unwrap();
        let info = fresh.collection_info("default").unwrap();
        assert_eq!(info.document_count, 1);
    }

    #[test]
    fn clear_empties_every_collection() {
        let mut engine = Engine::new("./target/test-blobs");
        engine.open(":memory:").unwrap();
        engine
            .insert_document(
                "default",
                &Document {
                    id: Some("a".into()),
                    title: None,
                    content: "hello".into(),
                    metadata: serde_json::json!({}),
                    vector: None,
                },
                &InsertOptions::default(),
            )
            .unwrap();
        engine.clear().unwrap();
        let info = engine.collection_info("default").unwrap();
        assert_eq!(info.document_count, 0);
    }
}
