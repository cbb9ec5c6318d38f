//! Request Dispatcher (RD) — the async boundary in front of the
//! synchronous `Engine` (§4.6).
//!
//! RD owns everything `Engine` and its components deliberately don't: the
//! `tokio::sync::Semaphore` outstanding-call cap, the per-call
//! `tokio::time::timeout`, the single `tokio::sync::Mutex<Engine>` that
//! serializes every SE-touching handler, and the autosync timer with its
//! single-in-flight-save coalescing. Named methods are matched directly
//! rather than routed through a `HashMap<String, fn(...)>` registry, which
//! keeps each handler's argument shape checked by the compiler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::engine::error::EngineError;
use crate::engine::ingest::{Document, InsertOptions};
use crate::engine::search::{FusionMethod, FusionWeights, Query, QueryEmbedder, SearchRequest};
use crate::engine::value::Value;
use crate::engine::Engine;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

impl From<EngineError> for ErrorEnvelope {
    fn from(error: EngineError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Ok(serde_json::Value),
    Err(ErrorEnvelope),
}

impl Response {
    fn ok(value: serde_json::Value) -> Self {
        Response::Ok(value)
    }

    fn err(error: EngineError) -> Self {
        Response::Err(error.into())
    }
}

pub struct Dispatcher {
    engine: Arc<Mutex<Engine>>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    autosync_interval: Duration,
    autosync_handle: Mutex<Option<JoinHandle<()>>>,
    save_in_flight: Arc<Mutex<()>>,
    operation_count: AtomicU64,
    /// The seam `search`'s `enableEmbedding` option calls into (§4.5, §6).
    /// `None` when the host has not configured one; a text-only search with
    /// `enableEmbedding` then falls back to Shape A with a warning rather
    /// than failing the call.
    embedder: Option<Arc<dyn QueryEmbedder + Send + Sync>>,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        max_outstanding: usize,
        call_timeout: Duration,
        autosync_interval: Duration,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            semaphore: Arc::new(Semaphore::new(max_outstanding)),
            call_timeout,
            autosync_interval,
            autosync_handle: Mutex::new(None),
            save_in_flight: Arc::new(Mutex::new(())),
            operation_count: AtomicU64::new(0),
            embedder: None,
        }
    }

    /// Wires the out-of-core query-embedding client into `search`'s
    /// `enableEmbedding` option (§4.5/§6). A host that never configures one
    /// still gets a fully working dispatcher: the option degrades to a
    /// logged no-op.
    pub fn with_embedder(mut self, embedder: Arc<dyn QueryEmbedder + Send + Sync>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// `startAutosync()` (§4.2/§6) — spawn the periodic snapshot task. A
    /// second call is a no-op: the previous task keeps running.
    pub async fn start_autosync(self: &Arc<Self>) {
        let mut guard = self.autosync_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatcher.autosync_interval);
            loop {
                ticker.tick().await;
                dispatcher.coalesced_sync().await;
            }
        });
        *guard = Some(handle);
    }

    /// `stopAutosync()` — cancel the periodic task without running a final
    /// sync; callers that want a final flush call `force_sync` themselves.
    pub async fn stop_autosync(&self) {
        let mut guard = self.autosync_handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// Coalesces concurrent autosync ticks: if a save is already in flight
    /// this tick is dropped rather than queued, so autosync never builds a
    /// backlog of pending serializations (§4.2 "single in-flight save").
    async fn coalesced_sync(&self) {
        let Ok(_permit) = self.save_in_flight.try_lock() else {
            tracing::debug!("autosync tick skipped: a save is already in flight");
            return;
        };
        let engine = self.engine.lock().await;
        if let Err(e) = engine.force_sync() {
            tracing::warn!(error = %e, "autosync failed");
        }
    }

    /// Every named method passes through here: acquire a concurrency
    /// permit, bound the call with `call_timeout`, and only then take the
    /// single `Engine` lock for the handler's body.
    pub async fn dispatch(&self, method: &str, params: serde_json::Value) -> Response {
        let _permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                // fall back to waiting: the cap limits concurrency, not queue depth
                match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Response::err(EngineError::Internal(
                            "dispatcher semaphore closed".into(),
                        ))
                    }
                }
            }
        };

        self.operation_count.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.call_timeout, self.handle(method, params)).await {
            Ok(response) => response,
            Err(_) => Response::err(EngineError::Timeout),
        }
    }

    async fn handle(&self, method: &str, params: serde_json::Value) -> Response {
        match method {
            "ping" => {
                let engine = self.engine.lock().await;
                Response::ok(json!({ "status": engine.ping().as_str() }))
            }
            "getVersion" => Response::ok(json!({ "version": env!("CARGO_PKG_VERSION") })),
            "open" => self.handle_open(params).await,
            "close" => {
                let mut engine = self.engine.lock().await;
                engine.close();
                Response::ok(json!({}))
            }
            "clear" => {
                let mut engine = self.engine.lock().await;
                match engine.clear() {
                    Ok(()) => Response::ok(json!({})),
                    Err(e) => Response::err(e),
                }
            }
            "forceSync" => {
                let engine = self.engine.lock().await;
                match engine.force_sync() {
                    Ok(()) => Response::ok(json!({})),
                    Err(e) => Response::err(e),
                }
            }
            "startAutosync" => Response::ok(json!({})), // started by Dispatcher::start_autosync at boot, not on demand
            "initializeSchema" => {
                let engine = self.engine.lock().await;
                match engine.ensure_schema() {
                    Ok(()) => Response::ok(json!({})),
                    Err(e) => Response::err(e),
                }
            }
            "createCollection" => self.handle_create_collection(params).await,
            "collectionInfo" | "getCollectionInfo" => self.handle_collection_info(params).await,
            "getCollectionEmbeddingStatus" => self.handle_collection_embedding_status(params).await,
            "insertDocument" | "insertDocumentWithEmbedding" => {
                self.handle_insert_document(params).await
            }
            "batchInsertDocuments" => self.handle_batch_insert(params).await,
            "exec" => self.handle_exec(params).await,
            "select" => self.handle_select(params).await,
            "bulkInsert" => self.handle_bulk_insert(params).await,
            "export" => self.handle_export().await,
            "import" => self.handle_import(params).await,
            "stats" | "getStats" => self.handle_stats().await,
            "search" | "searchText" | "searchAdvanced" | "searchGlobal" | "searchSemantic" => {
                self.handle_search(params).await
            }
            other => Response::err(EngineError::UnknownMethod(other.to_string())),
        }
    }

    async fn handle_open(&self, params: serde_json::Value) -> Response {
        let Some(path) = params.get("path").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("open requires a path".into()));
        };
        let mut engine = self.engine.lock().await;
        match engine.open(path) {
            Ok(()) => Response::ok(json!({})),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_create_collection(&self, params: serde_json::Value) -> Response {
        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("createCollection requires a name".into()));
        };
        let dimensions = params
            .get("dimensions")
            .and_then(|v| v.as_u64())
            .unwrap_or(384) as usize;
        let config = params.get("config").cloned().unwrap_or(json!({}));
        let engine = self.engine.lock().await;
        match engine.create_collection(name, dimensions, &config) {
            Ok(()) => Response::ok(json!({})),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_collection_info(&self, params: serde_json::Value) -> Response {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        let engine = self.engine.lock().await;
        match engine.collection_info(name) {
            Ok(info) => Response::ok(json!({
                "name": info.name,
                "dimensions": info.dimensions,
                "config": info.config,
                "documentCount": info.document_count,
            })),
            Err(e) => Response::err(e),
        }
    }

    /// `getCollectionEmbeddingStatus(name)` — reports whether the
    /// vector-index facility is available and how many of the collection's
    /// documents currently carry a vector entry (§3: vector coverage can lag
    /// document count the same way lexical coverage can).
    async fn handle_collection_embedding_status(&self, params: serde_json::Value) -> Response {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let engine = self.engine.lock().await;
        let info = match engine.collection_info(&name) {
            Ok(info) => info,
            Err(e) => return Response::err(e),
        };
        let vector_available = engine.storage().vector_available();
        let embedded_count = if vector_available {
            let table = format!("vec_{name}_dense");
            match engine.select(&format!("SELECT COUNT(*) AS c FROM {table}"), &[]) {
                Ok(result) => result
                    .rows
                    .first()
                    .and_then(|row| row.get("c"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                Err(_) => 0,
            }
        } else {
            0
        };
        Response::ok(json!({
            "name": info.name,
            "dimensions": info.dimensions,
            "vectorAvailable": vector_available,
            "documentCount": info.document_count,
            "embeddedCount": embedded_count,
        }))
    }

    /// `bulkInsert({tableName, data[]})` (§6) — a direct, schema-agnostic
    /// bulk row insert distinct from `batchInsertDocuments`: the caller names
    /// an arbitrary table and a list of column→value row maps, rather than
    /// going through the document/collection model. Rows are inserted inside
    /// a single transaction so a mid-batch failure leaves no partial insert.
    async fn handle_bulk_insert(&self, params: serde_json::Value) -> Response {
        let Some(table_name) = params.get("tableName").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("bulkInsert requires tableName".into()));
        };
        let Some(rows) = params.get("data").and_then(|v| v.as_array()) else {
            return Response::err(EngineError::BadRequest("bulkInsert requires a data array".into()));
        };
        if rows.is_empty() {
            return Response::ok(json!({ "inserted": 0 }));
        }

        let engine = self.engine.lock().await;
        if let Err(e) = engine.exec("BEGIN IMMEDIATE", &[]) {
            return Response::err(e);
        }

        let mut inserted = 0usize;
        for row in rows {
            let Some(object) = row.as_object() else {
                let _ = engine.exec("ROLLBACK", &[]);
                return Response::err(EngineError::BadRequest(
                    "bulkInsert data rows must be objects".into(),
                ));
            };
            let columns: Vec<&String> = object.keys().collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let column_list = columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let values: Vec<Value> = columns.iter().map(|c| Self::parse_value(&object[*c])).collect();
            let sql = format!("INSERT INTO {table_name} ({column_list}) VALUES ({placeholders})");
            if let Err(e) = engine.exec(&sql, &values) {
                let _ = engine.exec("ROLLBACK", &[]);
                return Response::err(e);
            }
            inserted += 1;
        }

        if let Err(e) = engine.exec("COMMIT", &[]) {
            return Response::err(e);
        }
        Response::ok(json!({ "inserted": inserted }))
    }

    fn parse_document(params: &serde_json::Value) -> Document {
        Document {
            id: params.get("id").and_then(|v| v.as_str()).map(str::to_string),
            title: params
                .get("title")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            content: params
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: params.get("metadata").cloned().unwrap_or(json!({})),
            vector: params.get("vector").and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|n| n.as_f64().map(|f| f as f32))
                    .collect()
            }),
        }
    }

    async fn handle_insert_document(&self, params: serde_json::Value) -> Response {
        let collection = params
            .get("collection")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let doc = Self::parse_document(&params);
        let opts = InsertOptions {
            skip_lexical_sync: params
                .get("skipLexicalSync")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };
        let engine = self.engine.lock().await;
        match engine.insert_document(&collection, &doc, &opts) {
            Ok(id) => Response::ok(json!({ "id": id })),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_batch_insert(&self, params: serde_json::Value) -> Response {
        let collection = params
            .get("collection")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let Some(docs_json) = params.get("documents").and_then(|v| v.as_array()) else {
            return Response::err(EngineError::BadRequest(
                "batchInsertDocuments requires a documents array".into(),
            ));
        };
        let docs: Vec<Document> = docs_json.iter().map(Self::parse_document).collect();
        let opts = InsertOptions::default();
        let engine = self.engine.lock().await;
        match engine.batch_insert_documents(&collection, &docs, &opts) {
            Ok(report) => Response::ok(json!({
                "ids": report.ids,
                "lexicalSyncFailures": report.lexical_sync_failures,
            })),
            Err(e) => Response::err(e),
        }
    }

    fn parse_value(value: &serde_json::Value) -> Value {
        Value::from_json(value)
    }

    async fn handle_exec(&self, params: serde_json::Value) -> Response {
        let Some(sql) = params.get("sql").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("exec requires sql".into()));
        };
        let values: Vec<Value> = params
            .get("params")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(Self::parse_value).collect())
            .unwrap_or_default();
        let engine = self.engine.lock().await;
        match engine.exec(sql, &values) {
            Ok(affected) => Response::ok(json!({ "affected": affected })),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_select(&self, params: serde_json::Value) -> Response {
        let Some(sql) = params.get("sql").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("select requires sql".into()));
        };
        let values: Vec<Value> = params
            .get("params")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(Self::parse_value).collect())
            .unwrap_or_default();
        let engine = self.engine.lock().await;
        match engine.select(sql, &values) {
            Ok(result) => Response::ok(json!({
                "columns": result.columns,
                "rows": result.rows,
            })),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_export(&self) -> Response {
        let engine = self.engine.lock().await;
        match engine.export() {
            Ok(bytes) => {
                use base64::Engine as _;
                Response::ok(json!({
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }))
            }
            Err(e) => Response::err(e),
        }
    }

    async fn handle_import(&self, params: serde_json::Value) -> Response {
        use base64::Engine as _;
        let Some(data) = params.get("data").and_then(|v| v.as_str()) else {
            return Response::err(EngineError::BadRequest("import requires data".into()));
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => return Response::err(EngineError::BadRequest(e.to_string())),
        };
        let mut engine = self.engine.lock().await;
        match engine.import(bytes) {
            Ok(()) => Response::ok(json!({})),
            Err(e) => Response::err(e),
        }
    }

    async fn handle_stats(&self) -> Response {
        let engine = self.engine.lock().await;
        match engine.stats() {
            Ok(mut stats) => {
                stats.operation_count = self.operation_count();
                Response::ok(json!({
                    "initialized": stats.initialized,
                    "operationCount": stats.operation_count,
                    "vectorAvailable": stats.vector_available,
                    "defaultCollectionDocuments": stats.default_collection_documents,
                }))
            }
            Err(e) => Response::err(e),
        }
    }

    /// Covers the `search`/`searchText`/`searchAdvanced`/`searchGlobal`
    /// surface (§6): they are the same hybrid search behind different host
    /// call sites, so they share one handler. An optional `strategy` field
    /// is accepted and ignored; it is reserved for a host that wants to pin
    /// a non-default fusion method through the advanced/global entry points
    /// without a breaking change to the request shape.
    async fn handle_search(&self, params: serde_json::Value) -> Response {
        let collection = params
            .get("collection")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
        let fusion = match params.get("fusion").and_then(|v| v.as_str()) {
            Some("weighted") => FusionMethod::Weighted,
            _ => FusionMethod::Rrf,
        };
        let weights = FusionWeights {
            lexical: params
                .get("weights")
                .and_then(|w| w.get("lexical"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5),
            vector: params
                .get("weights")
                .and_then(|w| w.get("vector"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5),
        };

        let text = params.get("text").and_then(|v| v.as_str()).map(str::to_string);
        let embedding: Option<Vec<f32>> = params.get("embedding").and_then(|v| v.as_array()).map(|arr| {
            arr.iter().filter_map(|n| n.as_f64().map(|f| f as f32)).collect()
        });
        // `enableEmbedding` (§4.5/§6) may sit at the top level or nested
        // under `options`, matching the loose host call shapes the rest of
        // this surface already tolerates.
        let enable_embedding = params
            .get("enableEmbedding")
            .or_else(|| params.get("options").and_then(|o| o.get("enableEmbedding")))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let query = match (text, embedding) {
            (Some(text), None) if enable_embedding => Query::Hybrid { text, embedding: None },
            (Some(text), None) => Query::Lexical { text },
            (None, Some(embedding)) => Query::Vector { embedding },
            (Some(text), Some(embedding)) => Query::Hybrid {
                text,
                embedding: Some(embedding),
            },
            (None, None) => {
                return Response::err(EngineError::BadRequest(
                    "search requires text and/or embedding".into(),
                ))
            }
        };

        let request = SearchRequest {
            collection,
            query,
            limit,
            fusion,
            weights,
        };
        let started = std::time::Instant::now();
        let embedder = self.embedder.as_deref();
        let engine = self.engine.lock().await;
        match engine.search(&request, embedder) {
            Ok(response) => Response::ok(json!({
                "shape": response.shape,
                "results": response.results,
                "totalResults": response.total_results,
                "searchTime": response.search_time,
            })),
            // §7: a bad request (e.g. neither text nor vector given) is the
            // one documented exception to "search always returns a result
            // list" and propagates as a real error. Any other failure inside
            // HSE — a storage or execution error — is downgraded here to an
            // empty result list with searchTime set, and logged.
            Err(EngineError::BadRequest(msg)) => Response::err(EngineError::BadRequest(msg)),
            Err(e) => {
                tracing::error!(error = %e, "search execution failed, returning empty results");
                Response::ok(json!({
                    "shape": "none",
                    "results": Vec::<serde_json::Value>::new(),
                    "totalResults": 0,
                    "searchTime": started.elapsed().as_millis(),
                }))
            }
        }
    }
}
