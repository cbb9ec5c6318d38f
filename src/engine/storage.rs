//! Storage Engine (SE) — the embedded relational store (§4.1).
//!
//! A single `rusqlite::Connection` plus the two virtual-index facilities it
//! hosts. Concurrent access is serialized by the dispatcher (§4.6), not here;
//! SE is single-threaded from its own perspective, matching the corpus's
//! existing practice of wrapping a sync connection directly in async methods
//! rather than spawning it onto a blocking pool.

use std::collections::HashMap;
use std::sync::Once;

use rusqlite::Connection;

use crate::engine::error::EngineError;
use crate::engine::value::{value_ref_to_json, Value};

static REGISTER_VECTOR_EXTENSION: Once = Once::new();

/// Session-level tuning applied after `open` and after any `deserialize` (§6).
#[derive(Debug, Clone)]
pub struct SessionPragmas {
    pub temp_store_in_memory: bool,
    /// Page cache size in kilobytes. The SE convention expresses this to SQLite
    /// as a negative `cache_size` (kibibytes rather than pages).
    pub page_cache_kb: i64,
    pub synchronous: SynchronousMode,
    pub journal_mode: JournalMode,
}

impl Default for SessionPragmas {
    fn default() -> Self {
        Self {
            temp_store_in_memory: true,
            page_cache_kb: 8192, // 8 MiB, sized for a ~16 MiB engine heap (§6)
            synchronous: SynchronousMode::Normal,
            journal_mode: JournalMode::DeleteRollback,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SynchronousMode {
    Off,
    Normal,
    Full,
}

impl SynchronousMode {
    fn as_sql(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum JournalMode {
    DeleteRollback,
    Wal,
    Memory,
}

impl JournalMode {
    fn as_sql(self) -> &'static str {
        match self {
            JournalMode::DeleteRollback => "DELETE",
            JournalMode::Wal => "WAL",
            JournalMode::Memory => "MEMORY",
        }
    }
}

/// The result of `select`: columns in statement order, rows as maps keyed by
/// column name (§4.1).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
}

pub struct StorageEngine {
    connection: Option<Connection>,
    path: String,
    pragmas: SessionPragmas,
    vector_available: bool,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            connection: None,
            path: String::from(":memory:"),
            pragmas: SessionPragmas::default(),
            vector_available: false,
        }
    }

    /// `open(path)` — open or create the store at a logical path; `:memory:`
    /// is non-durable.
    pub fn open(&mut self, path: &str) -> Result<(), EngineError> {
        let connection = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        };
        self.connection = Some(connection);
        self.path = path.to_string();
        self.vector_available = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    fn require_connection(&self) -> Result<&Connection, EngineError> {
        self.connection.as_ref().ok_or(EngineError::DatabaseNotInitialized)
    }

    /// `configure(pragmas)` — apply session-level tuning (§6).
    pub fn configure(&mut self, pragmas: SessionPragmas) -> Result<(), EngineError> {
        {
            let connection = self.require_connection()?;
            connection.execute_batch(&format!(
                "PRAGMA temp_store = {};
                 PRAGMA cache_size = -{};
                 PRAGMA synchronous = {};
                 PRAGMA journal_mode = {};",
                if pragmas.temp_store_in_memory { 2 } else { 0 },
                pragmas.page_cache_kb,
                pragmas.synchronous.as_sql(),
                pragmas.journal_mode.as_sql(),
            ))?;
        }
        self.pragmas = pragmas;
        Ok(())
    }

    /// Reads back the page cache size in kilobytes, the figure the ingestion
    /// pipeline's adaptive batch sizing calibrates against (§4.4). Falls back
    /// to the last `configure`d value if the pragma can't be read.
    pub fn current_page_cache_kb(&self) -> i64 {
        let connection = match self.connection.as_ref() {
            Some(c) => c,
            None => return self.pragmas.page_cache_kb,
        };
        match connection.query_row("PRAGMA cache_size", [], |row| row.get::<_, i64>(0)) {
            Ok(raw) if raw < 0 => -raw,
            Ok(raw) if raw > 0 => {
                let page_size: i64 = connection
                    .query_row("PRAGMA page_size", [], |row| row.get(0))
                    .unwrap_or(4096);
                (raw * page_size) / 1024
            }
            _ => self.pragmas.page_cache_kb,
        }
    }

    /// `init_vector_extension()` — initialize the vector-index facility (§4.1).
    /// Registers `sqlite-vec` once per process, then probes it with a
    /// throwaway virtual table; on failure the store degrades to lexical-only
    /// search without poisoning later calls.
    pub fn init_vector_extension(&mut self) -> Result<(), EngineError> {
        REGISTER_VECTOR_EXTENSION.call_once(|| {
            unsafe {
                // Safety: sqlite3_vec_init has the signature sqlite3_auto_extension
                // expects; registering it here makes every connection opened by
                // this process (including ones created later by `deserialize`)
                // pick up the vec0 module automatically.
                rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                    sqlite_vec::sqlite3_vec_init as *const (),
                )));
            }
        });

        let connection = self.require_connection()?;
        let probe = connection.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS __vec_probe USING vec0(embedding float[1]);
             DROP TABLE IF EXISTS __vec_probe;",
        );
        match probe {
            Ok(()) => {
                self.vector_available = true;
                Ok(())
            }
            Err(e) => {
                self.vector_available = false;
                Err(EngineError::VectorUnavailable(e.to_string()))
            }
        }
    }

    pub fn vector_available(&self) -> bool {
        self.vector_available
    }

    /// `exec(sql, params?)` — execute a statement for side effects.
    pub fn exec(&self, sql: &str, params: &[Value]) -> Result<usize, EngineError> {
        let connection = self.require_connection()?;
        let mut statement = connection
            .prepare(sql)
            .map_err(|e| EngineError::PrepareFailed(e.to_string()))?;
        let affected = statement
            .execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?;
        Ok(affected)
        // `statement` is finalized here regardless of outcome.
    }

    /// Runs a multi-statement script (`BEGIN`/`COMMIT`/DDL) with no bound
    /// parameters; SQLite finalizes each statement in the script as it steps.
    pub fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        let connection = self.require_connection()?;
        connection
            .execute_batch(sql)
            .map_err(|e| EngineError::ExecFailed(e.to_string()))
    }

    /// `select(sql, params?) -> { columns, rows }`.
    pub fn select(&self, sql: &str, params: &[Value]) -> Result<QueryResult, EngineError> {
        let connection = self.require_connection()?;
        let mut statement = connection
            .prepare(sql)
            .map_err(|e| EngineError::PrepareFailed(e.to_string()))?;
        let columns: Vec<String> = statement
            .column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let mut rows = statement
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?;

        let mut materialized = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?
        {
            let mut record = HashMap::with_capacity(columns.len());
            for (index, name) in columns.iter().enumerate() {
                let value_ref = row
                    .get_ref(index)
                    .map_err(|e| EngineError::ExecFailed(e.to_string()))?;
                record.insert(name.clone(), value_ref_to_json(value_ref));
            }
            materialized.push(record);
        }

        Ok(QueryResult {
            columns,
            rows: materialized,
        })
        // `statement` (and thus `rows`, which borrows it) is finalized here.
    }

    /// `serialize() -> bytes` — a self-contained byte image of the database.
    pub fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        let connection = self.require_connection()?;
        connection
            .serialize(rusqlite::DatabaseName::Main)
            .map(|owned| owned.to_vec())
            .map_err(|e| EngineError::ExecFailed(e.to_string()))
    }

    /// `deserialize(bytes)` — replace the current database with `bytes`.
    /// Session state is not part of the image; callers must reapply
    /// `configure` and `init_vector_extension` after this returns.
    pub fn deserialize(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        let mut connection = if self.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&self.path)?
        };
        // Safety: `bytes` is a complete, well-formed database image produced by
        // a prior call to `serialize`.
        unsafe {
            connection
                .deserialize(rusqlite::DatabaseName::Main, bytes, rusqlite::SchemaFlag::empty())
                .map_err(|e| EngineError::ExecFailed(e.to_string()))?;
        }
        self.connection = Some(connection);
        self.vector_available = false;
        Ok(())
    }

    /// `close()` — release the store.
    pub fn close(&mut self) {
        self.connection = None;
        self.vector_available = false;
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_and_require_connection() {
        let mut se = StorageEngine::new();
        assert!(matches!(
            se.exec("SELECT 1", &[]),
            Err(EngineError::DatabaseNotInitialized)
        ));
        se.open(":memory:").unwrap();
        assert!(se.is_open());
        se.close();
        assert!(!se.is_open());
    }

    #[test]
    fn exec_and_select_round_trip() {
        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        se.exec(
            "INSERT INTO t (name) VALUES (?)",
            &[Value::Text("alpha".into())],
        )
        .unwrap();
        let result = se.select("SELECT id, name FROM t", &[]).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(
            result.rows[0].get("name").unwrap(),
            &serde_json::Value::String("alpha".into())
        );
    }

    #[test]
    fn configure_applies_pragmas() {
        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.configure(SessionPragmas::default()).unwrap();
        assert_eq!(se.current_page_cache_kb(), 8192);
    }

    #[test]
    fn serialize_then_deserialize_preserves_rows() {
        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        se.exec(
            "INSERT INTO t (name) VALUES (?)",
            &[Value::Text("beta".into())],
        )
        .unwrap();
        let bytes = se.serialize().unwrap();

        let mut fresh = StorageEngine::new();
        fresh.open(":memory:").unwrap();
        fresh.deserialize(bytes).unwrap();
        let result = fresh.select("SELECT name FROM t", &[]).unwrap();
        assert_eq!(
            result.rows[0].get("name").unwrap(),
            &serde_json::Value::String("beta".into())
        );
    }
}
