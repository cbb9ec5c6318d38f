//! Schema Manager (SM) — creates and migrates the logical tables (§4.3).

use regex::Regex;
use std::sync::OnceLock;

use crate::engine::error::EngineError;
use crate::engine::storage::StorageEngine;
use crate::engine::value::Value;

const ENSURE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL,
    config TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS docs_default (
    id TEXT NOT NULL,
    title TEXT,
    content TEXT NOT NULL,
    collection TEXT NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(id, collection)
);
CREATE VIRTUAL TABLE IF NOT EXISTS fts_default USING fts5(
    title, content, metadata, id UNINDEXED
);
";

const DEFAULT_COLLECTION: &str = "default";
const DEFAULT_DIMENSIONS: usize = 384;

fn collection_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").unwrap())
}

pub fn validate_collection_name(name: &str) -> Result<(), EngineError> {
    if collection_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!(
            "collection name {name:?} must match [A-Za-z0-9_]{{1,64}}"
        )))
    }
}

fn validate_dimensions(dimensions: usize) -> Result<(), EngineError> {
    if (1..=8192).contains(&dimensions) {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!(
            "vector dimension {dimensions} must be in [1, 8192]"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub dimensions: usize,
    pub config: serde_json::Value,
    pub document_count: i64,
}

pub struct SchemaManager;

impl SchemaManager {
    /// `ensure_schema()` — create all tables if absent; idempotent.
    pub fn ensure_schema(se: &StorageEngine) -> Result<(), EngineError> {
        se.exec_batch(ENSURE_SCHEMA_SQL)?;
        Self::create_collection(se, DEFAULT_COLLECTION, DEFAULT_DIMENSIONS, &serde_json::json!({}))
            .or_else(|e| match e {
                // the default collection may already be registered; that is fine
                EngineError::ValidationError(_) => Err(e),
                _ => Ok(()),
            })?;
        Ok(())
    }

    fn vector_table_name(collection: &str) -> String {
        format!("vec_{collection}_dense")
    }

    /// `create_collection(name, dimensions, config)` — register a collection;
    /// allocate its vector-index virtual table.
    pub fn create_collection(
        se: &StorageEngine,
        name: &str,
        dimensions: usize,
        config: &serde_json::Value,
    ) -> Result<(), EngineError> {
        validate_collection_name(name)?;
        validate_dimensions(dimensions)?;

        if se.vector_available() {
            let table = Self::vector_table_name(name);
            se.exec_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING vec0(embedding float[{dimensions}]);"
            ))?;
        }

        let now = crate::engine::now_millis();
        se.exec(
            "INSERT INTO collections (name, dimensions, config, created_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(name) DO NOTHING",
            &[
                Value::text(name),
                Value::Integer(dimensions as i64),
                Value::text(config.to_string()),
                Value::Integer(now),
            ],
        )?;
        Ok(())
    }

    /// `collection_info(name) -> { name, dimensions, document_count, … }`.
    pub fn collection_info(se: &StorageEngine, name: &str) -> Result<CollectionInfo, EngineError> {
        let result = se.select(
            "SELECT dimensions, config FROM collections WHERE name = ?",
            &[Value::text(name)],
        )?;
        let row = result.rows.first().ok_or_else(|| {
            EngineError::InvalidArgument(format!("no such collection: {name}"))
        })?;

        let dimensions = row
            .get("dimensions")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_DIMENSIONS as i64) as usize;
        let config = row
            .get("config")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::json!({}));

        let count = se.select(
            "SELECT COUNT(*) AS c FROM docs_default WHERE collection = ?",
            &[Value::text(name)],
        )?;
        let document_count = count
            .rows
            .first()
            .and_then(|row| row.get("c"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(CollectionInfo {
            name: name.to_string(),
            dimensions,
            config,
            document_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::SessionPragmas;

    fn opened_store() -> StorageEngine {
        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.configure(SessionPragmas::default()).unwrap();
        se
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let se = opened_store();
        SchemaManager::ensure_schema(&se).unwrap();
        SchemaManager::ensure_schema(&se).unwrap();
        let info = SchemaManager::collection_info(&se, "default").unwrap();
        assert_eq!(info.dimensions, DEFAULT_DIMENSIONS);
    }

    #[test]
    fn rejects_bad_collection_names() {
        assert!(validate_collection_name("valid_name-1").is_err()); // hyphen not allowed
        assert!(validate_collection_name("valid_name_1").is_ok());
        assert!(validate_collection_name("").is_err());
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        let se = opened_store();
        SchemaManager::ensure_schema(&se).unwrap();
        assert!(SchemaManager::create_collection(&se, "docs", 0, &serde_json::json!({})).is_err());
        assert!(
            SchemaManager::create_collection(&se, "docs", 8193, &serde_json::json!({})).is_err()
        );
        assert!(
            SchemaManager::create_collection(&se, "docs", 384, &serde_json::json!({})).is_ok()
        );
    }
}
