//! Layered configuration (§1a expansion) for the hybrid retrieval engine.
//!
//! Settings are assembled with the `config` crate from a file source plus an
//! environment source, mirroring the host crate's pre-existing
//! `Settings::load` pattern; `dotenv` loads a local `.env` file first so
//! environment overrides can be developed without exporting shell variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub dispatcher: DispatcherConfig,
    pub blob: BlobConfig,
    pub llm: LlmConfig,
}

/// The out-of-core model-call subsystem (§6 "Out of scope"): absent by
/// default (`base_url` empty), in which case `main.rs` never constructs an
/// `LlmClient` and `search`'s `enableEmbedding` option degrades to a logged
/// no-op. Setting `base_url` opts a host into `callLLM`/`enhanceQuery`/
/// `summarizeResults`/`searchWithLLM` and query-time embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// The logical database path and session pragmas (§4.1, §6). The pragma
/// defaults are a hard part of the contract: `engine::ingest`'s adaptive
/// batch sizing reads `page_cache_kb` back from the live connection, so a
/// host that overrides this section also changes its own batching behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_path: String,
    pub pragmas: StoragePragmaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePragmaConfig {
    pub temp_store_in_memory: bool,
    pub page_cache_kb: i64,
    pub synchronous: String,
    pub journal_mode: String,
}

impl Default for StoragePragmaConfig {
    fn default() -> Self {
        Self {
            temp_store_in_memory: true,
            page_cache_kb: 8192,
            synchronous: "normal".to_string(),
            journal_mode: "delete".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            pragmas: StoragePragmaConfig::default(),
        }
    }
}

/// The request dispatcher's concurrency and timeout contract (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub max_outstanding: usize,
    pub default_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 10,
            default_timeout_secs: 30,
        }
    }
}

/// Blob-persistence autosync interval and base directory (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    pub base_dir: PathBuf,
    pub autosync_interval_secs: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            autosync_interval_secs: 5,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let _ = dotenv::dotenv();
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("HYBRID_ENGINE").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            blob: BlobConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_json() {
        let settings = Settings::default();
        let serialized = serde_json::to_string(&settings).unwrap();
        let deserialized: Settings = serde_json::from_str(&serialized).unwrap();

        assert_eq!(settings.logging.level, deserialized.logging.level);
        assert_eq!(
            settings.engine.pragmas.page_cache_kb,
            deserialized.engine.pragmas.page_cache_kb
        );
        assert_eq!(
            settings.dispatcher.max_outstanding,
            deserialized.dispatcher.max_outstanding
        );
    }

    #[test]
    fn default_pragmas_match_the_documented_contract() {
        let pragmas = StoragePragmaConfig::default();
        assert!(pragmas.temp_store_in_memory);
        assert_eq!(pragmas.page_cache_kb, 8192);
        assert_eq!(pragmas.synchronous, "normal");
    }

    #[test]
    fn default_dispatcher_matches_the_documented_contract() {
        let dispatcher = DispatcherConfig::default();
        assert_eq!(dispatcher.max_outstanding, 10);
        assert_eq!(dispatcher.default_timeout_secs, 30);
    }
}
