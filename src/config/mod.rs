pub mod settings;

pub use settings::{
    BlobConfig, DispatcherConfig, EngineConfig, LlmConfig, LoggingConfig, Settings,
    StoragePragmaConfig,
};
