pub mod ai;
pub mod config;
pub mod engine;
pub mod logger;

pub use config::Settings;
pub use engine::Engine;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
