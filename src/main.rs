use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hybrid_retrieval_engine::ai::api_client::{LlmClient, LlmClientConfig};
use hybrid_retrieval_engine::config::Settings;
use hybrid_retrieval_engine::engine::{Dispatcher, Engine};
use hybrid_retrieval_engine::{logger, Result};
use tracing::info;

#[derive(Parser)]
#[command(name = "hybrid-retrieval-engine")]
#[command(about = "Embedded hybrid BM25 + vector retrieval engine")]
struct Cli {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    #[arg(long)]
    db_path: Option<String>,

    #[arg(long)]
    daemon: bool,

    #[arg(long)]
    setup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.setup {
        return setup_application().await;
    }

    let settings = Settings::load(&cli.config)?;
    logger::init(&settings.logging)?;

    info!(
        "starting hybrid-retrieval-engine v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(config_path = %cli.config, "configuration loaded");

    let db_path = cli.db_path.unwrap_or_else(|| settings.engine.database_path.clone());

    if cli.daemon {
        run_daemon(settings, db_path).await?;
    } else {
        run_smoke_check(settings, db_path).await?;
    }

    Ok(())
}

async fn setup_application() -> Result<()> {
    println!("No setup steps are required: the engine creates its schema on first open.");
    Ok(())
}

/// Opens the engine, starts the dispatcher's autosync loop, and serves
/// until the process receives a shutdown signal, flushing a final
/// snapshot on the way out (§9 teardown sequence).
async fn run_daemon(settings: Settings, db_path: String) -> Result<()> {
    info!("running in daemon mode");

    let mut engine = Engine::new(settings.blob.base_dir.clone());
    engine.open(&db_path)?;

    let mut dispatcher = Dispatcher::new(
        engine,
        settings.dispatcher.max_outstanding,
        Duration::from_secs(settings.dispatcher.default_timeout_secs),
        Duration::from_secs(settings.blob.autosync_interval_secs),
    );

    if !settings.llm.base_url.is_empty() {
        info!(base_url = %settings.llm.base_url, "LLM client configured; enableEmbedding is available");
        let llm_client = LlmClient::new(LlmClientConfig {
            base_url: settings.llm.base_url.clone(),
            api_key: settings.llm.api_key.clone(),
            chat_model: settings.llm.chat_model.clone(),
            embedding_model: settings.llm.embedding_model.clone(),
            request_timeout: Duration::from_secs(settings.llm.request_timeout_secs),
        })?;
        dispatcher = dispatcher.with_embedder(Arc::new(llm_client));
    }

    let dispatcher = Arc::new(dispatcher);
    dispatcher.start_autosync().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received; flushing and closing");

    dispatcher.stop_autosync().await;
    let closed = dispatcher.dispatch("forceSync", serde_json::json!({})).await;
    if let hybrid_retrieval_engine::engine::Response::Err(e) = closed {
        tracing::warn!(error = ?e, "final sync before shutdown failed");
    }
    dispatcher.dispatch("close", serde_json::json!({})).await;

    Ok(())
}

/// A non-daemon invocation: open, ping, close. Useful for verifying a
/// configuration and database path are both usable without leaving a
/// background process running.
async fn run_smoke_check(settings: Settings, db_path: String) -> Result<()> {
    info!("running smoke check");
    let mut engine = Engine::new(settings.blob.base_dir.clone());
    engine.open(&db_path)?;
    info!(status = engine.ping().as_str(), "engine ready");
    engine.close();
    Ok(())
}
