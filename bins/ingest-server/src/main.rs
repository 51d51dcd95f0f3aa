mod bus;
mod error;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use ingest_api::clock::{Clock, SystemClock};
use ingest_api::object::ObjectStore;
use ingest_api::store::RelationalStore;
use ingest_engine::bootstrap::{Engine, Substrate};
use ingest_engine::config::{IngestConfig, ObjectsBackend, StoreBackend};
use ingest_engine::metrics::LogMetrics;
use ingest_engine::objects::MemoryObjectStore;
use ingest_engine::store::MemoryStore;
use ingest_objects_file::FileObjectStore;
use ingest_store_sqlite::SqliteStore;

use error::ServerError;

#[derive(Parser)]
#[command(name = "ingest-server", about = "Topic-routed batch ingestion server")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "config.toml", env = "INGEST_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli.config).await {
        tracing::error!(error = %e, "ingest-server failed");
        std::process::exit(1);
    }
}

async fn run(config_path: &str) -> Result<(), ServerError> {
    tracing::info!(config = %config_path, "loading configuration");
    let config = IngestConfig::load(config_path)?;

    let substrate = substrate(&config)?;
    let listener = bus::bind(&config.bus.listen).await?;

    tracing::info!(pipelines = config.pipelines.len(), "bootstrapping engine");
    let engine = Engine::bootstrap(config, substrate).await?;
    let token = engine.cancellation_token();
    let front = tokio::spawn(bus::serve(listener, engine.bus(), token.clone()));

    tracing::info!("ingest-server started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    engine.shutdown().await;
    if let Err(e) = front.await {
        tracing::warn!(error = %e, "bus listener ended abnormally");
    }
    Ok(())
}

fn substrate(config: &IngestConfig) -> Result<Substrate, ServerError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let objects: Arc<dyn ObjectStore> = match &config.storage.objects {
        ObjectsBackend::Memory => Arc::new(MemoryObjectStore::new(clock.clone())),
        ObjectsBackend::File { root } => Arc::new(FileObjectStore::open(root)?),
    };
    let store: Arc<dyn RelationalStore> = match &config.storage.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite { path } => Arc::new(SqliteStore::open(Path::new(path))?),
    };
    tracing::info!(
        objects = ?config.storage.objects,
        store = ?config.storage.store,
        "storage configured"
    );

    Ok(Substrate {
        objects,
        store,
        metrics: Arc::new(LogMetrics::new(&config.metrics.namespace)),
        clock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_is_valid() {
        let config = IngestConfig::parse(include_str!("../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pipelines.len(), 3);
        assert_eq!(config.storage.objects, ObjectsBackend::File { root: "./data/objects".into() });
    }

    #[test]
    fn memory_substrate_needs_no_filesystem() {
        let config = IngestConfig::parse(
            r#"
[[pipelines]]
name = "all"
source = "notifications"
topic_filter = "all/#"
"#,
        )
        .unwrap();
        assert!(substrate(&config).is_ok());
    }
}
