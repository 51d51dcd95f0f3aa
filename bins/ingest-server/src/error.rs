#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Engine(#[from] ingest_engine::error::EngineError),

    #[error("plugin: {0}")]
    Plugin(#[from] ingest_api::PluginError),

    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("bad bus frame: {0}")]
    Frame(String),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
