use ingest_api::error::PluginError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("invalid topic filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Plugin` variant, context is added to the inner `PluginError`.
    /// For other variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Plugin(e) => EngineError::Plugin(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::PipelineNotFound(msg) => {
                EngineError::PipelineNotFound(format!("{ctx}: {msg}"))
            }
            other => other,
        }
    }

    pub fn filter(filter: &str, reason: impl Into<String>) -> Self {
        EngineError::Filter { filter: filter.to_string(), reason: reason.into() }
    }
}
