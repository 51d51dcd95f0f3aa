use std::time::Duration;

use ingest_api::record::BatchSource;
use serde::Deserialize;

use crate::error::EngineError;
use crate::filter::TopicRule;
use crate::router::PartitionPolicy;

/// Root configuration — parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub bus: BusConfig,

    /// Pipeline definitions, one per logical channel.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// [bus]
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:1884".to_string()
}

fn default_broker() -> String {
    "local".to_string()
}

fn default_channel_buffer() -> usize {
    8192
}

fn default_true() -> bool {
    true
}

fn default_ingress_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// TCP address of the line-delimited JSON bus listener.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Broker label written into `_meta.broker`.
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    /// Inject `_meta` into JSON payloads before routing.
    #[serde(default = "default_true")]
    pub annotate: bool,
    #[serde(default = "default_ingress_timeout_secs")]
    pub invocation_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            broker: default_broker(),
            channel_buffer: default_channel_buffer(),
            annotate: true,
            invocation_timeout_secs: default_ingress_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// [[pipelines]]
// ---------------------------------------------------------------------------

fn default_shard_count() -> usize {
    4
}

fn default_retention_hours() -> u64 {
    24
}

fn default_storage_prefix() -> String {
    "to-be-processed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Loader target this pipeline feeds.
    pub source: BatchSource,
    /// Bare topic filter or `SELECT * FROM '<filter>' WHERE ...` rule.
    pub topic_filter: String,
    #[serde(default)]
    pub partition: PartitionPolicy,
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    #[serde(default)]
    pub compactor: CompactorConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl PipelineConfig {
    /// `<storage_prefix>/<name>/`: every batch object of the pipeline lives here.
    pub fn object_prefix(&self) -> String {
        let root = self.storage_prefix.trim_matches('/');
        if root.is_empty() {
            format!("{}/", self.name)
        } else {
            format!("{root}/{}/", self.name)
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

fn default_buffering_interval_secs() -> u64 {
    60
}

fn default_buffering_size_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_read_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompactorConfig {
    #[serde(default = "default_buffering_interval_secs")]
    pub buffering_interval_secs: u64,
    /// Accumulated payload bytes that force a flush.
    #[serde(default = "default_buffering_size_bytes")]
    pub buffering_size_bytes: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Records fetched per shard read.
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            buffering_interval_secs: default_buffering_interval_secs(),
            buffering_size_bytes: default_buffering_size_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            read_limit: default_read_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    #[default]
    TrimHorizon,
    Latest,
}

fn default_consumer_batch_size() -> usize {
    100
}

fn default_consumer_window_secs() -> u64 {
    1
}

fn default_parallelization_factor() -> usize {
    1
}

fn default_max_bisect_depth() -> u32 {
    16
}

fn default_invocation_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_consumer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_consumer_window_secs")]
    pub max_batching_window_secs: u64,
    #[serde(default = "default_parallelization_factor")]
    pub parallelization_factor: usize,
    #[serde(default)]
    pub starting_position: StartingPosition,
    /// Retry-count ceiling for a bisected sub-range.
    #[serde(default = "default_max_bisect_depth")]
    pub max_bisect_depth: u32,
    /// Dotted JSON paths every record must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_consumer_batch_size(),
            max_batching_window_secs: default_consumer_window_secs(),
            parallelization_factor: default_parallelization_factor(),
            starting_position: StartingPosition::default(),
            max_bisect_depth: default_max_bisect_depth(),
            required_fields: Vec::new(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_visibility_timeout_secs() -> u64 {
    18 * 60
}

fn default_max_receive_count() -> u32 {
    2
}

fn default_max_concurrency() -> usize {
    3
}

fn default_queue_batch_size() -> usize {
    5
}

fn default_queue_window_secs() -> u64 {
    10
}

fn default_message_retention_secs() -> u64 {
    4 * 24 * 3600
}

fn default_dlq_retention_secs() -> u64 {
    14 * 24 * 3600
}

fn default_queue_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_queue_window_secs")]
    pub max_batching_window_secs: u64,
    #[serde(default = "default_message_retention_secs")]
    pub message_retention_secs: u64,
    #[serde(default = "default_dlq_retention_secs")]
    pub dlq_retention_secs: u64,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            max_concurrency: default_max_concurrency(),
            batch_size: default_queue_batch_size(),
            max_batching_window_secs: default_queue_window_secs(),
            message_retention_secs: default_message_retention_secs(),
            dlq_retention_secs: default_dlq_retention_secs(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// [loader], [retention], [storage], [metrics]
// ---------------------------------------------------------------------------

fn default_db_batch_size() -> usize {
    1000
}

fn default_processed_prefix() -> String {
    "processed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Rows per relational transaction.
    #[serde(default = "default_db_batch_size")]
    pub db_batch_size: usize,
    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            db_batch_size: default_db_batch_size(),
            processed_prefix: default_processed_prefix(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
        }
    }
}

fn default_days_keep() -> u64 {
    90
}

fn default_retention_interval_secs() -> u64 {
    24 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_days_keep")]
    pub days_keep: u64,
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days_keep: default_days_keep(),
            interval_secs: default_retention_interval_secs(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ObjectsBackend {
    #[default]
    Memory,
    File { root: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite { path: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub objects: ObjectsBackend,
    #[serde(default)]
    pub store: StoreBackend,
}

fn default_namespace() -> String {
    "ingest".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { namespace: default_namespace() }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pipelines.is_empty() {
            return Err(EngineError::Config("at least one pipeline is required".into()));
        }
        if self.loader.db_batch_size == 0 {
            return Err(EngineError::Config("loader.db_batch_size must be >= 1".into()));
        }
        if self.bus.channel_buffer == 0 {
            return Err(EngineError::Config("bus.channel_buffer must be >= 1".into()));
        }
        let processed = format!("{}/", self.loader.processed_prefix.trim_matches('/'));
        if processed == "/" {
            return Err(EngineError::Config("loader.processed_prefix must not be empty".into()));
        }

        for (i, p) in self.pipelines.iter().enumerate() {
            let ctx = format!("pipeline '{}'", p.name);
            if p.name.is_empty() || p.name.contains('/') {
                return Err(EngineError::Config(format!("{ctx}: name must be non-empty and contain no '/'")));
            }
            if self.pipelines[..i].iter().any(|other| other.name == p.name) {
                return Err(EngineError::Config(format!("{ctx}: duplicate name")));
            }
            TopicRule::parse(&p.topic_filter).map_err(|e| e.with_context(&ctx))?;

            let checks = [
                (p.shard_count >= 1, "shard_count"),
                (p.retention_hours >= 1, "retention_hours"),
                (p.compactor.buffering_size_bytes >= 1, "compactor.buffering_size_bytes"),
                (p.compactor.read_limit >= 1, "compactor.read_limit"),
                (p.consumer.batch_size >= 1, "consumer.batch_size"),
                (p.consumer.parallelization_factor >= 1, "consumer.parallelization_factor"),
                (p.queue.max_receive_count >= 1, "queue.max_receive_count"),
                (p.queue.max_concurrency >= 1, "queue.max_concurrency"),
                (p.queue.batch_size >= 1, "queue.batch_size"),
            ];
            if let Some((_, field)) = checks.iter().find(|(ok, _)| !ok) {
                return Err(EngineError::Config(format!("{ctx}: {field} must be >= 1")));
            }

            let prefix = p.object_prefix();
            if prefix.starts_with(&processed) || processed.starts_with(&prefix) {
                return Err(EngineError::Config(format!(
                    "{ctx}: object prefix '{prefix}' overlaps processed prefix '{processed}'"
                )));
            }
            for other in &self.pipelines[..i] {
                let theirs = other.object_prefix();
                if prefix.starts_with(&theirs) || theirs.starts_with(&prefix) {
                    return Err(EngineError::Config(format!(
                        "{ctx}: object prefix '{prefix}' overlaps pipeline '{}'",
                        other.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineConfig, EngineError> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))
    }
}
