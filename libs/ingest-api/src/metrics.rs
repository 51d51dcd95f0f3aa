pub const RECORDS_PROCESSED: &str = "RecordsProcessedNumber";
pub const RECORDS_FAILED: &str = "RecordsFailedNumber";
pub const BATCH_LATENCY: &str = "BatchLatency";
pub const RECORD_DURATION_AVG: &str = "RecordExecutionDurationAverage";
pub const OBJECTS_LOADED: &str = "ObjectsLoaded";
pub const OBJECTS_FAILED: &str = "ObjectsFailed";
pub const ROWS_INSERTED: &str = "RowsInserted";
pub const ROWS_SKIPPED: &str = "RowsSkipped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Count,
    Milliseconds,
}

/// A single data point, dimensioned by pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub pipeline: String,
    pub value: f64,
    pub unit: Unit,
}

impl Metric {
    pub fn count(name: &'static str, pipeline: &str, value: u64) -> Self {
        Self { name, pipeline: pipeline.to_string(), value: value as f64, unit: Unit::Count }
    }

    pub fn millis(name: &'static str, pipeline: &str, value: f64) -> Self {
        Self { name, pipeline: pipeline.to_string(), value, unit: Unit::Milliseconds }
    }
}

/// Operational metrics collector.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metrics: &[Metric]);
}
