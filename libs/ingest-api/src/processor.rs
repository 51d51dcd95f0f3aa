use crate::error::PluginError;
use crate::record::Record;

/// Validation or transformation applied by the stream consumer.
///
/// Must be free of side effects beyond metrics: a batch may be offered again
/// after a restart or while bisecting a failure.
pub trait RecordProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, records: &[Record]) -> Result<(), PluginError>;
}
