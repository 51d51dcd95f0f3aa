use std::future::Future;
use std::pin::Pin;

use sha2::{Digest, Sha256};

use crate::error::PluginError;
use crate::record::{BatchSource, Record};

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRow {
    pub source: BatchSource,
    /// Content-derived natural key; a second insert with the same key is skipped.
    pub dedup_key: String,
    pub pipeline: String,
    pub topic: String,
    pub partition_key: String,
    pub received_ms: i64,
    pub loaded_ms: i64,
    pub payload: Vec<u8>,
}

impl DbRow {
    pub fn from_record(source: BatchSource, pipeline: &str, record: &Record, loaded_ms: i64) -> Self {
        Self {
            source,
            dedup_key: dedup_key(&record.topic, &record.payload),
            pipeline: pipeline.to_string(),
            topic: record.topic.clone(),
            partition_key: record.partition_key.clone(),
            received_ms: record.enqueue_ms,
            loaded_ms,
            payload: record.payload.clone(),
        }
    }
}

/// Hex SHA-256 over `topic \0 payload`.
pub fn dedup_key(topic: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Relational target for the loader and the retention job.
pub trait RelationalStore: Send + Sync {
    /// Insert all rows in one transaction, skipping rows whose dedup key
    /// already exists. Returns the number of rows actually inserted.
    fn insert_rows<'a>(
        &'a self,
        rows: &'a [DbRow],
    ) -> Pin<Box<dyn Future<Output = Result<usize, PluginError>> + Send + 'a>>;

    /// Delete rows received strictly before `cutoff_ms`. Returns rows removed.
    fn delete_older_than(
        &self,
        cutoff_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>>;

    fn count_rows(
        &self,
        source: BatchSource,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_depends_on_topic_and_payload() {
        let a = dedup_key("t/1", b"{}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, dedup_key("t/1", b"{}"));
        assert_ne!(a, dedup_key("t/2", b"{}"));
        assert_ne!(a, dedup_key("t/1", b"{ }"));
    }

    #[test]
    fn row_keeps_record_time() {
        let record = Record::new("t/1", b"{}".to_vec(), "t/1", 42);
        let row = DbRow::from_record(BatchSource::Cap, "cap", &record, 99);
        assert_eq!(row.received_ms, 42);
        assert_eq!(row.loaded_ms, 99);
        assert_eq!(row.source.table(), "cap_alerts");
    }
}
