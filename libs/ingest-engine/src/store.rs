use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use ingest_api::error::PluginError;
use ingest_api::record::BatchSource;
use ingest_api::store::{DbRow, RelationalStore};

/// In-memory relational store: one table per batch source, keyed by dedup key.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<BatchSource, BTreeMap<String, DbRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BatchSource, BTreeMap<String, DbRow>>> {
        match self.tables.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("memory store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Snapshot of one table ordered by dedup key.
    pub fn rows(&self, source: BatchSource) -> Vec<DbRow> {
        self.lock()
            .get(&source)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl RelationalStore for MemoryStore {
    fn insert_rows<'a>(
        &'a self,
        rows: &'a [DbRow],
    ) -> Pin<Box<dyn Future<Output = Result<usize, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(bad) = rows.iter().find(|r| r.dedup_key.is_empty()) {
                return Err(PluginError::validation(format!(
                    "row for topic '{}' has an empty dedup key",
                    bad.topic
                )));
            }
            let mut tables = self.lock();
            let mut inserted = 0;
            for row in rows {
                let table = tables.entry(row.source).or_default();
                if !table.contains_key(&row.dedup_key) {
                    table.insert(row.dedup_key.clone(), row.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    fn delete_older_than(
        &self,
        cutoff_ms: i64,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>> {
        Box::pin(async move {
            let mut tables = self.lock();
            let mut removed = 0u64;
            for table in tables.values_mut() {
                let before = table.len();
                table.retain(|_, row| row.received_ms >= cutoff_ms);
                removed += (before - table.len()) as u64;
            }
            Ok(removed)
        })
    }

    fn count_rows(
        &self,
        source: BatchSource,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PluginError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().get(&source).map_or(0, |t| t.len() as u64)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_api::record::Record;

    fn row(payload: &str, received_ms: i64) -> DbRow {
        let record = Record::new("t", payload.as_bytes().to_vec(), "t", received_ms);
        DbRow::from_record(BatchSource::Notifications, "notifications", &record, 0)
    }

    #[tokio::test]
    async fn conflicting_rows_are_skipped() {
        let store = MemoryStore::new();
        let rows = vec![row("a", 1), row("b", 2)];
        assert_eq!(store.insert_rows(&rows).await.unwrap(), 2);
        assert_eq!(store.insert_rows(&rows).await.unwrap(), 0);
        assert_eq!(store.count_rows(BatchSource::Notifications).await.unwrap(), 2);
        assert_eq!(store.count_rows(BatchSource::Cap).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_dedup_key_rejects_whole_batch() {
        let store = MemoryStore::new();
        let mut bad = row("b", 2);
        bad.dedup_key.clear();
        assert!(store.insert_rows(&[row("a", 1), bad]).await.is_err());
        assert_eq!(store.count_rows(BatchSource::Notifications).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_is_strictly_older() {
        let store = MemoryStore::new();
        store.insert_rows(&[row("a", 99), row("b", 100), row("c", 101)]).await.unwrap();
        assert_eq!(store.delete_older_than(100).await.unwrap(), 1);
        assert_eq!(store.delete_older_than(100).await.unwrap(), 0);
        let left: Vec<i64> = store.rows(BatchSource::Notifications).iter().map(|r| r.received_ms).collect();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|ms| *ms >= 100));
    }
}
