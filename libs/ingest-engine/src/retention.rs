use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::object::ObjectStore;
use ingest_api::store::RelationalStore;

use crate::error::EngineError;
use crate::task::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub rows_deleted: u64,
    pub objects_deleted: u64,
}

/// Deletes rows and objects older than the retention horizon.
///
/// Only data strictly older than `now - keep` is touched, so a run is safe
/// next to live ingestion and a repeated run deletes nothing.
pub struct RetentionJob {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    keep: Duration,
    prefixes: Vec<String>,
}

impl RetentionJob {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn RelationalStore>,
        clock: Arc<dyn Clock>,
        keep: Duration,
        prefixes: Vec<String>,
    ) -> Self {
        Self { objects, store, clock, keep, prefixes }
    }

    pub fn days(days: u64) -> Duration {
        Duration::from_secs(days * 24 * 3600)
    }

    /// Anything created strictly before this instant is expired.
    pub fn cutoff_ms(&self) -> i64 {
        self.clock.now_ms() - self.keep.as_millis() as i64
    }

    /// Best effort: every eligible object is attempted even after a failure;
    /// the first failure is returned once the pass completes.
    pub async fn run_once(&self) -> Result<RetentionReport, PluginError> {
        let cutoff = self.cutoff_ms();
        let mut report = RetentionReport::default();
        let mut first_error: Option<PluginError> = None;

        match self.store.delete_older_than(cutoff).await {
            Ok(n) => report.rows_deleted = n,
            Err(e) => {
                tracing::error!(error = %e, "row retention failed");
                first_error.get_or_insert(e.with_context("delete rows"));
            }
        }

        for prefix in &self.prefixes {
            let objects = match self.objects.list(prefix).await {
                Ok(objects) => objects,
                Err(e) => {
                    tracing::error!(prefix = %prefix, error = %e, "object listing failed");
                    first_error.get_or_insert(e.with_context(format!("list '{prefix}'")));
                    continue;
                }
            };
            for object in objects.iter().filter(|o| o.created_ms < cutoff) {
                match self.objects.delete(&object.key).await {
                    Ok(true) => report.objects_deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(key = %object.key, error = %e, "object deletion failed");
                        first_error.get_or_insert(e.with_context(format!("delete '{}'", object.key)));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl Task for RetentionJob {
    type Event = ();

    fn name(&self) -> &str {
        "retention"
    }

    fn run(&self, _tick: ()) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move {
            let report = self
                .run_once()
                .await
                .map_err(|e| EngineError::from(e.with_context("retention run, retrying next tick")))?;
            tracing::info!(
                rows_deleted = report.rows_deleted,
                objects_deleted = report.objects_deleted,
                keep_days = self.keep.as_secs() / 86_400,
                "retention run complete"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::MemoryObjectStore;
    use crate::store::MemoryStore;
    use ingest_api::clock::ManualClock;
    use ingest_api::record::{BatchSource, Record};
    use ingest_api::store::DbRow;

    const DAY_MS: i64 = 86_400_000;

    #[tokio::test]
    async fn nothing_eligible_is_a_no_op() {
        let clock = Arc::new(ManualClock::new(100 * DAY_MS));
        let objects = Arc::new(MemoryObjectStore::new(clock.clone()));
        let store = Arc::new(MemoryStore::new());
        objects.put("tbp/a/1", Vec::new()).await.unwrap();

        let job = RetentionJob::new(objects.clone(), store.clone(), clock, RetentionJob::days(90), vec!["tbp/".into()]);
        assert_eq!(job.run_once().await.unwrap(), RetentionReport::default());
        assert_eq!(job.run_once().await.unwrap(), RetentionReport::default());
        assert_eq!(objects.list("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_listed_prefixes_are_swept() {
        let clock = Arc::new(ManualClock::new(0));
        let objects = Arc::new(MemoryObjectStore::new(clock.clone()));
        objects.put("tbp/a/1", Vec::new()).await.unwrap();
        objects.put("elsewhere/1", Vec::new()).await.unwrap();
        clock.advance_ms(91 * DAY_MS);

        let job = RetentionJob::new(
            objects.clone(),
            Arc::new(MemoryStore::new()),
            clock,
            RetentionJob::days(90),
            vec!["tbp/".into()],
        );
        let report = job.run_once().await.unwrap();
        assert_eq!(report.objects_deleted, 1);
        assert!(objects.head("elsewhere/1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rows_use_record_receive_time() {
        let clock = Arc::new(ManualClock::new(200 * DAY_MS));
        let store = Arc::new(MemoryStore::new());
        let old = Record::new("t", b"old".to_vec(), "t", 10 * DAY_MS);
        let fresh = Record::new("t", b"fresh".to_vec(), "t", 150 * DAY_MS);
        store
            .insert_rows(&[
                DbRow::from_record(BatchSource::SurfaceObs, "obs", &old, 0),
                DbRow::from_record(BatchSource::SurfaceObs, "obs", &fresh, 0),
            ])
            .await
            .unwrap();

        let job = RetentionJob::new(
            Arc::new(MemoryObjectStore::new(clock.clone())),
            store.clone(),
            clock,
            RetentionJob::days(90),
            Vec::new(),
        );
        assert_eq!(job.run_once().await.unwrap().rows_deleted, 1);
        assert_eq!(store.rows(BatchSource::SurfaceObs)[0].payload, b"fresh");
    }
}
