use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::metrics::{self, Metric, MetricsSink};
use ingest_api::object::ObjectStore;
use ingest_api::queue::{Delivery, DurableQueue, QueueMessage};
use ingest_api::record::Batch;
use ingest_api::store::{DbRow, RelationalStore};

use crate::config::LoaderConfig;
use crate::error::EngineError;
use crate::objects::relocate;
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Rows per relational transaction.
    pub db_batch_size: usize,
    pub processed_prefix: String,
}

impl From<&LoaderConfig> for LoaderSettings {
    fn from(config: &LoaderConfig) -> Self {
        Self {
            db_batch_size: config.db_batch_size.max(1),
            processed_prefix: config.processed_prefix.trim_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub inserted: usize,
    /// The object had already been moved to the processed namespace.
    pub already_processed: bool,
}

#[derive(Debug)]
pub struct ItemFailure {
    pub receipt: String,
    pub object_key: String,
    pub error: PluginError,
}

/// Per-message outcome of one loader invocation.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Receipts of messages whose object is fully loaded.
    pub succeeded: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

/// Loads batch objects into the relational store, for every pipeline.
///
/// The target table comes from the message's source tag, never from the
/// queue the message arrived on.
pub struct BatchLoader {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn RelationalStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    settings: LoaderSettings,
}

impl BatchLoader {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn RelationalStore>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        settings: LoaderSettings,
    ) -> Self {
        Self { objects, store, metrics, clock, settings }
    }

    pub fn processed_key(&self, key: &str) -> String {
        format!("{}/{key}", self.settings.processed_prefix)
    }

    /// Insert every record of the referenced batch, then move the object to
    /// the processed namespace. Safe to repeat.
    pub async fn load_object(&self, message: &QueueMessage) -> Result<LoadStats, PluginError> {
        let key = message.object_key.as_str();
        let processed = self.processed_key(key);

        let bytes = match self.objects.get(key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                if self.objects.head(&processed).await?.is_some() {
                    tracing::info!(key, "object already loaded");
                    return Ok(LoadStats { already_processed: true, ..LoadStats::default() });
                }
                return Err(e.with_context(format!("fetch '{key}'")));
            }
            Err(e) => return Err(e.with_context(format!("fetch '{key}'"))),
        };

        let batch = Batch::decode(&bytes).map_err(|e| e.with_context(format!("decode '{key}'")))?;
        if batch.pipeline != message.pipeline {
            tracing::warn!(
                key,
                batch_pipeline = %batch.pipeline,
                message_pipeline = %message.pipeline,
                "pipeline mismatch between batch and notification"
            );
        }

        let loaded_ms = self.clock.now_ms();
        let rows: Vec<DbRow> = batch
            .records
            .iter()
            .map(|r| DbRow::from_record(message.source, &batch.pipeline, r, loaded_ms))
            .collect();

        let mut inserted = 0;
        for chunk in rows.chunks(self.settings.db_batch_size) {
            inserted += self
                .store
                .insert_rows(chunk)
                .await
                .map_err(|e| e.with_context(format!("insert rows of '{key}' into {}", message.source.table())))?;
        }

        relocate(self.objects.as_ref(), key, &processed).await?;
        Ok(LoadStats { rows: rows.len(), inserted, already_processed: false })
    }

    /// Load each delivery independently; one failure never fails the others.
    pub async fn handle(&self, deliveries: &[Delivery]) -> LoadReport {
        let mut report = LoadReport::default();
        for delivery in deliveries {
            let message = &delivery.message;
            match self.load_object(message).await {
                Ok(stats) => {
                    tracing::info!(
                        pipeline = %message.pipeline,
                        key = %message.object_key,
                        rows = stats.rows,
                        inserted = stats.inserted,
                        "object loaded"
                    );
                    self.metrics.emit(&[
                        Metric::count(metrics::OBJECTS_LOADED, &message.pipeline, 1),
                        Metric::count(metrics::ROWS_INSERTED, &message.pipeline, stats.inserted as u64),
                        Metric::count(metrics::ROWS_SKIPPED, &message.pipeline, (stats.rows - stats.inserted) as u64),
                    ]);
                    report.succeeded.push(delivery.receipt.clone());
                }
                Err(error) => {
                    tracing::error!(
                        pipeline = %message.pipeline,
                        key = %message.object_key,
                        receive_count = message.receive_count,
                        retryable = error.is_transient(),
                        error = %error,
                        "object load failed"
                    );
                    self.metrics.emit(&[Metric::count(metrics::OBJECTS_FAILED, &message.pipeline, 1)]);
                    report.failures.push(ItemFailure {
                        receipt: delivery.receipt.clone(),
                        object_key: message.object_key.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}

/// Queue-driven loader invocation: acknowledges only the loaded messages.
/// Failed ones stay leased and are redelivered after the visibility timeout.
pub struct LoaderTask {
    loader: Arc<BatchLoader>,
    queue: Arc<dyn DurableQueue>,
}

impl LoaderTask {
    pub fn new(loader: Arc<BatchLoader>, queue: Arc<dyn DurableQueue>) -> Self {
        Self { loader, queue }
    }
}

impl Task for LoaderTask {
    type Event = Vec<Delivery>;

    fn name(&self) -> &str {
        self.queue.name()
    }

    fn run(
        &self,
        deliveries: Vec<Delivery>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move {
            let report = self.loader.handle(&deliveries).await;
            for receipt in &report.succeeded {
                match self.queue.ack(receipt).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(queue = %self.queue.name(), "lease expired before ack, message will be redelivered"),
                    Err(e) => tracing::warn!(queue = %self.queue.name(), error = %e, "ack failed"),
                }
            }
            if !report.failures.is_empty() {
                tracing::warn!(
                    queue = %self.queue.name(),
                    failed = report.failures.len(),
                    loaded = report.succeeded.len(),
                    "partial batch failure reported"
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;
    use crate::objects::MemoryObjectStore;
    use crate::store::MemoryStore;
    use ingest_api::clock::ManualClock;
    use ingest_api::record::{BatchSource, FlushReason, Record};

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        store: Arc<MemoryStore>,
        metrics: Arc<MemoryMetrics>,
        loader: BatchLoader,
    }

    fn fixture(db_batch_size: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000));
        let objects = Arc::new(MemoryObjectStore::new(clock.clone()));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let settings = LoaderSettings { db_batch_size, processed_prefix: "processed".into() };
        let loader = BatchLoader::new(objects.clone(), store.clone(), metrics.clone(), clock, settings);
        Fixture { objects, store, metrics, loader }
    }

    async fn put_batch(f: &Fixture, key: &str, n: usize) {
        let batch = Batch {
            pipeline: "cap".into(),
            records: (0..n)
                .map(|i| Record::new("t/cap", format!("{{\"i\":{i}}}").into_bytes(), "t/cap", 100 + i as i64))
                .collect(),
            flush_reason: FlushReason::Size,
            created_ms: 1,
        };
        f.objects.put(key, batch.encode().unwrap()).await.unwrap();
    }

    fn delivery(key: &str) -> Delivery {
        Delivery { receipt: format!("r-{key}"), message: QueueMessage::new(key, "cap", BatchSource::Cap) }
    }

    #[tokio::test]
    async fn loads_in_chunks_and_moves_object() {
        let f = fixture(3);
        put_batch(&f, "tbp/cap/1", 7).await;

        let stats = f.loader.load_object(&delivery("tbp/cap/1").message).await.unwrap();
        assert_eq!(stats, LoadStats { rows: 7, inserted: 7, already_processed: false });
        assert_eq!(f.store.count_rows(BatchSource::Cap).await.unwrap(), 7);
        assert!(f.objects.head("tbp/cap/1").await.unwrap().is_none());
        assert!(f.objects.head("processed/tbp/cap/1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reload_of_processed_object_is_a_no_op() {
        let f = fixture(1000);
        put_batch(&f, "tbp/cap/1", 4).await;
        let message = delivery("tbp/cap/1").message;

        f.loader.load_object(&message).await.unwrap();
        let again = f.loader.load_object(&message).await.unwrap();
        assert!(again.already_processed);
        assert_eq!(f.store.count_rows(BatchSource::Cap).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn failures_are_reported_per_message() {
        let f = fixture(1000);
        put_batch(&f, "tbp/cap/good", 2).await;
        f.objects.put("tbp/cap/bad", b"garbage".to_vec()).await.unwrap();

        let report = f
            .loader
            .handle(&[delivery("tbp/cap/bad"), delivery("tbp/cap/good"), delivery("tbp/cap/missing")])
            .await;

        assert_eq!(report.succeeded, vec!["r-tbp/cap/good".to_string()]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.object_key.as_str()).collect();
        assert_eq!(failed, vec!["tbp/cap/bad", "tbp/cap/missing"]);
        assert!(report.failures[1].error.is_not_found());
        assert_eq!(f.metrics.total(metrics::OBJECTS_LOADED, "cap"), 1.0);
        assert_eq!(f.metrics.total(metrics::OBJECTS_FAILED, "cap"), 2.0);
        // Bad object stays pending for inspection.
        assert!(f.objects.head("tbp/cap/bad").await.unwrap().is_some());
    }
}
