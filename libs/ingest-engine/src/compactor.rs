use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::object::{ObjectMeta, ObjectStore};
use ingest_api::record::{Batch, FlushReason, Record};
use ingest_api::stream::StreamBuffer;
use tokio_util::sync::CancellationToken;

use crate::config::CompactorConfig;

#[derive(Debug, Clone, Copy)]
pub struct CompactorSettings {
    pub buffering_interval: Duration,
    pub buffering_size_bytes: usize,
    pub read_limit: usize,
    pub poll_interval: Duration,
}

impl From<&CompactorConfig> for CompactorSettings {
    fn from(config: &CompactorConfig) -> Self {
        Self {
            buffering_interval: Duration::from_secs(config.buffering_interval_secs),
            buffering_size_bytes: config.buffering_size_bytes,
            read_limit: config.read_limit,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Drains every shard of a pipeline's stream into batch objects.
///
/// Two offset vectors are kept per shard: `cursor` (read so far) and
/// `committed` (durably written). A failed write rewinds `cursor` to
/// `committed`, so the same records are read again into the next batch.
pub struct BatchCompactor {
    pipeline: String,
    object_prefix: String,
    stream: Arc<dyn StreamBuffer>,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    settings: CompactorSettings,
    committed: Vec<u64>,
    cursor: Vec<u64>,
    /// Shard the next poll reads first; rotates so a busy shard cannot
    /// fill every batch on its own.
    next_shard: usize,
    pending: Vec<Record>,
    pending_bytes: usize,
    first_pending_ms: Option<i64>,
}

impl BatchCompactor {
    /// Starts from the trim horizon of every shard.
    pub fn new(
        pipeline: impl Into<String>,
        object_prefix: impl Into<String>,
        stream: Arc<dyn StreamBuffer>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        settings: CompactorSettings,
    ) -> Result<Self, PluginError> {
        let committed = (0..stream.shard_count())
            .map(|shard| stream.trim_horizon(shard))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            pipeline: pipeline.into(),
            object_prefix: object_prefix.into(),
            stream,
            objects,
            clock,
            settings,
            cursor: committed.clone(),
            committed,
            next_shard: 0,
            pending: Vec::new(),
            pending_bytes: 0,
            first_pending_ms: None,
        })
    }

    /// Offsets up to which records are durably written, per shard.
    pub fn committed(&self) -> &[u64] {
        &self.committed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Read what is available and flush if a threshold is reached.
    ///
    /// Returns the written object when a flush happened.
    pub async fn poll(&mut self) -> Result<Option<ObjectMeta>, PluginError> {
        let now = self.clock.now_ms();
        let shards = self.cursor.len();
        let start = if shards == 0 { 0 } else { self.next_shard % shards };
        self.next_shard = if shards == 0 { 0 } else { (start + 1) % shards };

        for shard in (start..shards).chain(0..start) {
            if self.pending_bytes >= self.settings.buffering_size_bytes {
                break;
            }
            let read = self.stream.read(shard, self.cursor[shard], self.settings.read_limit)?;
            if read.expired > 0 {
                tracing::warn!(
                    pipeline = %self.pipeline,
                    shard,
                    expired = read.expired,
                    "records aged out of the stream before compaction"
                );
            }
            if read.entries.is_empty() {
                self.cursor[shard] = self.cursor[shard].max(read.next_offset);
                continue;
            }
            for entry in read.entries {
                if self.pending_bytes >= self.settings.buffering_size_bytes {
                    break;
                }
                if self.pending.is_empty() {
                    self.first_pending_ms = Some(now);
                }
                self.pending_bytes += entry.record.payload.len();
                self.pending.push(entry.record);
                self.cursor[shard] = entry.offset + 1;
            }
        }

        if self.pending_bytes >= self.settings.buffering_size_bytes {
            return self.flush(FlushReason::Size).await;
        }
        let interval_ms = self.settings.buffering_interval.as_millis() as i64;
        match self.first_pending_ms {
            Some(first) if now - first >= interval_ms => self.flush(FlushReason::Time).await,
            _ => Ok(None),
        }
    }

    /// Write pending records as one object. On failure nothing is committed
    /// and the read cursor rewinds to the last committed offsets.
    pub async fn flush(&mut self, reason: FlushReason) -> Result<Option<ObjectMeta>, PluginError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let created_ms = self.clock.now_ms();
        let batch = Batch {
            pipeline: self.pipeline.clone(),
            records: std::mem::take(&mut self.pending),
            flush_reason: reason,
            created_ms,
        };
        self.pending_bytes = 0;
        self.first_pending_ms = None;

        let key = self.object_key(created_ms);
        let written = match batch.encode() {
            Ok(bytes) => self.objects.put(&key, bytes).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(meta) => {
                self.committed.clone_from(&self.cursor);
                tracing::info!(
                    pipeline = %self.pipeline,
                    key = %meta.key,
                    records = batch.records.len(),
                    reason = ?reason,
                    "batch flushed"
                );
                Ok(Some(meta))
            }
            Err(e) => {
                self.cursor.clone_from(&self.committed);
                Err(e.with_context(format!("write batch '{key}'")))
            }
        }
    }

    fn object_key(&self, created_ms: i64) -> String {
        let hour_path = DateTime::from_timestamp_millis(created_ms)
            .map(|t| t.format("%Y/%m/%d/%H").to_string())
            .unwrap_or_else(|| "undated".to_string());
        format!(
            "{}{hour_path}/{created_ms}-{:08x}",
            self.object_prefix,
            rand::random::<u32>()
        )
    }

    /// Poll until cancelled, then flush whatever is pending.
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(pipeline = %self.pipeline, shards = self.cursor.len(), "compactor started");
        loop {
            let idle = match self.poll().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(pipeline = %self.pipeline, error = %e, "compaction failed, will re-read");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        if let Err(e) = self.flush(FlushReason::Time).await {
            tracing::error!(pipeline = %self.pipeline, error = %e, "final flush failed");
        }
        tracing::info!(pipeline = %self.pipeline, "compactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::MemoryObjectStore;
    use crate::stream::MemoryStream;
    use ingest_api::clock::ManualClock;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        stream: Arc<MemoryStream>,
        objects: Arc<MemoryObjectStore>,
    }

    fn fixture(shards: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let stream = Arc::new(MemoryStream::new("obs", shards, Duration::from_secs(86_400), clock.clone()));
        let objects = Arc::new(MemoryObjectStore::new(clock.clone()));
        Fixture { clock, stream, objects }
    }

    fn settings(size: usize) -> CompactorSettings {
        CompactorSettings {
            buffering_interval: Duration::from_secs(60),
            buffering_size_bytes: size,
            read_limit: 100,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn append(f: &Fixture, n: usize) {
        for i in 0..n {
            let key = format!("k{i}");
            f.stream
                .append(Record::new("t", format!("{{\"n\":{i}}}").into_bytes(), key, f.clock.now_ms()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn flushes_on_time_window() {
        let f = fixture(3);
        let mut compactor =
            BatchCompactor::new("obs", "tbp/obs/", f.stream.clone(), f.objects.clone(), f.clock.clone(), settings(1 << 20))
                .unwrap();
        append(&f, 10);

        assert!(compactor.poll().await.unwrap().is_none());
        assert_eq!(compactor.pending_len(), 10);
        f.clock.advance_ms(59_999);
        assert!(compactor.poll().await.unwrap().is_none());
        f.clock.advance_ms(1);
        let meta = compactor.poll().await.unwrap().unwrap();

        assert!(meta.key.starts_with("tbp/obs/2023/11/14/22/"), "{}", meta.key);
        let batch = Batch::decode(&f.objects.get(&meta.key).await.unwrap()).unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Time);
        assert_eq!(batch.records.len(), 10);
        assert_eq!(compactor.committed().iter().sum::<u64>(), 10);
    }

    #[tokio::test]
    async fn flushes_on_size_without_duplicates() {
        let f = fixture(2);
        let mut compactor =
            BatchCompactor::new("obs", "tbp/obs/", f.stream.clone(), f.objects.clone(), f.clock.clone(), settings(40))
                .unwrap();
        append(&f, 12);

        let mut seen = Vec::new();
        while let Some(meta) = compactor.poll().await.unwrap() {
            let batch = Batch::decode(&f.objects.get(&meta.key).await.unwrap()).unwrap();
            assert_eq!(batch.flush_reason, FlushReason::Size);
            assert!(batch.payload_bytes() >= 40);
            seen.extend(batch.records.into_iter().map(|r| r.payload));
        }
        seen.extend(compactor.pending.iter().map(|r| r.payload.clone()));

        let before = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(before, 12);
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn busy_shard_does_not_starve_quiet_shard() {
        let f = fixture(2);
        let key_for = |shard: usize| {
            (0..)
                .map(|i| format!("key-{i}"))
                .find(|k| ingest_api::stream::shard_for(k, 2) == shard)
                .unwrap()
        };
        let (busy, quiet) = (key_for(0), key_for(1));
        let mut compactor =
            BatchCompactor::new("obs", "tbp/obs/", f.stream.clone(), f.objects.clone(), f.clock.clone(), settings(40))
                .unwrap();

        f.stream.append(Record::new("t", b"{\"quiet\":1}".to_vec(), quiet, f.clock.now_ms())).unwrap();
        for round in 0..10 {
            for i in 0..5 {
                let payload = format!("{{\"r\":{round},\"i\":{i}}}").into_bytes();
                f.stream.append(Record::new("t", payload, busy.clone(), f.clock.now_ms())).unwrap();
            }
            compactor.poll().await.unwrap();
        }

        assert_eq!(compactor.committed()[1], 1, "quiet shard never drained: {:?}", compactor.committed());
        assert!(compactor.committed()[0] > 0);
    }

    struct FlakyStore {
        inner: MemoryObjectStore,
        fail: AtomicBool,
    }

    impl ObjectStore for FlakyStore {
        fn put<'a>(
            &'a self,
            key: &'a str,
            bytes: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
            if self.fail.load(Ordering::SeqCst) {
                return Box::pin(async { Err(PluginError::io("storage unreachable")) });
            }
            self.inner.put(key, bytes)
        }

        fn put_created_at<'a>(
            &'a self,
            key: &'a str,
            bytes: Vec<u8>,
            created_ms: i64,
        ) -> Pin<Box<dyn Future<Output = Result<ObjectMeta, PluginError>> + Send + 'a>> {
            self.inner.put_created_at(key, bytes, created_ms)
        }

        fn get<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, PluginError>> + Send + 'a>> {
            self.inner.get(key)
        }

        fn head<'a>(
            &'a self,
            key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectMeta>, PluginError>> + Send + 'a>> {
            self.inner.head(key)
        }

        fn list<'a>(
            &'a self,
            prefix: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectMeta>, PluginError>> + Send + 'a>> {
            self.inner.list(prefix)
        }

        fn delete<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>> {
            self.inner.delete(key)
        }
    }

    #[tokio::test]
    async fn failed_write_does_not_advance_offsets() {
        let f = fixture(1);
        let store = Arc::new(FlakyStore { inner: MemoryObjectStore::new(f.clock.clone()), fail: AtomicBool::new(true) });
        let mut compactor =
            BatchCompactor::new("obs", "tbp/obs/", f.stream.clone(), store.clone(), f.clock.clone(), settings(1 << 20))
                .unwrap();
        append(&f, 4);

        compactor.poll().await.unwrap();
        f.clock.advance_ms(60_000);
        assert!(compactor.poll().await.is_err());
        assert_eq!(compactor.committed(), &[0]);
        assert_eq!(compactor.pending_len(), 0);

        store.fail.store(false, Ordering::SeqCst);
        compactor.poll().await.unwrap();
        f.clock.advance_ms(60_000);
        let meta = compactor.poll().await.unwrap().unwrap();
        let batch = Batch::decode(&store.get(&meta.key).await.unwrap()).unwrap();
        assert_eq!(batch.records.len(), 4);
        assert_eq!(compactor.committed(), &[4]);
    }
}
