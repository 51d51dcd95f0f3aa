use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ingest_api::error::PluginError;
use ingest_api::metrics::{self, Metric, MetricsSink};
use ingest_api::processor::RecordProcessor;
use ingest_api::record::Record;
use ingest_api::stream::StreamBuffer;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConsumerConfig, StartingPosition};

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub max_batching_window: Duration,
    pub parallelization_factor: usize,
    pub starting_position: StartingPosition,
    pub max_bisect_depth: u32,
    pub invocation_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_batching_window: Duration::from_secs(config.max_batching_window_secs),
            parallelization_factor: config.parallelization_factor.max(1),
            starting_position: config.starting_position,
            max_bisect_depth: config.max_bisect_depth,
            invocation_timeout: Duration::from_secs(config.invocation_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Bisect-on-error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FailedRange {
    pub range: Range<usize>,
    pub error: PluginError,
}

#[derive(Debug, Default)]
pub struct BisectOutcome {
    pub succeeded: usize,
    pub failed: Vec<FailedRange>,
    /// Calls made to the processor.
    pub invocations: usize,
    /// Deepest split level reached, counting the initial attempt as 1.
    pub rounds: u32,
}

impl BisectOutcome {
    pub fn failed_records(&self) -> usize {
        self.failed.iter().map(|f| f.range.len()).sum()
    }
}

/// Retry a failing batch by halves until every sub-range succeeds or is
/// isolated.
///
/// Work is an explicit stack of `(range, depth)`. A range fails permanently
/// when it is a single record or reached `max_depth` splits.
pub fn bisect<F>(records: &[Record], max_depth: u32, mut attempt: F) -> BisectOutcome
where
    F: FnMut(&[Record]) -> Result<(), PluginError>,
{
    let mut outcome = BisectOutcome::default();
    if records.is_empty() {
        return outcome;
    }

    let mut stack: Vec<(Range<usize>, u32)> = vec![(0..records.len(), 0)];
    while let Some((range, depth)) = stack.pop() {
        outcome.invocations += 1;
        outcome.rounds = outcome.rounds.max(depth + 1);
        match attempt(&records[range.clone()]) {
            Ok(()) => outcome.succeeded += range.len(),
            Err(error) if range.len() == 1 || depth >= max_depth => {
                outcome.failed.push(FailedRange { range, error });
            }
            Err(_) => {
                let mid = range.start + range.len() / 2;
                // Left half on top so records are retried in stream order.
                stack.push((mid..range.end, depth + 1));
                stack.push((range.start..mid, depth + 1));
            }
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// StreamConsumer
// ---------------------------------------------------------------------------

/// Parallel validating reader of one pipeline's stream.
///
/// Runs independently of the compactor; failures only reach logs and metrics.
pub struct StreamConsumer {
    pipeline: String,
    stream: Arc<dyn StreamBuffer>,
    processor: Arc<dyn RecordProcessor>,
    metrics: Arc<dyn MetricsSink>,
    settings: ConsumerSettings,
}

struct ShardCursor {
    shard: usize,
    offset: u64,
    pending: Vec<Record>,
    pending_since: Option<Instant>,
}

impl StreamConsumer {
    pub fn new(
        pipeline: impl Into<String>,
        stream: Arc<dyn StreamBuffer>,
        processor: Arc<dyn RecordProcessor>,
        metrics: Arc<dyn MetricsSink>,
        settings: ConsumerSettings,
    ) -> Self {
        Self { pipeline: pipeline.into(), stream, processor, metrics, settings }
    }

    /// Disjoint shard sets, one per worker. Never more workers than shards.
    pub fn shard_assignment(&self) -> Vec<Vec<usize>> {
        let shards = self.stream.shard_count();
        let workers = self.settings.parallelization_factor.min(shards).max(1);
        (0..workers)
            .map(|w| (w..shards).step_by(workers).collect())
            .collect()
    }

    /// Validate one batch, bisecting on failure, and emit its metrics.
    pub fn process_batch(&self, records: &[Record]) -> BisectOutcome {
        self.process_with(records, |chunk| self.processor.process(chunk))
    }

    /// [`Self::process_batch`] with every processor call bounded by the
    /// invocation timeout. Runs on a blocking thread of the runtime behind `handle`.
    fn process_with_deadline(&self, handle: &Handle, records: &[Record]) -> BisectOutcome {
        self.process_with(records, |chunk| self.attempt_with_deadline(handle, chunk))
    }

    /// A call that outlives the deadline counts as a failed attempt, so its
    /// range is split like any other failure. The abandoned call keeps its
    /// blocking thread until the processor returns.
    fn attempt_with_deadline(&self, handle: &Handle, chunk: &[Record]) -> Result<(), PluginError> {
        let processor = Arc::clone(&self.processor);
        let chunk = chunk.to_vec();
        let deadline = self.settings.invocation_timeout;
        handle.block_on(async move {
            let call = tokio::task::spawn_blocking(move || processor.process(&chunk));
            match tokio::time::timeout(deadline, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(PluginError::logic(format!("processor call aborted: {e}"))),
                Err(_) => Err(PluginError::timeout(format!("processor call exceeded {deadline:?}"))),
            }
        })
    }

    fn process_with<F>(&self, records: &[Record], attempt: F) -> BisectOutcome
    where
        F: FnMut(&[Record]) -> Result<(), PluginError>,
    {
        let started = Instant::now();
        let outcome = bisect(records, self.settings.max_bisect_depth, attempt);

        for failed in &outcome.failed {
            for record in &records[failed.range.clone()] {
                tracing::error!(
                    pipeline = %self.pipeline,
                    processor = %self.processor.name(),
                    topic = %record.topic,
                    partition_key = %record.partition_key,
                    transient = failed.error.is_transient(),
                    error = %failed.error,
                    "record isolated as permanent failure"
                );
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let per_record = if records.is_empty() { 0.0 } else { elapsed_ms / records.len() as f64 };
        self.metrics.emit(&[
            Metric::count(metrics::RECORDS_PROCESSED, &self.pipeline, outcome.succeeded as u64),
            Metric::count(metrics::RECORDS_FAILED, &self.pipeline, outcome.failed_records() as u64),
            Metric::millis(metrics::BATCH_LATENCY, &self.pipeline, elapsed_ms),
            Metric::millis(metrics::RECORD_DURATION_AVG, &self.pipeline, per_record),
        ]);
        if outcome.invocations > 1 {
            tracing::debug!(
                pipeline = %self.pipeline,
                records = records.len(),
                invocations = outcome.invocations,
                rounds = outcome.rounds,
                "batch bisected"
            );
        }
        outcome
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        self.shard_assignment()
            .into_iter()
            .enumerate()
            .map(|(worker, shards)| tokio::spawn(self.clone().run_worker(worker, shards, token.clone())))
            .collect()
    }

    fn start_offset(&self, shard: usize) -> u64 {
        let offset = match self.settings.starting_position {
            StartingPosition::TrimHorizon => self.stream.trim_horizon(shard),
            StartingPosition::Latest => self.stream.latest(shard),
        };
        offset.unwrap_or_else(|e| {
            tracing::warn!(pipeline = %self.pipeline, shard, error = %e, "no starting offset, using 0");
            0
        })
    }

    async fn run_worker(self: Arc<Self>, worker: usize, shards: Vec<usize>, token: CancellationToken) {
        tracing::info!(pipeline = %self.pipeline, worker, shards = ?shards, "stream consumer started");
        let mut cursors: Vec<ShardCursor> = shards
            .into_iter()
            .map(|shard| {
                let offset = self.start_offset(shard);
                ShardCursor { shard, offset, pending: Vec::new(), pending_since: None }
            })
            .collect();

        while !token.is_cancelled() {
            let mut progressed = false;
            for cursor in cursors.iter_mut() {
                self.fill(cursor);
                let due = cursor.pending.len() >= self.settings.batch_size
                    || cursor
                        .pending_since
                        .is_some_and(|since| since.elapsed() >= self.settings.max_batching_window);
                if due {
                    self.invoke(cursor).await;
                    progressed = true;
                }
            }
            if !progressed {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        tracing::info!(pipeline = %self.pipeline, worker, "stream consumer stopped");
    }

    fn fill(&self, cursor: &mut ShardCursor) {
        let want = self.settings.batch_size.saturating_sub(cursor.pending.len());
        if want == 0 {
            return;
        }
        match self.stream.read(cursor.shard, cursor.offset, want) {
            Ok(read) => {
                if read.expired > 0 {
                    tracing::warn!(
                        pipeline = %self.pipeline,
                        shard = cursor.shard,
                        expired = read.expired,
                        "consumer fell behind retention, records lost"
                    );
                }
                if !read.entries.is_empty() {
                    if cursor.pending.is_empty() {
                        cursor.pending_since = Some(Instant::now());
                    }
                    cursor.pending.extend(read.entries.into_iter().map(|e| e.record));
                }
                cursor.offset = cursor.offset.max(read.next_offset);
            }
            Err(e) => {
                tracing::warn!(pipeline = %self.pipeline, shard = cursor.shard, error = %e, "stream read failed");
            }
        }
    }

    /// Process the pending batch. Timeouts are handled per processor call
    /// inside the bisection, so the shard always moves past the batch.
    async fn invoke(self: &Arc<Self>, cursor: &mut ShardCursor) {
        let batch = std::mem::take(&mut cursor.pending);
        cursor.pending_since = None;
        let consumer = Arc::clone(self);
        let handle = Handle::current();
        let work = tokio::task::spawn_blocking(move || consumer.process_with_deadline(&handle, &batch));

        if let Err(e) = work.await {
            tracing::error!(pipeline = %self.pipeline, shard = cursor.shard, error = %e, "consumer invocation aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;
    use crate::stream::MemoryStream;
    use crate::validate::JsonValidator;
    use ingest_api::clock::ManualClock;
    use proptest::prelude::*;

    fn records(n: usize, poison: &[usize]) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let payload = if poison.contains(&i) { "not json".to_string() } else { format!("{{\"i\":{i}}}") };
                Record::new("t", payload.into_bytes(), format!("k{i}"), 0)
            })
            .collect()
    }

    fn validate(chunk: &[Record]) -> Result<(), PluginError> {
        JsonValidator::default().process(chunk)
    }

    #[test]
    fn clean_batch_is_one_invocation() {
        let outcome = bisect(&records(50, &[]), 16, validate);
        assert_eq!(outcome.succeeded, 50);
        assert_eq!(outcome.invocations, 1);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn depth_ceiling_fails_whole_subrange() {
        let outcome = bisect(&records(8, &[3]), 1, validate);
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].range, 0..4);
    }

    #[test]
    fn multiple_poison_records_are_all_isolated() {
        let outcome = bisect(&records(20, &[0, 7, 19]), 16, validate);
        let isolated: Vec<usize> = outcome.failed.iter().map(|f| f.range.start).collect();
        assert_eq!(isolated, vec![0, 7, 19]);
        assert_eq!(outcome.succeeded, 17);
    }

    proptest! {
        #[test]
        fn single_poison_isolated_in_log_rounds(n in 1usize..600, seed in any::<usize>()) {
            let poison = seed % n;
            let outcome = bisect(&records(n, &[poison]), 32, validate);

            prop_assert_eq!(outcome.failed.len(), 1);
            prop_assert_eq!(outcome.failed[0].range.clone(), poison..poison + 1);
            prop_assert_eq!(outcome.succeeded, n - 1);

            let log2 = usize::BITS - (n - 1).leading_zeros();
            prop_assert!(outcome.rounds <= log2 + 1);
            prop_assert!(outcome.invocations <= 2 * log2 as usize + 1);
        }
    }

    fn consumer(shards: usize, factor: usize, metrics: Arc<MemoryMetrics>) -> (Arc<MemoryStream>, StreamConsumer) {
        let clock = Arc::new(ManualClock::new(0));
        let stream = Arc::new(MemoryStream::new("obs", shards, Duration::from_secs(3600), clock));
        let config = ConsumerConfig { parallelization_factor: factor, batch_size: 10, ..ConsumerConfig::default() };
        let consumer = StreamConsumer::new(
            "obs",
            stream.clone(),
            Arc::new(JsonValidator::default()),
            metrics,
            ConsumerSettings::from(&config),
        );
        (stream, consumer)
    }

    #[test]
    fn shard_sets_are_disjoint_and_complete() {
        let (_, c) = consumer(10, 3, Arc::new(MemoryMetrics::new()));
        let sets = c.shard_assignment();
        assert_eq!(sets.len(), 3);
        let mut all: Vec<usize> = sets.concat();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        let (_, c) = consumer(2, 10, Arc::new(MemoryMetrics::new()));
        assert_eq!(c.shard_assignment(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn process_batch_emits_metrics() {
        let metrics = Arc::new(MemoryMetrics::new());
        let (_, c) = consumer(1, 1, metrics.clone());
        let outcome = c.process_batch(&records(16, &[5]));
        assert_eq!(outcome.succeeded, 15);
        assert_eq!(metrics.total(metrics::RECORDS_PROCESSED, "obs"), 15.0);
        assert_eq!(metrics.total(metrics::RECORDS_FAILED, "obs"), 1.0);
    }

    /// Sleeps past any short deadline when it sees the marked payload.
    struct SlowOn(&'static [u8]);

    impl RecordProcessor for SlowOn {
        fn name(&self) -> &str {
            "slow-on"
        }

        fn process(&self, records: &[Record]) -> Result<(), PluginError> {
            if records.iter().any(|r| r.payload == self.0) {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_record_is_isolated_and_shard_moves_on() {
        let metrics = Arc::new(MemoryMetrics::new());
        let stream = Arc::new(MemoryStream::new("obs", 1, Duration::from_secs(3600), Arc::new(ManualClock::new(0))));
        for r in records(8, &[]) {
            stream.append(r).unwrap();
        }
        let settings = ConsumerSettings {
            batch_size: 8,
            invocation_timeout: Duration::from_millis(50),
            ..ConsumerSettings::from(&ConsumerConfig::default())
        };
        let c = StreamConsumer::new("obs", stream, Arc::new(SlowOn(b"{\"i\":5}")), metrics.clone(), settings);

        let token = CancellationToken::new();
        let handles = Arc::new(c).spawn(token.clone());
        for _ in 0..150 {
            let done = metrics.total(metrics::RECORDS_PROCESSED, "obs")
                + metrics.total(metrics::RECORDS_FAILED, "obs");
            if done >= 8.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // A replayed batch would keep adding to the totals.
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(metrics.total(metrics::RECORDS_PROCESSED, "obs"), 7.0);
        assert_eq!(metrics.total(metrics::RECORDS_FAILED, "obs"), 1.0);
    }

    #[tokio::test]
    async fn workers_drain_stream_from_trim_horizon() {
        let metrics = Arc::new(MemoryMetrics::new());
        let (stream, c) = consumer(4, 2, metrics.clone());
        for r in records(40, &[13]) {
            stream.append(r).unwrap();
        }

        let token = CancellationToken::new();
        let handles = Arc::new(c).spawn(token.clone());
        for _ in 0..200 {
            let done = metrics.total(metrics::RECORDS_PROCESSED, "obs")
                + metrics.total(metrics::RECORDS_FAILED, "obs");
            if done >= 40.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        token.cancel();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(metrics.total(metrics::RECORDS_PROCESSED, "obs"), 39.0);
        assert_eq!(metrics.total(metrics::RECORDS_FAILED, "obs"), 1.0);
    }
}
