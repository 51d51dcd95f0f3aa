use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::record::Record;
use ingest_api::stream::{AppendResult, ShardRead, StreamBuffer, StreamEntry, shard_for};

#[derive(Debug, Default)]
struct Shard {
    /// Offset of `records[0]`.
    base_offset: u64,
    records: VecDeque<Record>,
}

impl Shard {
    fn next_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }

    /// Index of the first record still inside the retention window.
    fn first_live(&self, cutoff_ms: i64) -> usize {
        self.records.partition_point(|r| r.enqueue_ms < cutoff_ms)
    }

    fn evict(&mut self, cutoff_ms: i64) {
        let expired = self.first_live(cutoff_ms);
        self.records.drain(..expired);
        self.base_offset += expired as u64;
    }
}

/// In-memory sharded stream with time-based retention.
///
/// Each shard is an append-only deque; expired records are dropped lazily on
/// append and treated as unreadable on read.
pub struct MemoryStream {
    name: String,
    shards: Vec<RwLock<Shard>>,
    retention_ms: i64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl MemoryStream {
    pub fn new(name: impl Into<String>, shard_count: usize, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            shards: (0..shard_count.max(1)).map(|_| RwLock::new(Shard::default())).collect(),
            retention_ms: retention.as_millis() as i64,
            clock,
        }
    }

    fn cutoff_ms(&self) -> i64 {
        self.clock.now_ms() - self.retention_ms
    }

    fn shard(&self, shard: usize) -> Result<&RwLock<Shard>, PluginError> {
        self.shards.get(shard).ok_or_else(|| {
            PluginError::logic(format!("stream '{}' has no shard {shard}", self.name))
        })
    }

    fn read_lock<'a>(&self, lock: &'a RwLock<Shard>) -> RwLockReadGuard<'a, Shard> {
        match lock.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(stream = %self.name, "shard read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock<'a>(&self, lock: &'a RwLock<Shard>) -> RwLockWriteGuard<'a, Shard> {
        match lock.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(stream = %self.name, "shard write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl StreamBuffer for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn append(&self, record: Record) -> Result<AppendResult, PluginError> {
        let shard = shard_for(&record.partition_key, self.shards.len());
        let mut guard = self.write_lock(self.shard(shard)?);
        guard.evict(self.cutoff_ms());
        let offset = guard.next_offset();
        guard.records.push_back(record);
        Ok(AppendResult { shard, offset })
    }

    fn read(&self, shard: usize, from_offset: u64, limit: usize) -> Result<ShardRead, PluginError> {
        let cutoff = self.cutoff_ms();
        let guard = self.read_lock(self.shard(shard)?);

        let horizon = guard.base_offset + guard.first_live(cutoff) as u64;
        let start = from_offset.max(horizon);
        let expired = horizon.saturating_sub(from_offset);

        let skip = (start - guard.base_offset) as usize;
        let entries: Vec<StreamEntry> = guard
            .records
            .iter()
            .skip(skip)
            .take(limit)
            .enumerate()
            .map(|(i, record)| StreamEntry { offset: start + i as u64, record: record.clone() })
            .collect();

        let next_offset = start + entries.len() as u64;
        Ok(ShardRead { entries, next_offset, expired })
    }

    fn trim_horizon(&self, shard: usize) -> Result<u64, PluginError> {
        let cutoff = self.cutoff_ms();
        let guard = self.read_lock(self.shard(shard)?);
        Ok(guard.base_offset + guard.first_live(cutoff) as u64)
    }

    fn latest(&self, shard: usize) -> Result<u64, PluginError> {
        Ok(self.read_lock(self.shard(shard)?).next_offset())
    }
}
