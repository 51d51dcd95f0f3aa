use sha2::{Digest, Sha256};

use crate::error::PluginError;
use crate::record::Record;

/// Shard selected for a partition key.
///
/// Uses the leading 8 bytes of SHA-256 so the mapping is identical across
/// processes and restarts for a fixed shard count.
pub fn shard_for(partition_key: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % shard_count as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub shard: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub offset: u64,
    pub record: Record,
}

/// Result of a shard read.
#[derive(Debug, Clone, Default)]
pub struct ShardRead {
    pub entries: Vec<StreamEntry>,
    /// Offset to pass to the next read.
    pub next_offset: u64,
    /// Records between the requested offset and the trim horizon that aged
    /// out before they could be read.
    pub expired: u64,
}

/// Per-pipeline sharded log with time-based retention.
///
/// Readers track their own offsets; reading again from any retained offset
/// yields the same records in the same order.
pub trait StreamBuffer: Send + Sync {
    fn name(&self) -> &str;

    fn shard_count(&self) -> usize;

    fn append(&self, record: Record) -> Result<AppendResult, PluginError>;

    fn read(&self, shard: usize, from_offset: u64, limit: usize) -> Result<ShardRead, PluginError>;

    /// Oldest retained offset of a shard.
    fn trim_horizon(&self, shard: usize) -> Result<u64, PluginError>;

    /// Offset the next append to this shard will receive.
    fn latest(&self, shard: usize) -> Result<u64, PluginError>;
}
