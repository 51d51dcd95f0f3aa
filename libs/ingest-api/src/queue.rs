use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::record::BatchSource;

/// Notification that a batch object landed under a pipeline's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub object_key: String,
    pub pipeline: String,
    pub source: BatchSource,
    /// Number of times the message has been handed to a consumer.
    #[serde(default)]
    pub receive_count: u32,
}

impl QueueMessage {
    pub fn new(object_key: impl Into<String>, pipeline: impl Into<String>, source: BatchSource) -> Self {
        Self {
            object_key: object_key.into(),
            pipeline: pipeline.into(),
            source,
            receive_count: 0,
        }
    }
}

/// A received message plus the lease handle used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: String,
    pub message: QueueMessage,
}

/// Queue depth information for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages available for receive.
    pub visible: u64,
    /// Messages leased to a consumer and hidden until ack or timeout.
    pub in_flight: u64,
    /// Messages moved to the dead-letter queue.
    pub dead_lettered: u64,
}

/// Lease-based durable queue.
///
/// 1. A received message stays hidden for the visibility timeout.
/// 2. `ack` deletes it; otherwise it becomes visible again when the lease expires.
/// 3. A message whose lease expires after `max_receive_count` receives moves to
///    the dead-letter queue and is never redelivered here.
pub trait DurableQueue: Send + Sync {
    fn name(&self) -> &str;

    fn send(
        &self,
        message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>>;

    /// Up to `max` visible messages; empty when nothing is visible.
    fn receive(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, PluginError>> + Send + '_>>;

    /// Returns `false` when the receipt no longer names a live lease.
    fn ack<'a>(
        &'a self,
        receipt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>>;

    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<QueueDepth, PluginError>> + Send + '_>>;
}
