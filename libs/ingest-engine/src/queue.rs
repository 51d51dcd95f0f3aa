use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ingest_api::clock::Clock;
use ingest_api::error::PluginError;
use ingest_api::queue::{Delivery, DurableQueue, QueueDepth, QueueMessage};

use crate::config::QueueConfig;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    /// Messages older than this are dropped unprocessed.
    pub message_retention: Duration,
}

impl QueueSettings {
    pub fn primary(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_receive_count: config.max_receive_count,
            message_retention: Duration::from_secs(config.message_retention_secs),
        }
    }

    pub fn dead_letter(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_receive_count: u32::MAX,
            message_retention: Duration::from_secs(config.dlq_retention_secs),
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    message: QueueMessage,
    sent_ms: i64,
    visible_at_ms: i64,
    /// Set while a consumer holds the lease.
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    next_id: u64,
    next_receipt: u64,
}

/// In-memory lease queue with redrive to an optional dead-letter queue.
pub struct MemoryQueue {
    name: String,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    dead_letter: Option<Arc<MemoryQueue>>,
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue").field("name", &self.name).finish()
    }
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            state: Mutex::new(QueueState::default()),
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<MemoryQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn dead_letter(&self) -> Option<&Arc<MemoryQueue>> {
        self.dead_letter.as_ref()
    }

    /// Every message currently held, leased or not, oldest first.
    pub fn snapshot(&self) -> Vec<QueueMessage> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let redriven = self.sweep(&mut state, now);
        let messages = state.entries.iter().map(|e| e.message.clone()).collect();
        drop(state);
        self.redrive(redriven);
        messages
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(queue = %self.name, "queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, message: QueueMessage) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back(Entry { id, message, sent_ms: now, visible_at_ms: now, receipt: None });
    }

    /// Expire old messages and release lapsed leases. Returns the messages
    /// that exhausted their receive budget, to be moved to the dead-letter queue.
    fn sweep(&self, state: &mut QueueState, now: i64) -> Vec<QueueMessage> {
        let retention_ms = self.settings.message_retention.as_millis() as i64;
        let max_receives = self.settings.max_receive_count;
        let has_dead_letter = self.dead_letter.is_some();
        let mut redriven = Vec::new();

        state.entries.retain_mut(|entry| {
            if now - entry.sent_ms >= retention_ms {
                tracing::warn!(
                    queue = %self.name,
                    object_key = %entry.message.object_key,
                    "message retention elapsed, dropping"
                );
                return false;
            }
            if entry.receipt.is_some() && entry.visible_at_ms <= now {
                entry.receipt = None;
                if has_dead_letter && entry.message.receive_count >= max_receives {
                    redriven.push(entry.message.clone());
                    return false;
                }
            }
            true
        });
        redriven
    }

    fn redrive(&self, messages: Vec<QueueMessage>) {
        let Some(dead_letter) = &self.dead_letter else {
            return;
        };
        for message in messages {
            tracing::error!(
                queue = %self.name,
                dead_letter = %dead_letter.name,
                object_key = %message.object_key,
                receive_count = message.receive_count,
                "receive budget exhausted, moved to dead-letter queue"
            );
            dead_letter.push(message);
        }
    }

    fn depth_now(&self) -> QueueDepth {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let redriven = self.sweep(&mut state, now);
        let in_flight = state.entries.iter().filter(|e| e.receipt.is_some()).count() as u64;
        let visible = state.entries.len() as u64 - in_flight;
        drop(state);
        self.redrive(redriven);

        // The dead-letter queue sweeps its own retention first.
        let dead_lettered = self.dead_letter.as_ref().map_or(0, |dlq| {
            let held = dlq.depth_now();
            held.visible + held.in_flight
        });
        QueueDepth { visible, in_flight, dead_lettered }
    }
}

impl DurableQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(
        &self,
        mut message: QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async move {
            message.receive_count = 0;
            self.push(message);
            Ok(())
        })
    }

    fn receive(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, PluginError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_ms();
            let lease_ms = self.settings.visibility_timeout.as_millis() as i64;

            let mut state = self.lock();
            let redriven = self.sweep(&mut state, now);

            let mut deliveries = Vec::new();
            let QueueState { entries, next_receipt, .. } = &mut *state;
            for entry in entries.iter_mut() {
                if deliveries.len() >= max {
                    break;
                }
                if entry.receipt.is_some() || entry.visible_at_ms > now {
                    continue;
                }
                *next_receipt += 1;
                let receipt = format!("{}:{}:{}", self.name, entry.id, next_receipt);
                entry.message.receive_count += 1;
                entry.visible_at_ms = now + lease_ms;
                entry.receipt = Some(receipt.clone());
                deliveries.push(Delivery { receipt, message: entry.message.clone() });
            }
            drop(state);

            self.redrive(redriven);
            Ok(deliveries)
        })
    }

    fn ack<'a>(
        &'a self,
        receipt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PluginError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            let position = state
                .entries
                .iter()
                .position(|e| e.receipt.as_deref() == Some(receipt));
            Ok(match position {
                Some(i) => state.entries.remove(i).is_some(),
                None => false,
            })
        })
    }

    fn depth(&self) -> Pin<Box<dyn Future<Output = Result<QueueDepth, PluginError>> + Send + '_>> {
        Box::pin(async move { Ok(self.depth_now()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_api::clock::ManualClock;
    use ingest_api::record::BatchSource;

    const LEASE_MS: i64 = 18 * 60 * 1000;

    fn fixture(max_receive_count: u32) -> (Arc<ManualClock>, MemoryQueue) {
        let clock = Arc::new(ManualClock::new(0));
        let config = QueueConfig { max_receive_count, ..QueueConfig::default() };
        let dlq = Arc::new(MemoryQueue::new("cap-dlq", QueueSettings::dead_letter(&config), clock.clone()));
        let queue = MemoryQueue::new("cap", QueueSettings::primary(&config), clock.clone()).with_dead_letter(dlq);
        (clock, queue)
    }

    fn message(key: &str) -> QueueMessage {
        QueueMessage::new(key, "cap", BatchSource::Cap)
    }

    #[tokio::test]
    async fn leased_message_is_hidden_until_timeout() {
        let (clock, queue) = fixture(2);
        queue.send(message("o/1")).await.unwrap();

        let first = queue.receive(5).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message.receive_count, 1);
        assert!(queue.receive(5).await.unwrap().is_empty());

        clock.advance_ms(LEASE_MS - 1);
        assert!(queue.receive(5).await.unwrap().is_empty());
        clock.advance_ms(1);
        let second = queue.receive(5).await.unwrap();
        assert_eq!(second[0].message.receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);
    }

    #[tokio::test]
    async fn ack_deletes_and_stale_receipt_is_rejected() {
        let (_, queue) = fixture(2);
        queue.send(message("o/1")).await.unwrap();
        let d = queue.receive(1).await.unwrap().remove(0);
        assert!(queue.ack(&d.receipt).await.unwrap());
        assert!(!queue.ack(&d.receipt).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn receive_respects_max() {
        let (_, queue) = fixture(2);
        for i in 0..7 {
            queue.send(message(&format!("o/{i}"))).await.unwrap();
        }
        assert_eq!(queue.receive(5).await.unwrap().len(), 5);
        assert_eq!(queue.receive(5).await.unwrap().len(), 2);
        let depth = queue.depth().await.unwrap();
        assert_eq!((depth.visible, depth.in_flight), (0, 7));
    }

    #[tokio::test]
    async fn expired_dead_letters_leave_the_reported_depth() {
        let (clock, queue) = fixture(1);
        queue.send(message("o/1")).await.unwrap();
        queue.receive(5).await.unwrap();
        clock.advance_ms(LEASE_MS);
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 1);

        clock.advance_ms(14 * 24 * 3600 * 1000 - 1);
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 1);
        clock.advance_ms(1);
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 0);
    }

    #[tokio::test]
    async fn retention_drops_stale_messages() {
        let (clock, queue) = fixture(2);
        queue.send(message("o/1")).await.unwrap();
        clock.advance_ms(4 * 24 * 3600 * 1000);
        assert!(queue.receive(5).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }
}
