use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ingest_api::error::PluginError;
use ingest_api::object::ObjectMeta;
use ingest_api::queue::{DurableQueue, QueueMessage};
use ingest_api::record::BatchSource;

use crate::error::EngineError;
use crate::objects::ObjectEvent;
use crate::task::Task;

/// Where objects under one pipeline prefix are announced.
pub struct NotificationTarget {
    pub pipeline: String,
    pub source: BatchSource,
    pub prefix: String,
    pub queue: Arc<dyn DurableQueue>,
}

/// Publishes one queue message per object created under a pipeline prefix.
pub struct ObjectNotificationDispatcher {
    targets: Vec<NotificationTarget>,
}

impl ObjectNotificationDispatcher {
    /// Prefixes are expected not to overlap, so at most one target matches.
    pub fn new(targets: Vec<NotificationTarget>) -> Self {
        Self { targets }
    }

    /// Returns the pipeline notified, or `None` for objects outside every prefix.
    pub async fn dispatch(&self, object: &ObjectMeta) -> Result<Option<&str>, PluginError> {
        let Some(target) = self.targets.iter().find(|t| object.key.starts_with(&t.prefix)) else {
            tracing::trace!(key = %object.key, "object outside pipeline prefixes");
            return Ok(None);
        };

        let message = QueueMessage::new(object.key.clone(), target.pipeline.clone(), target.source);
        target
            .queue
            .send(message)
            .await
            .map_err(|e| e.with_context(format!("notify queue '{}'", target.queue.name())))?;
        tracing::debug!(pipeline = %target.pipeline, key = %object.key, "object notification queued");
        Ok(Some(&target.pipeline))
    }
}

impl Task for ObjectNotificationDispatcher {
    type Event = ObjectEvent;

    fn name(&self) -> &str {
        "dispatcher"
    }

    fn run(
        &self,
        event: ObjectEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move {
            let ObjectEvent::Created(object) = event;
            self.dispatch(&object).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::{MemoryQueue, QueueSettings};
    use ingest_api::clock::ManualClock;

    fn queue(name: &str) -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new(
            name,
            QueueSettings::primary(&QueueConfig::default()),
            Arc::new(ManualClock::new(0)),
        ))
    }

    fn meta(key: &str) -> ObjectMeta {
        ObjectMeta { key: key.to_string(), size: 1, created_ms: 0 }
    }

    #[tokio::test]
    async fn one_message_per_object_on_owning_queue() {
        let cap = queue("cap");
        let obs = queue("obs");
        let dispatcher = ObjectNotificationDispatcher::new(vec![
            NotificationTarget { pipeline: "cap".into(), source: BatchSource::Cap, prefix: "tbp/cap/".into(), queue: cap.clone() },
            NotificationTarget { pipeline: "obs".into(), source: BatchSource::SurfaceObs, prefix: "tbp/obs/".into(), queue: obs.clone() },
        ]);

        assert_eq!(dispatcher.dispatch(&meta("tbp/cap/2024/1")).await.unwrap(), Some("cap"));
        assert_eq!(dispatcher.dispatch(&meta("processed/tbp/cap/2024/1")).await.unwrap(), None);

        let received = cap.receive(10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.object_key, "tbp/cap/2024/1");
        assert_eq!(received[0].message.source, BatchSource::Cap);
        assert!(obs.receive(10).await.unwrap().is_empty());
    }
}
