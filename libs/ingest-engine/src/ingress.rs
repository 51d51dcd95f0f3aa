use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use ingest_api::clock::Clock;
use serde_json::{Value, json};

use crate::error::EngineError;
use crate::router::TopicRouter;
use crate::task::Task;

/// A message as it arrives from the pub/sub bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }
}

/// Drops unusable bus messages and stamps the rest with receive metadata.
pub struct Ingress {
    broker: String,
    annotate: bool,
    clock: Arc<dyn Clock>,
}

impl Ingress {
    pub fn new(broker: impl Into<String>, annotate: bool, clock: Arc<dyn Clock>) -> Self {
        Self { broker: broker.into(), annotate, clock }
    }

    /// `None` when the message is blank or not a JSON object.
    pub fn normalize(&self, message: BusMessage) -> Option<BusMessage> {
        if message.payload.iter().all(u8::is_ascii_whitespace) {
            tracing::debug!(topic = %message.topic, "discarding empty message");
            return None;
        }

        let mut value: Value = match serde_json::from_slice(&message.payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(topic = %message.topic, error = %e, "discarding invalid JSON message");
                return None;
            }
        };
        let Some(object) = value.as_object_mut() else {
            tracing::error!(topic = %message.topic, "discarding message: payload is not a JSON object");
            return None;
        };

        if !self.annotate {
            return Some(message);
        }

        let received = DateTime::from_timestamp_millis(self.clock.now_ms())
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        object.insert(
            "_meta".to_string(),
            json!({
                "time_received": received,
                "broker": self.broker,
                "topic": message.topic,
            }),
        );

        match serde_json::to_vec(&value) {
            Ok(payload) => Some(BusMessage { topic: message.topic, payload }),
            Err(e) => {
                tracing::error!(topic = %message.topic, error = %e, "failed to re-encode message");
                None
            }
        }
    }
}

/// Bus-driven task: normalize, then route.
pub struct IngressTask {
    ingress: Ingress,
    router: Arc<TopicRouter>,
}

impl IngressTask {
    pub fn new(ingress: Ingress, router: Arc<TopicRouter>) -> Self {
        Self { ingress, router }
    }
}

impl Task for IngressTask {
    type Event = BusMessage;

    fn name(&self) -> &str {
        "ingress"
    }

    fn run(
        &self,
        message: BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(message) = self.ingress.normalize(message) {
                self.router.route(&message.topic, &message.payload);
            }
            Ok(())
        })
    }
}
