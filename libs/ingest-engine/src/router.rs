use std::sync::Arc;

use ingest_api::clock::Clock;
use ingest_api::record::Record;
use ingest_api::stream::StreamBuffer;
use serde::Deserialize;
use serde_json::Value;

use crate::filter::TopicRule;

/// How the router picks a record's partition key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// The topic string: keeps per-topic ordering inside a shard.
    #[default]
    Topic,
    /// A fresh random key per record: spreads load over all shards.
    Random,
}

impl PartitionPolicy {
    pub fn key_for(&self, topic: &str) -> String {
        match self {
            PartitionPolicy::Topic => topic.to_string(),
            PartitionPolicy::Random => format!("{:032x}", rand::random::<u128>()),
        }
    }
}

/// One pipeline's entry in the routing table.
pub struct Route {
    pipeline: String,
    rule: TopicRule,
    partition: PartitionPolicy,
    stream: Arc<dyn StreamBuffer>,
}

impl Route {
    pub fn new(
        pipeline: impl Into<String>,
        rule: TopicRule,
        partition: PartitionPolicy,
        stream: Arc<dyn StreamBuffer>,
    ) -> Self {
        Self { pipeline: pipeline.into(), rule, partition, stream }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub pipeline: String,
    pub shard: usize,
    pub offset: u64,
}

/// Fans a bus message out to every pipeline whose rule accepts it.
pub struct TopicRouter {
    routes: Vec<Route>,
    clock: Arc<dyn Clock>,
    needs_payload: bool,
}

impl TopicRouter {
    pub fn new(routes: Vec<Route>, clock: Arc<dyn Clock>) -> Self {
        let needs_payload = routes.iter().any(|r| r.rule.needs_payload());
        Self { routes, clock, needs_payload }
    }

    /// Append one record per matching pipeline.
    ///
    /// An append failure drops the record for that pipeline only; the
    /// remaining matches are still delivered.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Vec<Routed> {
        let json = if self.needs_payload {
            serde_json::from_slice::<Value>(payload).ok()
        } else {
            None
        };
        let now = self.clock.now_ms();

        let mut routed = Vec::new();
        for route in &self.routes {
            if !route.rule.matches(topic, json.as_ref()) {
                continue;
            }
            let record = Record::new(topic, payload.to_vec(), route.partition.key_for(topic), now);
            match route.stream.append(record) {
                Ok(at) => routed.push(Routed {
                    pipeline: route.pipeline.clone(),
                    shard: at.shard,
                    offset: at.offset,
                }),
                Err(e) => tracing::error!(
                    pipeline = %route.pipeline,
                    topic,
                    error = %e,
                    "ingress error, record dropped"
                ),
            }
        }

        if routed.is_empty() {
            tracing::debug!(topic, "no pipeline matched");
        }
        routed
    }
}
