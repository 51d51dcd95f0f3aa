use std::collections::HashMap;
use std::sync::Mutex;

use ingest_api::metrics::{Metric, MetricsSink, Unit};

/// Writes every metric as a `tracing` event on target `metrics`.
pub struct LogMetrics {
    namespace: String,
}

impl LogMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }
}

impl MetricsSink for LogMetrics {
    fn emit(&self, metrics: &[Metric]) {
        for m in metrics {
            let unit = match m.unit {
                Unit::Count => "count",
                Unit::Milliseconds => "ms",
            };
            tracing::info!(
                target: "metrics",
                namespace = %self.namespace,
                metric = m.name,
                pipeline = %m.pipeline,
                value = m.value,
                unit,
                "metric"
            );
        }
    }
}

/// Sums metric values per `(name, pipeline)`.
#[derive(Default)]
pub struct MemoryMetrics {
    totals: Mutex<HashMap<(&'static str, String), f64>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, name: &str, pipeline: &str) -> f64 {
        let totals = match self.totals.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        totals
            .iter()
            .filter(|((n, p), _)| *n == name && p == pipeline)
            .map(|(_, v)| *v)
            .sum()
    }
}

impl MetricsSink for MemoryMetrics {
    fn emit(&self, metrics: &[Metric]) {
        let mut totals = match self.totals.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("metrics lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        for m in metrics {
            *totals.entry((m.name, m.pipeline.clone())).or_default() += m.value;
        }
    }
}
