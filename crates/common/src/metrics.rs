use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
}

impl Metric {
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            kind: MetricKind::Counter,
            tags: Vec::new(),
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            kind: MetricKind::Gauge,
            tags: Vec::new(),
        }
    }

    pub fn histogram(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            kind: MetricKind::Histogram,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// External metrics collaborator. The core emits; the host decides where
/// the records go.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: Metric);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _metric: Metric) {}
}

/// Sink that forwards every record to the tracing pipeline at DEBUG.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, metric: Metric) {
        tracing::debug!(
            name = %metric.name,
            value = metric.value,
            kind = ?metric.kind,
            "metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_kind_and_tags() {
        let metric = Metric::counter("articles_posted", 3.0).with_tag("group", "alt.binaries.test");
        assert_eq!(metric.kind, MetricKind::Counter);
        assert_eq!(metric.tags.len(), 1);

        assert_eq!(Metric::gauge("queue_depth", 9.0).kind, MetricKind::Gauge);
        assert_eq!(
            Metric::histogram("post_ms", 120.0).kind,
            MetricKind::Histogram
        );
    }
}
