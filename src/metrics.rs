//! Observability hook for timed operations.

use std::time::Duration;

use tracing::{debug, warn};

/// One timed, labelled measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedMetric {
    pub component: &'static str,
    pub operation: &'static str,
    pub duration: Duration,
    pub success: bool,
    pub labels: Vec<(&'static str, String)>,
}

impl TimedMetric {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            duration: Duration::ZERO,
            success: true,
            labels: Vec::new(),
        }
    }

    pub fn label(mut self, key: &'static str, value: impl ToString) -> Self {
        self.labels.push((key, value.to_string()));
        self
    }

    pub fn finish(mut self, duration: Duration, success: bool) -> Self {
        self.duration = duration;
        self.success = success;
        self
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait MetricsRecorder: Send + Sync {
    fn record(&self, metric: TimedMetric);
}

/// Emits metrics as structured log events.
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record(&self, metric: TimedMetric) {
        let labels = metric
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let duration_ms = metric.duration.as_millis() as u64;
        if metric.success {
            debug!(
                component = metric.component,
                operation = metric.operation,
                duration_ms,
                success = true,
                labels = %labels,
                "metric"
            );
        } else {
            warn!(
                component = metric.component,
                operation = metric.operation,
                duration_ms,
                success = false,
                labels = %labels,
                "metric"
            );
        }
    }
}
