//! Metrics sink abstraction
//!
//! The loader reports gauges and counters through `MetricsSink`. The real
//! backend is wired in by the binary; `LogMetrics` just writes log lines.

use std::sync::Mutex;

pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64, tags: &[String]);

    fn increment(&self, name: &str, value: u64, tags: &[String]);
}

/// Writes every metric as a debug log line.
#[derive(Debug, Default)]
pub struct LogMetrics;

impl LogMetrics {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for LogMetrics {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) {
        log::debug!("📈 gauge {}={:.3} [{}]", name, value, tags.join(","));
    }

    fn increment(&self, name: &str, value: u64, tags: &[String]) {
        log::debug!("📈 count {}+={} [{}]", name, value, tags.join(","));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
}

/// Keeps every reported metric in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    points: Mutex<Vec<MetricPoint>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Value of the first point with this name and tag.
    pub fn find(&self, name: &str, tag: &str) -> Option<f64> {
        self.points()
            .into_iter()
            .find(|p| p.name == name && p.tags.iter().any(|t| t == tag))
            .map(|p| p.value)
    }

    fn record(&self, name: &str, value: f64, tags: &[String]) {
        let point = MetricPoint {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        };
        match self.points.lock() {
            Ok(mut points) => points.push(point),
            Err(poisoned) => poisoned.into_inner().push(point),
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) {
        self.record(name, value, tags);
    }

    fn increment(&self, name: &str, value: u64, tags: &[String]) {
        self.record(name, value as f64, tags);
    }
}
