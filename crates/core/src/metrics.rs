use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const RUNS_STARTED: &str = "runs_started";
pub const RUNS_COMPLETED: &str = "runs_completed";
pub const RUNS_FAILED: &str = "runs_failed";
pub const STEPS_ENQUEUED: &str = "steps_enqueued";
pub const STEPS_STARTED: &str = "steps_started";
pub const STEPS_SUCCEEDED: &str = "steps_succeeded";
pub const STEPS_FAILED: &str = "steps_failed";
pub const STEPS_RETRIED: &str = "steps_retried";
pub const STEP_DURATION_SECONDS: &str = "step_duration_seconds";

/// Default histogram buckets in seconds
const DEFAULT_BUCKETS: [f64; 10] = [0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// In-process counters and histograms for the engine
#[derive(Clone, Default)]
pub struct MetricsCollector {
    counters: Arc<Mutex<BTreeMap<String, Counter>>>,
    histograms: Arc<Mutex<BTreeMap<String, Histogram>>>,
}

/// Counter - monotonically increasing value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// Histogram - tracks distribution of values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

/// Derived view of one histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSummary {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub count: u64,
    pub average: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub histograms: Vec<Histogram>,
    pub summaries: Vec<HistogramSummary>,
    pub taken_at: DateTime<Utc>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_labels(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, 1, labels);
    }

    /// Increment a counter by a specific amount
    pub fn increment_counter_by(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let labels = to_labels(labels);
        let key = Self::metric_key(name, &labels);

        lock(&self.counters)
            .entry(key)
            .and_modify(|c| {
                c.value += value;
                c.last_updated = Utc::now();
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value,
                labels,
                last_updated: Utc::now(),
            });
    }

    /// Record a histogram observation
    pub fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let labels = to_labels(labels);
        let key = Self::metric_key(name, &labels);

        let mut histograms = lock(&self.histograms);
        let histogram = histograms.entry(key).or_insert_with(|| Histogram {
            name: name.to_string(),
            buckets: DEFAULT_BUCKETS.to_vec(),
            counts: vec![0; DEFAULT_BUCKETS.len()],
            sum: 0.0,
            count: 0,
            labels,
            last_updated: Utc::now(),
        });

        histogram.sum += value;
        histogram.count += 1;
        for (i, bucket) in histogram.buckets.iter().enumerate() {
            if value <= *bucket {
                histogram.counts[i] += 1;
            }
        }
        histogram.last_updated = Utc::now();
    }

    /// Value of a counter, 0 if it was never incremented
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = Self::metric_key(name, &to_labels(labels));
        lock(&self.counters).get(&key).map(|c| c.value).unwrap_or(0)
    }

    /// Sum of a counter across all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        lock(&self.counters)
            .values()
            .filter(|c| c.name == name)
            .map(|c| c.value)
            .sum()
    }

    pub fn get_histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<Histogram> {
        let key = Self::metric_key(name, &to_labels(labels));
        lock(&self.histograms).get(&key).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histograms: Vec<Histogram> = lock(&self.histograms).values().cloned().collect();
        MetricsSnapshot {
            counters: lock(&self.counters).values().cloned().collect(),
            summaries: histograms.iter().map(Histogram::summary).collect(),
            histograms,
            taken_at: Utc::now(),
        }
    }

    /// Generate a unique key for a metric with labels
    fn metric_key(name: &str, labels: &BTreeMap<String, String>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }

        let label_str = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        format!("{}:{}", name, label_str)
    }
}

impl Histogram {
    /// Calculate percentile (p50, p95, p99, etc.)
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target_count = ((self.count as f64) * (p / 100.0)).ceil() as u64;
        self.counts
            .iter()
            .position(|count| *count >= target_count)
            .map(|i| self.buckets[i])
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            name: self.name.clone(),
            labels: self.labels.clone(),
            count: self.count,
            average: self.average(),
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increment() {
        let collector = MetricsCollector::new();
        let labels = [("connector", "http")];

        collector.increment_counter(STEPS_STARTED, &labels);
        collector.increment_counter(STEPS_STARTED, &labels);

        assert_eq!(collector.counter_value(STEPS_STARTED, &labels), 2);
        assert_eq!(collector.counter_value(STEPS_STARTED, &[]), 0);
    }

    #[test]
    fn test_counter_total_spans_labels() {
        let collector = MetricsCollector::new();

        collector.increment_counter(STEPS_FAILED, &[("connector", "http")]);
        collector.increment_counter_by(STEPS_FAILED, 2, &[("connector", "webhook")]);

        assert_eq!(collector.counter_total(STEPS_FAILED), 3);
        assert_eq!(collector.counter_total(STEPS_SUCCEEDED), 0);
    }

    #[test]
    fn test_histogram_observation() {
        let collector = MetricsCollector::new();

        for value in [0.25, 0.5, 2.25] {
            collector.observe_histogram(STEP_DURATION_SECONDS, value, &[]);
        }

        let histogram = collector.get_histogram(STEP_DURATION_SECONDS, &[]).unwrap();
        assert_eq!(histogram.count, 3);
        assert_eq!(histogram.sum, 3.0);
        assert_eq!(histogram.counts[1], 0);
        assert_eq!(histogram.counts[2], 2);
        assert_eq!(histogram.counts[4], 3);
        assert_eq!(histogram.percentile(50.0), Some(0.5));
        assert_eq!(histogram.average(), Some(1.0));
    }

    #[test]
    fn test_snapshot() {
        let collector = MetricsCollector::new();
        collector.increment_counter(RUNS_STARTED, &[]);
        collector.observe_histogram(STEP_DURATION_SECONDS, 1.0, &[]);

        collector.observe_histogram(STEP_DURATION_SECONDS, 4.0, &[]);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.counters.len(), 1);
        assert_eq!(snapshot.histograms.len(), 1);

        let summary = &snapshot.summaries[0];
        assert_eq!(summary.name, STEP_DURATION_SECONDS);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.average, Some(2.5));
        assert_eq!(summary.p50, Some(1.0));
        assert_eq!(summary.p99, Some(5.0));
    }
}
