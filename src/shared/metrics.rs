//! In-process metrics collection exposed on /metrics.
//!
//! Counters and latency aggregates are kept in atomics and a labeled map
//! behind an async RwLock; rendering produces Prometheus text exposition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct LatencyAggregate {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    request_counter: AtomicU64,
    error_counter: AtomicU64,
    counters: RwLock<HashMap<String, u64>>,
    latencies: RwLock<HashMap<String, LatencyAggregate>>,
    gauges: RwLock<HashMap<String, i64>>,
}

impl MetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self) {
        self.request_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn incr(&self, name: &str) {
        self.incr_by(name, 1).await;
    }

    pub async fn incr_by(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub async fn set_gauge(&self, name: &str, value: i64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    pub async fn adjust_gauge(&self, name: &str, delta: i64) {
        let mut gauges = self.gauges.write().await;
        *gauges.entry(name.to_string()).or_insert(0) += delta;
    }

    pub async fn observe_latency(&self, name: &str, elapsed_ms: u64) {
        let mut latencies = self.latencies.write().await;
        let agg = latencies.entry(name.to_string()).or_default();
        agg.count += 1;
        agg.total_ms += elapsed_ms;
        agg.max_ms = agg.max_ms.max(elapsed_ms);
    }

    pub async fn counter_value(&self, name: &str) -> u64 {
        let counters = self.counters.read().await;
        counters.get(name).copied().unwrap_or(0)
    }

    /// Prometheus text exposition for the /metrics endpoint.
    pub async fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "requests_total {}\n",
            self.request_counter.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "errors_total {}\n",
            self.error_counter.load(Ordering::Relaxed)
        ));

        let counters = self.counters.read().await;
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&format!("{} {}\n", name, counters[name]));
        }
        drop(counters);

        let gauges = self.gauges.read().await;
        let mut names: Vec<_> = gauges.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&format!("{} {}\n", name, gauges[name]));
        }
        drop(gauges);

        let latencies = self.latencies.read().await;
        let mut names: Vec<_> = latencies.keys().collect();
        names.sort();
        for name in names {
            let agg = &latencies[name];
            out.push_str(&format!("{}_count {}\n", name, agg.count));
            out.push_str(&format!("{}_sum_ms {}\n", name, agg.total_ms));
            out.push_str(&format!("{}_max_ms {}\n", name, agg.max_ms));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.incr("automation_failures").await;
        metrics.incr_by("automation_failures", 2).await;
        assert_eq!(metrics.counter_value("automation_failures").await, 3);
    }

    #[tokio::test]
    async fn render_includes_latency_aggregates() {
        let metrics = MetricsCollector::new();
        metrics.observe_latency("automation_latency", 20).await;
        metrics.observe_latency("automation_latency", 40).await;
        metrics.set_gauge("automation_queue_depth", 5).await;
        let rendered = metrics.render().await;
        assert!(rendered.contains("automation_latency_count 2"));
        assert!(rendered.contains("automation_latency_sum_ms 60"));
        assert!(rendered.contains("automation_latency_max_ms 40"));
        assert!(rendered.contains("automation_queue_depth 5"));
    }
}
