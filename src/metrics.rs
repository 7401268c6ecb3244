//! Engine-wide metrics aggregation: counts, throughput, and latency
//! percentiles over a bounded sample window.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::utils::BoundedRing;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub total_sessions: u64,
    pub charging_sessions: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_per_sec: f64,
    pub avg_latency_ms: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_rate: f64,
    pub action_counters: HashMap<String, u64>,
}

/// Accumulates latency samples and per-action counters between snapshot
/// ticks. Not thread-shared directly — the engine shards one aggregator
/// instance behind its own lock, matching the concurrent-read/exclusive
/// write registry pattern used for the session table.
pub struct MetricsAggregator {
    latencies_ms: BoundedRing<f64>,
    action_counters: HashMap<String, u64>,
    messages_sent: u64,
    messages_received: u64,
    errors: u64,
    window_start: std::time::Instant,
    window_message_count: u64,
}

impl MetricsAggregator {
    pub fn new(sample_capacity: usize) -> Self {
        Self {
            latencies_ms: BoundedRing::new(sample_capacity),
            action_counters: HashMap::new(),
            messages_sent: 0,
            messages_received: 0,
            errors: 0,
            window_start: std::time::Instant::now(),
            window_message_count: 0,
        }
    }

    pub fn record_sent(&mut self, action: &str) {
        self.messages_sent += 1;
        self.window_message_count += 1;
        *self.action_counters.entry(action.to_string()).or_insert(0) += 1;
    }

    pub fn record_received(&mut self, action: &str) {
        self.messages_received += 1;
        self.window_message_count += 1;
        *self.action_counters.entry(action.to_string()).or_insert(0) += 1;
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latencies_ms.push(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    fn percentile(sorted: &[f64], pct: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn snapshot(&mut self, active_connections: u64, total_sessions: u64, charging_sessions: u64) -> MetricsSnapshot {
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let elapsed = self.window_start.elapsed().as_secs_f64().max(0.001);
        let messages_per_sec = self.window_message_count as f64 / elapsed;
        let total_messages = self.messages_sent + self.messages_received;
        let error_rate = if total_messages == 0 {
            0.0
        } else {
            self.errors as f64 / total_messages as f64
        };
        let avg_latency_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        let snapshot = MetricsSnapshot {
            active_connections,
            total_sessions,
            charging_sessions,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            messages_per_sec,
            avg_latency_ms,
            p50: Self::percentile(&sorted, 0.50),
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
            error_rate,
            action_counters: self.action_counters.clone(),
        };

        self.window_start = std::time::Instant::now();
        self.window_message_count = 0;

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_monotonic() {
        let mut agg = MetricsAggregator::new(1000);
        for i in 1..=100 {
            agg.record_latency(Duration::from_millis(i));
        }
        let snap = agg.snapshot(0, 0, 0);
        assert!(snap.p50 <= snap.p95);
        assert!(snap.p95 <= snap.p99);
    }

    #[test]
    fn error_rate_is_zero_with_no_messages() {
        let mut agg = MetricsAggregator::new(10);
        let snap = agg.snapshot(0, 0, 0);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[test]
    fn action_counters_tally_per_action() {
        let mut agg = MetricsAggregator::new(10);
        agg.record_sent("Heartbeat");
        agg.record_sent("Heartbeat");
        agg.record_received("BootNotification");
        let snap = agg.snapshot(0, 0, 0);
        assert_eq!(snap.action_counters["Heartbeat"], 2);
        assert_eq!(snap.action_counters["BootNotification"], 1);
    }
}
