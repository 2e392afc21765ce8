//! Source Telemetry
//!
//! Per-source latency, row-count, and failure counters emitted by the
//! router on every execution attempt. Consumed by an external
//! observability collector; kept aggregate-only here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
    pub total_rows: u64,
}

impl SourceStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }
}

/// Aggregate per-source execution counters.
#[derive(Clone, Default)]
pub struct SourceMetrics {
    stats: Arc<Mutex<HashMap<String, SourceStats>>>,
    fallbacks: Arc<Mutex<HashMap<String, u64>>>,
}

impl SourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self, source_id: &str, latency_ms: u64, rows: u64) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(source_id.to_string()).or_default();
        entry.calls += 1;
        entry.total_latency_ms += latency_ms;
        entry.total_rows += rows;
    }

    pub fn record_error(&self, source_id: &str) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(source_id.to_string()).or_default();
        entry.calls += 1;
        entry.errors += 1;
    }

    /// A feature fell over past its primary resolver.
    pub fn record_fallback(&self, feature: &str) {
        let mut fallbacks = self.fallbacks.lock().unwrap();
        *fallbacks.entry(feature.to_string()).or_insert(0) += 1;
    }

    pub fn source_stats(&self) -> HashMap<String, SourceStats> {
        self.stats.lock().unwrap().clone()
    }

    pub fn fallback_counts(&self) -> HashMap<String, u64> {
        self.fallbacks.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_counters_accumulate() {
        let metrics = SourceMetrics::new();
        metrics.record_execution("operational_pg", 4, 1);
        metrics.record_execution("operational_pg", 8, 3);
        metrics.record_error("operational_pg");

        let stats = metrics.source_stats();
        let pg = stats.get("operational_pg").unwrap();
        assert_eq!(pg.calls, 3);
        assert_eq!(pg.errors, 1);
        assert_eq!(pg.total_rows, 4);
        assert_eq!(pg.avg_latency_ms(), 4.0);
    }
}
