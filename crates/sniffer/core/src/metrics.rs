// Sniffer
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Metrics collector - per-operation counters and timers

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Free-form metadata attached to a completed operation
pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct OperationStats {
    count: u64,
    in_flight: u64,
    success: u64,
    failure: u64,
    total_duration: Duration,
    max_duration: Duration,
    last_metadata: Metadata,
    last_completed_at: Option<DateTime<Utc>>,
}

/// Handle returned by [`MetricsCollector::record_start`]
#[derive(Debug)]
#[must_use = "pass the timer to record_end to close the operation"]
pub struct OperationTimer {
    operation: String,
    started: Instant,
}

impl OperationTimer {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Point-in-time view of one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub count: u64,
    pub in_flight: u64,
    pub success: u64,
    pub failure: u64,
    pub total_duration_ms: f64,
    pub average_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Fraction of completed operations that succeeded, in `[0, 1]`
    pub success_rate: f64,
    pub last_metadata: Metadata,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationSnapshot>,
    pub uptime_secs: u64,
    pub collected_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn operation(&self, name: &str) -> Option<&OperationSnapshot> {
        self.operations.get(name)
    }
}

/// Thread-safe in-memory collector shared by every worker
///
/// Values are also forwarded to the `metrics` facade so an exporter can be
/// attached by the embedding binary.
#[derive(Debug)]
pub struct MetricsCollector {
    operations: Mutex<HashMap<String, OperationStats>>,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn record_start(&self, operation: impl Into<String>) -> OperationTimer {
        let operation = operation.into();
        self.operations.lock().entry(operation.clone()).or_default().in_flight += 1;
        OperationTimer {
            operation,
            started: Instant::now(),
        }
    }

    pub fn record_end(&self, timer: OperationTimer, success: bool, metadata: Metadata) {
        let duration = timer.started.elapsed();
        {
            let mut operations = self.operations.lock();
            let stats = operations.entry(timer.operation.clone()).or_default();
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.count += 1;
            if success {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
            stats.total_duration += duration;
            stats.max_duration = stats.max_duration.max(duration);
            stats.last_metadata = metadata;
            stats.last_completed_at = Some(Utc::now());
        }

        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("sniffer_operations_total", 1, "operation" => timer.operation.clone(), "outcome" => outcome);
        metrics::histogram!("sniffer_operation_duration_seconds", duration.as_secs_f64(), "operation" => timer.operation);
    }

    /// Convenience wrapper for a single outcome without metadata
    pub fn record(&self, timer: OperationTimer, success: bool) {
        self.record_end(timer, success, Metadata::new());
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let operations = self.operations.lock();
        let operations = operations
            .iter()
            .map(|(name, stats)| {
                let total_ms = stats.total_duration.as_secs_f64() * 1000.0;
                let snapshot = OperationSnapshot {
                    count: stats.count,
                    in_flight: stats.in_flight,
                    success: stats.success,
                    failure: stats.failure,
                    total_duration_ms: total_ms,
                    average_duration_ms: if stats.count > 0 { total_ms / stats.count as f64 } else { 0.0 },
                    max_duration_ms: stats.max_duration.as_secs_f64() * 1000.0,
                    success_rate: if stats.count > 0 { stats.success as f64 / stats.count as f64 } else { 0.0 },
                    last_metadata: stats.last_metadata.clone(),
                    last_completed_at: stats.last_completed_at,
                };
                (name.clone(), snapshot)
            })
            .collect();

        MetricsSnapshot {
            operations,
            uptime_secs: self.started_at.elapsed().as_secs(),
            collected_at: Utc::now(),
        }
    }

    pub fn reset(&self) {
        self.operations.lock().clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_and_rates() {
        let collector = MetricsCollector::new();

        let timer = collector.record_start("sniff_file");
        assert_eq!(collector.get_metrics().operation("sniff_file").unwrap().in_flight, 1);
        collector.record(timer, true);

        let timer = collector.record_start("sniff_file");
        let mut metadata = Metadata::new();
        metadata.insert("file".into(), Value::from("a.py"));
        collector.record_end(timer, false, metadata);

        let snapshot = collector.get_metrics();
        let op = snapshot.operation("sniff_file").unwrap();
        assert_eq!(op.count, 2);
        assert_eq!(op.success, 1);
        assert_eq!(op.failure, 1);
        assert_eq!(op.in_flight, 0);
        assert_eq!(op.success_rate, 0.5);
        assert_eq!(op.last_metadata["file"], Value::from("a.py"));
        assert!(op.average_duration_ms <= op.max_duration_ms);
    }

    #[test]
    fn test_concurrent_increments() {
        let collector = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = collector.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let timer = collector.record_start("domain:security");
                        collector.record(timer, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.get_metrics();
        let op = snapshot.operation("domain:security").unwrap();
        assert_eq!(op.count, 800);
        assert_eq!(op.success_rate, 1.0);
    }

    #[test]
    fn test_reset_clears_operations() {
        let collector = MetricsCollector::new();
        let timer = collector.record_start("run_job");
        collector.record(timer, true);
        collector.reset();
        assert!(collector.get_metrics().operations.is_empty());
    }
}
