//! Rolling performance metrics per endpoint/operation.
//!
//! Keeps a bounded sample window for every endpoint/operation pair and emits
//! a non-fatal alert event when latency or failure rate crosses the
//! configured thresholds.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::MonitorConfig;
use crate::coordination::{CoordinationEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;

/// Breaches are only evaluated once a window has this many samples.
const MIN_SAMPLES_FOR_ALERTS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration_ms: u64,
    success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationStats {
    pub samples: usize,
    pub avg_duration_ms: u64,
    pub max_duration_ms: u64,
    pub success_rate: f64,
}

pub struct PerformanceMonitor {
    windows: RwLock<HashMap<String, VecDeque<Sample>>>,
    events: Arc<EventBus>,
    window_size: usize,
    max_avg_latency_ms: u64,
    min_success_rate: f64,
}

impl PerformanceMonitor {
    pub fn new(config: &MonitorConfig, events: Arc<EventBus>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            events,
            window_size: config.window_size,
            max_avg_latency_ms: config.max_avg_latency_ms,
            min_success_rate: config.min_success_rate,
        }
    }

    fn key(endpoint: &str, operation: &str) -> String {
        format!("{endpoint}/{operation}")
    }

    /// Record one call outcome and evaluate thresholds.
    pub fn record(&self, endpoint: &str, operation: &str, duration: Duration, success: bool) {
        let key = Self::key(endpoint, operation);
        let stats = {
            let mut windows = self.windows.write();
            let window = windows.entry(key).or_default();
            window.push_back(Sample {
                duration_ms: duration.as_millis() as u64,
                success,
            });
            while window.len() > self.window_size {
                window.pop_front();
            }
            Self::stats_of(window)
        };

        if stats.samples < MIN_SAMPLES_FOR_ALERTS {
            return;
        }

        if stats.avg_duration_ms > self.max_avg_latency_ms {
            let message = format!(
                "average latency {}ms exceeds {}ms over {} samples",
                stats.avg_duration_ms, self.max_avg_latency_ms, stats.samples
            );
            debug!(endpoint, operation, %message, "Performance alert");
            self.events.publish(CoordinationEvent::PerformanceAlert {
                endpoint: endpoint.to_string(),
                operation: operation.to_string(),
                message,
            });
        }

        if stats.success_rate < self.min_success_rate {
            let message = format!(
                "success rate {:.1}% below {:.1}% over {} samples",
                stats.success_rate * 100.0,
                self.min_success_rate * 100.0,
                stats.samples
            );
            debug!(endpoint, operation, %message, "Performance alert");
            self.events.publish(CoordinationEvent::PerformanceAlert {
                endpoint: endpoint.to_string(),
                operation: operation.to_string(),
                message,
            });
        }
    }

    fn stats_of(window: &VecDeque<Sample>) -> OperationStats {
        let samples = window.len();
        if samples == 0 {
            return OperationStats {
                samples: 0,
                avg_duration_ms: 0,
                max_duration_ms: 0,
                success_rate: 0.0,
            };
        }
        let total: u64 = window.iter().map(|s| s.duration_ms).sum();
        let max = window.iter().map(|s| s.duration_ms).max().unwrap_or(0);
        let successes = window.iter().filter(|s| s.success).count();
        OperationStats {
            samples,
            avg_duration_ms: total / samples as u64,
            max_duration_ms: max,
            success_rate: successes as f64 / samples as f64,
        }
    }

    pub fn stats(&self, endpoint: &str, operation: &str) -> Option<OperationStats> {
        self.windows
            .read()
            .get(&Self::key(endpoint, operation))
            .map(Self::stats_of)
    }

    pub fn all_stats(&self) -> HashMap<String, OperationStats> {
        self.windows
            .read()
            .iter()
            .map(|(key, window)| (key.clone(), Self::stats_of(window)))
            .collect()
    }
}
