//! Bounded latency ring with order statistics.

use std::collections::VecDeque;

use serde::Serialize;

/// Keeps the most recent `capacity` latencies in milliseconds.
#[derive(Debug, Clone)]
pub(crate) struct LatencyRing {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, latency_ms: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Summarises the ring. Percentiles use `sorted[min(floor(n × p), n − 1)]`.
    pub(crate) fn summary(&self) -> LatencySummary {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return LatencySummary::default();
        }
        sorted.sort_unstable();

        let n = sorted.len();
        let at = |p: f64| sorted[((n as f64 * p).floor() as usize).min(n - 1)];
        let sum: u64 = sorted.iter().sum();
        LatencySummary {
            samples: n,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            avg_ms: sum as f64 / n as f64,
            p50_ms: at(0.50),
            p90_ms: at(0.90),
            p95_ms: at(0.95),
            p99_ms: at(0.99),
        }
    }
}

/// Latency statistics over the retained samples. All zero when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}
