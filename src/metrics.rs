//! Per-participant measurement helpers.
//!
//! [`LatencyCollector`] keeps an HDR histogram of propagation latencies next
//! to the exact sample list kept by the reader, and [`ThroughputCalculator`]
//! derives the effective write rate of a writer.

use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Histogram-derived latency summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: u64,
}

/// Percentile value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Throughput of one writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub operations_per_second: f64,
    pub total_operations: u64,
    pub duration_ns: u64,
}

/// Latency collector using HDR histogram for accurate measurement
pub struct LatencyCollector {
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    /// Create a new latency collector
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self { histogram })
    }

    /// Record a latency in nanoseconds
    pub fn record_ns(&mut self, latency_ns: u64) -> Result<()> {
        self.histogram.record(latency_ns)?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Summarize the recorded latencies. `percentiles` are in `[0, 100]`.
    pub fn summary(&self, percentiles: &[f64]) -> HistogramSummary {
        let percentiles = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect();

        HistogramSummary {
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            std_dev_ns: self.histogram.stdev(),
            percentiles,
            total_samples: self.histogram.len(),
        }
    }
}

/// Throughput calculator for measuring operation rates
pub struct ThroughputCalculator {
    start_time: Instant,
    end_time: Option<Instant>,
    operation_count: u64,
}

impl Default for ThroughputCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputCalculator {
    /// Create a calculator whose clock starts now
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            operation_count: 0,
        }
    }

    /// Record one completed operation
    pub fn record_operation(&mut self) {
        self.operation_count += 1;
    }

    /// Freeze the measurement window
    pub fn stop(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Get current throughput metrics
    pub fn metrics(&self) -> ThroughputMetrics {
        let elapsed = self
            .end_time
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start_time);
        let duration_secs = elapsed.as_secs_f64();

        let operations_per_second = if duration_secs > 0.0 {
            self.operation_count as f64 / duration_secs
        } else {
            0.0
        };

        ThroughputMetrics {
            operations_per_second,
            total_operations: self.operation_count,
            duration_ns: elapsed.as_nanos() as u64,
        }
    }
}
