use crate::worker::{LifecycleStep, WorkerOutcome};
use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Percentiles reported for every latency distribution
pub const DEFAULT_PERCENTILES: [f64; 4] = [50.0, 95.0, 99.0, 99.9];

/// Latency measurement types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyType {
    Create,
    WritePopulate,
    ReadExtract,
    /// Whole worker, successful or not
    Worker,
}

impl LatencyType {
    pub const ALL: [LatencyType; 4] = [
        LatencyType::Create,
        LatencyType::WritePopulate,
        LatencyType::ReadExtract,
        LatencyType::Worker,
    ];
}

impl From<LifecycleStep> for LatencyType {
    fn from(step: LifecycleStep) -> Self {
        match step {
            LifecycleStep::Create => LatencyType::Create,
            LifecycleStep::WritePopulate => LatencyType::WritePopulate,
            LifecycleStep::ReadExtract => LatencyType::ReadExtract,
        }
    }
}

impl std::fmt::Display for LatencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyType::Create => write!(f, "Create"),
            LatencyType::WritePopulate => write!(f, "Write-Populate"),
            LatencyType::ReadExtract => write!(f, "Read-Extract"),
            LatencyType::Worker => write!(f, "Worker Total"),
        }
    }
}

/// Latency distribution including percentiles and statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub latency_type: LatencyType,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: usize,
}

/// Percentile value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Worker rate and stream bandwidth over the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub workers_per_second: f64,
    pub bytes_per_second: f64,
    pub total_workers: usize,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub duration_ns: u64,
}

/// Combined performance metrics for a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub latency: Vec<LatencyMetrics>,
    pub throughput: ThroughputMetrics,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Latency collector using HDR histogram for accurate measurement
pub struct LatencyCollector {
    histogram: Histogram<u64>,
    latency_type: LatencyType,
    sample_count: usize,
}

impl LatencyCollector {
    /// Create a new latency collector
    pub fn new(latency_type: LatencyType) -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;

        Ok(Self {
            histogram,
            latency_type,
            sample_count: 0,
        })
    }

    /// Record a latency measurement
    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let latency_ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.histogram.record(latency_ns)?;
        self.sample_count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Get the current metrics
    pub fn get_metrics(&self, percentiles: &[f64]) -> LatencyMetrics {
        let percentile_values = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect();

        LatencyMetrics {
            latency_type: self.latency_type,
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            median_ns: self.histogram.value_at_percentile(50.0) as f64,
            std_dev_ns: self.histogram.stdev(),
            percentiles: percentile_values,
            total_samples: self.sample_count,
        }
    }
}

/// Throughput calculator for worker and byte rates
pub struct ThroughputCalculator {
    worker_count: usize,
    bytes_uploaded: u64,
    bytes_downloaded: u64,
}

impl ThroughputCalculator {
    /// Create a new throughput calculator
    pub fn new() -> Self {
        Self {
            worker_count: 0,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        }
    }

    /// Record a finished worker and the bytes it moved
    pub fn record_worker(&mut self, uploaded: u64, downloaded: u64) {
        self.worker_count += 1;
        self.bytes_uploaded += uploaded;
        self.bytes_downloaded += downloaded;
    }

    /// Get throughput over a fixed wall-clock duration
    pub fn metrics_over(&self, elapsed: Duration) -> ThroughputMetrics {
        let duration_secs = elapsed.as_secs_f64();
        let total_bytes = (self.bytes_uploaded + self.bytes_downloaded) as f64;

        let (workers_per_second, bytes_per_second) = if duration_secs > 0.0 {
            (
                self.worker_count as f64 / duration_secs,
                total_bytes / duration_secs,
            )
        } else {
            (0.0, 0.0)
        };

        ThroughputMetrics {
            workers_per_second,
            bytes_per_second,
            total_workers: self.worker_count,
            bytes_uploaded: self.bytes_uploaded,
            bytes_downloaded: self.bytes_downloaded,
            duration_ns: elapsed.as_nanos().min(u64::MAX as u128) as u64,
        }
    }
}

/// Per-step latency and throughput collection for a whole run
pub struct MetricsCollector {
    latency_collectors: Vec<LatencyCollector>,
    pub throughput_calculator: ThroughputCalculator,
    pub percentiles: Vec<f64>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new(percentiles: Vec<f64>) -> Result<Self> {
        let latency_collectors = LatencyType::ALL
            .iter()
            .map(|&t| LatencyCollector::new(t))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            latency_collectors,
            throughput_calculator: ThroughputCalculator::new(),
            percentiles,
        })
    }

    fn collector_mut(&mut self, latency_type: LatencyType) -> Option<&mut LatencyCollector> {
        self.latency_collectors
            .iter_mut()
            .find(|c| c.latency_type == latency_type)
    }

    /// Record one worker outcome
    ///
    /// Step latencies only come from successful workers; the whole-worker
    /// latency is recorded for every outcome.
    pub fn record_outcome(&mut self, outcome: &WorkerOutcome) -> Result<()> {
        if let Some(collector) = self.collector_mut(LatencyType::Worker) {
            collector.record(outcome.elapsed)?;
        }

        match &outcome.result {
            Ok(report) => {
                for step in LifecycleStep::ALL {
                    if let Some(collector) = self.collector_mut(step.into()) {
                        collector.record(report.step_time(step))?;
                    }
                }
                self.throughput_calculator
                    .record_worker(report.bytes_uploaded, report.bytes_downloaded);
            }
            Err(_) => self.throughput_calculator.record_worker(0, 0),
        }

        Ok(())
    }

    /// Get current performance metrics over the given wall-clock duration
    pub fn get_metrics(&self, elapsed: Duration) -> PerformanceMetrics {
        let latency = self
            .latency_collectors
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| c.get_metrics(&self.percentiles))
            .collect();

        PerformanceMetrics {
            latency,
            throughput: self.throughput_calculator.metrics_over(elapsed),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Utility functions for metrics formatting
pub mod utils {
    /// Format latency value for human-readable output
    pub fn format_latency(latency_ns: u64) -> String {
        if latency_ns < 1_000 {
            format!("{}ns", latency_ns)
        } else if latency_ns < 1_000_000 {
            format!("{:.2}μs", latency_ns as f64 / 1_000.0)
        } else if latency_ns < 1_000_000_000 {
            format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
        } else {
            format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
        }
    }
}
