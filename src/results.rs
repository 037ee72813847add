use crate::benchmark::BenchmarkConfig;
use crate::metrics::{
    utils::format_latency, MetricsCollector, PerformanceMetrics, DEFAULT_PERCENTILES,
};
use crate::utils::{format_bytes, format_duration, format_rate};
use crate::worker::{FailureKind, LifecycleStep, WorkerOutcome};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// One recorded worker failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub worker_id: usize,
    pub step: LifecycleStep,
    pub kind: FailureKind,
    pub message: String,
}

/// Aggregate outcome of a benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkTally {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    /// The first failures, in completion order
    pub error_samples: Vec<ErrorSample>,
    pub retained_files: Vec<PathBuf>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub wall_clock: Duration,
    pub metrics: PerformanceMetrics,
}

impl BenchmarkTally {
    /// Number of outcomes received
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Accumulates worker outcomes as the drainer receives them
pub struct TallyCollector {
    launched: usize,
    succeeded: usize,
    failed: usize,
    failures_by_kind: BTreeMap<FailureKind, usize>,
    error_samples: Vec<ErrorSample>,
    max_samples: usize,
    retained_files: Vec<PathBuf>,
    bytes_uploaded: u64,
    bytes_downloaded: u64,
    metrics: MetricsCollector,
}

impl TallyCollector {
    /// Create a new collector for `launched` workers keeping up to `max_samples` failures
    pub fn new(launched: usize, max_samples: usize) -> Result<Self> {
        Ok(Self {
            launched,
            succeeded: 0,
            failed: 0,
            failures_by_kind: BTreeMap::new(),
            error_samples: Vec::new(),
            max_samples,
            retained_files: Vec::new(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            metrics: MetricsCollector::new(DEFAULT_PERCENTILES.to_vec())?,
        })
    }

    /// Record one outcome
    pub fn record(&mut self, outcome: WorkerOutcome) {
        if let Err(e) = self.metrics.record_outcome(&outcome) {
            warn!("Failed to record latency for worker {}: {}", outcome.worker_id, e);
        }

        match outcome.result {
            Ok(report) => {
                self.succeeded += 1;
                self.bytes_uploaded += report.bytes_uploaded;
                self.bytes_downloaded += report.bytes_downloaded;
                if let Some(path) = report.retained_file {
                    self.retained_files.push(path);
                }
            }
            Err(failure) => {
                self.failed += 1;
                *self.failures_by_kind.entry(failure.kind()).or_insert(0) += 1;
                if self.error_samples.len() < self.max_samples {
                    self.error_samples.push(ErrorSample {
                        worker_id: outcome.worker_id,
                        step: failure.step,
                        kind: failure.kind(),
                        message: failure.to_string(),
                    });
                }
            }
        }
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Freeze the tally with the run's wall-clock time
    pub fn finish(self, wall_clock: Duration) -> BenchmarkTally {
        BenchmarkTally {
            launched: self.launched,
            succeeded: self.succeeded,
            failed: self.failed,
            failures_by_kind: self.failures_by_kind,
            error_samples: self.error_samples,
            retained_files: self.retained_files,
            bytes_uploaded: self.bytes_uploaded,
            bytes_downloaded: self.bytes_downloaded,
            wall_clock,
            metrics: self.metrics.get_metrics(wall_clock),
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Benchmark metadata
#[derive(Debug, Serialize)]
pub struct BenchmarkMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// JSON report layout
#[derive(Debug, Serialize)]
pub struct BenchmarkReport<'a> {
    pub metadata: BenchmarkMetadata,
    pub configuration: &'a BenchmarkConfig,
    pub results: &'a BenchmarkTally,
}

/// Results manager for the summary and the JSON report
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    run_id: String,
}

impl ResultsManager {
    /// Create a new results manager
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            run_id: crate::utils::generate_run_id(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Log a human-readable summary of the run
    pub fn print_summary(&self, tally: &BenchmarkTally) {
        info!("-----------------------------------------------------------------");
        info!("Benchmark Results (run {})", self.run_id);
        info!(
            "  Workers:            {} launched, {} succeeded, {} failed",
            tally.launched, tally.succeeded, tally.failed
        );
        info!("  Wall Clock:         {}", format_duration(tally.wall_clock));
        info!(
            "  Transferred:        {} uploaded, {} downloaded",
            format_bytes(tally.bytes_uploaded),
            format_bytes(tally.bytes_downloaded)
        );
        info!(
            "  Throughput:         {:.2} workers/s, {}",
            tally.metrics.throughput.workers_per_second,
            format_rate(tally.metrics.throughput.bytes_per_second)
        );

        for latency in &tally.metrics.latency {
            let percentiles: Vec<String> = latency
                .percentiles
                .iter()
                .map(|p| format!("P{}={}", p.percentile, format_latency(p.value_ns)))
                .collect();
            info!(
                "  {:<19} mean={} {}",
                format!("{}:", latency.latency_type),
                format_latency(latency.mean_ns as u64),
                percentiles.join(" ")
            );
        }

        for (kind, count) in &tally.failures_by_kind {
            warn!("  Failures ({}): {}", kind, count);
        }
        for sample in &tally.error_samples {
            warn!("  Worker {}: {}", sample.worker_id, sample.message);
        }
        if !tally.retained_files.is_empty() {
            info!("  Retained {} scratch files", tally.retained_files.len());
        }
        info!("-----------------------------------------------------------------");
    }

    /// Write the JSON report if an output file was configured
    ///
    /// ## Returns
    /// - `Ok(Some(path))`: The report was written to `path`
    /// - `Ok(None)`: No output file configured
    pub fn write_report(
        &self,
        config: &BenchmarkConfig,
        tally: &BenchmarkTally,
    ) -> Result<Option<PathBuf>> {
        let Some(output_file) = &self.output_file else {
            return Ok(None);
        };

        let report = BenchmarkReport {
            metadata: BenchmarkMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            configuration: config,
            results: tally,
        };

        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(output_file, json)
            .with_context(|| format!("Failed to write report to {}", output_file.display()))?;

        info!("Results written to: {:?}", output_file);
        Ok(Some(output_file.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerError, WorkerFailure, WorkerReport};
    use tempfile::TempDir;

    fn success(worker_id: usize) -> WorkerOutcome {
        WorkerOutcome {
            worker_id,
            elapsed: Duration::from_millis(5),
            result: Ok(WorkerReport {
                volume_name: format!("volume{:04}", worker_id),
                bytes_uploaded: 10,
                bytes_downloaded: 100,
                create_time: Duration::from_millis(1),
                write_time: Duration::from_millis(2),
                read_time: Duration::from_millis(2),
                retained_file: Some(PathBuf::from(format!(
                    "/tmp/performance/cloudinit{}",
                    worker_id
                ))),
            }),
        }
    }

    fn cancelled(worker_id: usize) -> WorkerOutcome {
        WorkerOutcome {
            worker_id,
            elapsed: Duration::ZERO,
            result: Err(WorkerFailure::new(LifecycleStep::Create, WorkerError::Cancelled)),
        }
    }

    #[test]
    fn test_tally_counts_and_samples() {
        let mut collector = TallyCollector::new(5, 2).unwrap();
        collector.record(success(0));
        collector.record(cancelled(1));
        collector.record(cancelled(2));
        collector.record(cancelled(3));
        collector.record(success(4));
        assert_eq!(collector.completed(), 5);

        let tally = collector.finish(Duration::from_secs(1));
        assert_eq!(tally.launched, 5);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.failed, 3);
        assert_eq!(tally.completed(), 5);
        assert_eq!(tally.failures_of(FailureKind::Cancelled), 3);
        assert_eq!(tally.failures_of(FailureKind::Timeout), 0);
        assert_eq!(tally.error_samples.len(), 2);
        assert_eq!(tally.error_samples[0].worker_id, 1);
        assert_eq!(tally.error_samples[1].worker_id, 2);
        assert_eq!(tally.retained_files.len(), 2);
        assert_eq!(tally.bytes_uploaded, 20);
        assert_eq!(tally.bytes_downloaded, 200);
        assert_eq!(tally.metrics.throughput.total_workers, 5);
    }

    #[test]
    fn test_empty_tally() {
        let tally = TallyCollector::new(0, 10).unwrap().finish(Duration::ZERO);
        assert_eq!(tally.completed(), 0);
        assert!(tally.failures_by_kind.is_empty());
        assert!(tally.metrics.latency.is_empty());
    }

    #[test]
    fn test_write_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let manager = ResultsManager::new(Some(&path));

        let mut collector = TallyCollector::new(2, 10).unwrap();
        collector.record(success(0));
        collector.record(cancelled(1));
        let tally = collector.finish(Duration::from_millis(10));
        manager.print_summary(&tally);

        let written = manager
            .write_report(&BenchmarkConfig::default(), &tally)
            .unwrap();
        assert_eq!(written.as_deref(), Some(path.as_path()));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["metadata"]["run_id"], manager.run_id());
        assert_eq!(json["metadata"]["version"], crate::VERSION);
        assert_eq!(json["configuration"]["workers"], 700);
        assert_eq!(json["results"]["succeeded"], 1);
        assert_eq!(json["results"]["failures_by_kind"]["cancelled"], 1);
        assert_eq!(json["results"]["error_samples"][0]["step"], "create");
    }

    #[test]
    fn test_no_output_file() {
        let manager = ResultsManager::new(None);
        let tally = TallyCollector::new(0, 10).unwrap().finish(Duration::ZERO);
        assert!(manager
            .write_report(&BenchmarkConfig::default(), &tally)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();

        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
        assert_eq!(info.rust_version, "1.70");
    }
}
