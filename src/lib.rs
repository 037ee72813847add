//! # Virt Storage Benchmark Library
//!
//! A concurrency benchmark for hypervisor storage-volume streaming. Many
//! workers share one hypervisor connection; each creates a volume, uploads a
//! payload into it through a stream and downloads it back into a scratch file.
//! The run reports how many workers succeeded, why the others failed and how
//! long each lifecycle step took.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `hypervisor`: Backend traits plus the in-process and libvirt backends
//! - `volume`: Volume naming, descriptors and the two streaming transfers
//! - `stream_io`: `Read`/`Write` adapters and scoped cleanup for stream sessions
//! - `worker`: One worker's lifecycle, its errors and its outcome
//! - `benchmark`: The harness that fans workers out and waits for all of them
//! - `metrics`: Per-step latency histograms and throughput
//! - `results`: Tally, summary output and the JSON report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use virt_storage_bench::{BenchmarkConfig, BenchmarkRunner, MemoryHypervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         workers: 100,
//!         uri: "test:///default".to_string(),
//!         capacity_bytes: 1024 * 1024,
//!         ..BenchmarkConfig::default()
//!     };
//!
//!     let hypervisor = MemoryHypervisor::new();
//!     hypervisor.add_pool(&config.pool, &config.pool_path);
//!
//!     let runner = BenchmarkRunner::new(config.clone());
//!     let tally = runner.run(move || hypervisor.connect(&config.uri)).await?;
//!
//!     println!("{} succeeded, {} failed", tally.succeeded, tally.failed);
//!     Ok(())
//! }
//! ```

/// Benchmark harness
///
/// Contains `BenchmarkRunner` and `BenchmarkConfig`. The harness handles:
/// - Opening and closing the shared connection
/// - Bounded fan-out of workers over blocking executor threads
/// - Draining outcomes in completion order
/// - Waiting for every launched worker before returning
pub mod benchmark;

/// Command-line interface
pub mod cli;

/// Hypervisor storage abstraction and backends
pub mod hypervisor;

pub mod logging;

/// Per-step latency and throughput measurement using HDR histograms
pub mod metrics;

/// Result aggregation and output
///
/// Builds the tally from worker outcomes, prints the end-of-run summary and
/// writes the JSON report with run metadata.
pub mod results;

/// Stream session adapters
pub mod stream_io;

pub mod utils;

/// Volume naming, creation and streaming transfers
pub mod volume;

/// The worker lifecycle
pub mod worker;

// Re-export key types for convenient library usage

/// Main benchmark execution engine
pub use benchmark::{BenchmarkConfig, BenchmarkRunner, HarnessError, HarnessPhase};

pub use cli::Args;

/// Backend traits and the in-process backend
pub use hypervisor::{BackendError, Connection, MemoryHypervisor};

pub use metrics::{LatencyMetrics, ThroughputMetrics};

/// Result collection and management
pub use results::{BenchmarkTally, ResultsManager};

pub use worker::{FailureKind, LifecycleStep, WorkerOutcome};

/// The current version of the benchmark
///
/// Populated from Cargo.toml and recorded in the JSON report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default number of workers launched by one run
    pub const WORKERS: usize = 700;

    /// Default connection URI: the local system hypervisor
    pub const URI: &str = "qemu:///system";

    /// Default storage pool
    pub const POOL: &str = "default";

    /// Default directory backing the storage pool
    pub const POOL_PATH: &str = "/var/lib/libvirt/images";

    /// Default volume capacity, in MiB
    pub const CAPACITY_MIB: u64 = 10;

    /// Default number of executor threads
    ///
    /// Bounds how many workers talk to the hypervisor at once. Higher values
    /// increase contention on the control plane, which is what the benchmark
    /// is meant to measure, but very high values mostly measure thread churn.
    pub const POOL_SIZE: usize = 64;

    /// Default directory for downloaded scratch files
    pub const SCRATCH_DIR: &str = "/tmp/performance";

    /// Default number of failure messages kept verbatim in the report
    pub const ERROR_SAMPLES: usize = 10;

    /// Capacity of the outcome channel between executors and the drainer
    pub const CHANNEL_CAPACITY: usize = 1;

    /// Payload uploaded by every worker unless a size is given
    pub const PAYLOAD: &[u8] =
        b"virt-storage-bench payload: streamed into a volume and read back\n";
}
