//! # Benchmark Engine Module
//!
//! This module contains the concurrency harness that drives a benchmark run:
//! it opens one shared hypervisor connection, fans the configured number of
//! workers out over a bounded executor pool, drains their outcomes as they
//! complete and closes the connection once every worker has reported.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: Immutable parameters of a run, built from CLI arguments
//! - **BenchmarkRunner**: Orchestrates the run and owns its cancellation token
//! - **CompletionLatch**: Countdown the harness waits on before tearing down
//! - **HarnessPhase**: Observable lifecycle of a run
//!
//! ## Run Lifecycle
//!
//! 1. **Idle → Launching**: Connect. Failure is fatal and no worker starts.
//! 2. **Launching → Running**: Enqueue every job, arm the latch, start executors.
//! 3. **Running → Draining**: Executors work through the queue while the
//!    drainer logs each outcome in completion order and builds the tally.
//! 4. **Draining → Complete**: The latch reaches zero, executors are joined,
//!    the connection is closed exactly once and the tally is returned.
//!
//! ## Concurrency Handling
//!
//! Hypervisor calls block, so each executor is a `spawn_blocking` loop pulling
//! job ids from a shared `crossbeam` queue. Executors push outcomes into a
//! small bounded `mpsc` channel with `blocking_send`; a slow drainer slows the
//! executors down and no outcome is ever dropped. The latch is counted down
//! only after the outcome has been pushed.

use crate::{
    cli::Args,
    hypervisor::{BackendError, Connection},
    results::{BenchmarkTally, TallyCollector},
    utils::{
        capacity_bytes, format_bytes, format_duration, validate_payload_size, validate_pool_size,
    },
    volume::VolumeSpec,
    worker::{BenchmarkWorker, WorkerContext, WorkerOutcome, WorkerSettings},
};
use anyhow::Result;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A helper struct to provide a consistent, single source of truth for displaying
/// the run configuration.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
}

impl std::fmt::Display for BenchmarkConfigDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark against: {}", config.uri)?;
        writeln!(f, "  Workers:            {}", config.workers)?;
        writeln!(f, "  Executors:          {}", config.executor_count())?;
        writeln!(
            f,
            "  Storage Pool:       {} ({})",
            config.pool,
            config.pool_path.display()
        )?;
        writeln!(
            f,
            "  Volume Capacity:    {}",
            format_bytes(config.capacity_bytes)
        )?;
        writeln!(
            f,
            "  Payload:            {}",
            format_bytes(config.payload_len() as u64)
        )?;
        let timeout = config
            .timeout
            .map_or("None".to_string(), format_duration);
        writeln!(f, "  Worker Timeout:     {}", timeout)?;
        writeln!(
            f,
            "  Scratch Directory:  {}{}",
            config.scratch_dir.display(),
            if config.keep_temp_files {
                " (files kept)"
            } else {
                ""
            }
        )?;
        if config.delete_volumes {
            writeln!(f, "  Volumes:            deleted after use")?;
        }
        if let Some(seed) = config.seed {
            writeln!(f, "  Seed:               {}", seed)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for benchmark execution
///
/// This structure encapsulates all parameters of a run. It is immutable once
/// the run starts and is written into the JSON report alongside the results.
///
/// ## Key Configuration Categories
///
/// - **Target**: Connection URI, storage pool and its backing path
/// - **Workload**: Worker count, volume capacity and upload payload
/// - **Execution**: Executor pool size, per-worker deadline, RNG seed
/// - **Housekeeping**: Scratch directory, temp-file retention, volume deletion
#[derive(Clone, Debug, Serialize)]
pub struct BenchmarkConfig {
    /// Number of workers to launch
    pub workers: usize,

    /// Hypervisor connection URI
    pub uri: String,

    /// Storage pool volumes are created in
    pub pool: String,

    /// Directory backing the pool, used to build volume paths
    pub pool_path: PathBuf,

    /// Capacity of every created volume; also the exact transfer length
    pub capacity_bytes: u64,

    /// Upper bound on concurrently running workers
    pub pool_size: usize,

    /// Per-worker deadline covering the whole lifecycle
    pub timeout: Option<Duration>,

    /// Directory scratch files are created in
    pub scratch_dir: PathBuf,

    /// Keep scratch files after the run and list them in the tally
    pub keep_temp_files: bool,

    /// Delete volumes from their pool once each worker is done
    pub delete_volumes: bool,

    /// Upload payload size; `None` uploads the fixed default payload
    pub payload_size: Option<usize>,

    /// Seed for the volume-name RNG; `None` seeds from entropy
    pub seed: Option<u64>,

    /// Number of failures recorded verbatim in the tally
    pub error_samples: usize,

    /// Capacity of the outcome channel between executors and the drainer
    pub channel_capacity: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            workers: crate::defaults::WORKERS,
            uri: crate::defaults::URI.to_string(),
            pool: crate::defaults::POOL.to_string(),
            pool_path: PathBuf::from(crate::defaults::POOL_PATH),
            capacity_bytes: crate::defaults::CAPACITY_MIB * 1024 * 1024,
            pool_size: crate::defaults::POOL_SIZE,
            timeout: None,
            scratch_dir: PathBuf::from(crate::defaults::SCRATCH_DIR),
            keep_temp_files: false,
            delete_volumes: false,
            payload_size: None,
            seed: None,
            error_samples: crate::defaults::ERROR_SAMPLES,
            channel_capacity: crate::defaults::CHANNEL_CAPACITY,
        }
    }
}

impl BenchmarkConfig {
    /// Create benchmark configuration from CLI arguments
    ///
    /// ## Parameters
    /// - `args`: Parsed command-line arguments
    ///
    /// ## Returns
    /// - `Ok(BenchmarkConfig)`: Valid configuration ready for use
    /// - `Err(anyhow::Error)`: Configuration validation failure
    ///
    /// ## Validation
    /// - Pool size must be between 1 and the supported maximum
    /// - Volume capacity must be non-zero and representable in bytes
    /// - The payload must fit in one volume
    pub fn from_args(args: &Args) -> Result<Self> {
        validate_pool_size(args.pool_size)?;
        let capacity_bytes = capacity_bytes(args.capacity_mib)?;

        let config = Self {
            workers: args.workers,
            uri: args.uri.clone(),
            pool: args.pool.clone(),
            pool_path: args.pool_path.clone(),
            capacity_bytes,
            pool_size: args.pool_size,
            timeout: args.timeout,
            scratch_dir: args.scratch_dir.clone(),
            keep_temp_files: args.keep_temp_files,
            delete_volumes: args.delete_volumes,
            payload_size: args.payload_size,
            seed: args.seed,
            error_samples: args.error_samples,
            channel_capacity: crate::defaults::CHANNEL_CAPACITY,
        };

        validate_payload_size(config.payload_len(), config.capacity_bytes)?;
        Ok(config)
    }

    pub fn payload_len(&self) -> usize {
        self.payload_size.unwrap_or(crate::defaults::PAYLOAD.len())
    }

    /// The bytes every worker uploads
    ///
    /// A custom size repeats the default payload until it is long enough.
    pub fn payload(&self) -> Vec<u8> {
        match self.payload_size {
            None => crate::defaults::PAYLOAD.to_vec(),
            Some(size) => crate::defaults::PAYLOAD
                .iter()
                .copied()
                .cycle()
                .take(size)
                .collect(),
        }
    }

    pub fn volume_spec(&self) -> VolumeSpec {
        VolumeSpec {
            pool: self.pool.clone(),
            pool_path: self.pool_path.clone(),
            capacity_bytes: self.capacity_bytes,
        }
    }

    /// Number of executors actually started: never more than there are workers
    pub fn executor_count(&self) -> usize {
        self.pool_size.min(self.workers)
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            volume: self.volume_spec(),
            payload: self.payload(),
            scratch_dir: self.scratch_dir.clone(),
            keep_temp_files: self.keep_temp_files,
            delete_volumes: self.delete_volumes,
        }
    }
}

/// Lifecycle of a benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarnessPhase {
    Idle,
    Launching,
    Running,
    Draining,
    Complete,
}

impl std::fmt::Display for HarnessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessPhase::Idle => write!(f, "idle"),
            HarnessPhase::Launching => write!(f, "launching"),
            HarnessPhase::Running => write!(f, "running"),
            HarnessPhase::Draining => write!(f, "draining"),
            HarnessPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Failures that stop a whole run
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to connect to {uri}: {source}")]
    ConnectionFailed {
        uri: String,
        #[source]
        source: BackendError,
    },

    #[error("harness task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Metrics(#[from] anyhow::Error),
}

/// Countdown latch awaited by the harness
///
/// Armed with the number of launched workers; every executor counts it down
/// once per outcome, after the outcome has been pushed to the drainer.
#[derive(Debug)]
pub struct CompletionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Count down once; extra count-downs past zero are ignored
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    /// Count down when the returned guard is dropped
    pub fn guard(&self) -> CountDownGuard<'_> {
        CountDownGuard { latch: self }
    }

    /// Wait until the count reaches zero
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a count-down in between is not missed.
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts a [`CompletionLatch`] down on drop, including during unwinding
pub struct CountDownGuard<'a> {
    latch: &'a CompletionLatch,
}

impl Drop for CountDownGuard<'_> {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

/// Everything one executor thread needs
struct Executor<C: Connection> {
    id: usize,
    conn: Arc<C>,
    jobs: Receiver<usize>,
    outcomes: mpsc::Sender<WorkerOutcome>,
    latch: Arc<CompletionLatch>,
    worker: BenchmarkWorker,
    rng: StdRng,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl<C: Connection> Executor<C> {
    /// Pull jobs until the queue is empty
    fn run(mut self) {
        trace!("Executor {} started", self.id);
        let mut executed = 0usize;

        while let Ok(worker_id) = self.jobs.recv() {
            let _countdown = self.latch.guard();

            let outcome = if self.cancel.is_cancelled() {
                WorkerOutcome::cancelled(worker_id)
            } else {
                let ctx = WorkerContext::new(self.cancel.clone(), self.timeout);
                self.worker.run(worker_id, &*self.conn, &mut self.rng, &ctx)
            };

            if self.outcomes.blocking_send(outcome).is_err() {
                warn!("Outcome channel closed; outcome of worker {} lost", worker_id);
            }
            executed += 1;
        }

        trace!("Executor {} finished after {} workers", self.id, executed);
    }
}

/// Benchmark runner that coordinates a run against one connection
///
/// ## Usage Pattern
///
/// ```rust,no_run
/// # use virt_storage_bench::benchmark::{BenchmarkConfig, BenchmarkRunner};
/// # use virt_storage_bench::hypervisor::MemoryHypervisor;
/// #
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = BenchmarkConfig {
///     workers: 10,
///     uri: "test:///default".to_string(),
///     ..BenchmarkConfig::default()
/// };
/// let hypervisor = MemoryHypervisor::new();
/// hypervisor.add_pool(&config.pool, &config.pool_path);
///
/// let runner = BenchmarkRunner::new(config.clone());
/// let tally = runner.run(move || hypervisor.connect(&config.uri)).await?;
/// println!("{} of {} workers succeeded", tally.succeeded, tally.launched);
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    /// Benchmark configuration parameters
    config: BenchmarkConfig,

    /// Cancels every worker of the run
    cancel: CancellationToken,

    phase: Mutex<HarnessPhase>,
}

impl BenchmarkRunner {
    /// Create a new benchmark runner
    ///
    /// ## Parameters
    /// - `config`: Benchmark configuration parameters
    ///
    /// ## Returns
    /// Runner in the [`HarnessPhase::Idle`] phase
    pub fn new(config: BenchmarkConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            phase: Mutex::new(HarnessPhase::Idle),
        }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Token that cancels the run; workers that have not started yet are
    /// reported as cancelled without touching the connection
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> HarnessPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, next: HarnessPhase) {
        let mut phase = self.phase.lock();
        debug!("Harness phase: {} -> {}", *phase, next);
        *phase = next;
    }

    /// Run the benchmark and return the tally
    ///
    /// ## Parameters
    /// - `connect`: Opens the shared connection; runs on a blocking thread
    ///
    /// ## Returns
    /// - `Ok(BenchmarkTally)`: Every launched worker has reported
    /// - `Err(HarnessError)`: The run could not start
    ///
    /// Per-worker failures never fail the run; they are counted in the tally.
    pub async fn run<C, F>(&self, connect: F) -> Result<BenchmarkTally, HarnessError>
    where
        C: Connection,
        F: FnOnce() -> Result<C, BackendError> + Send + 'static,
    {
        let started = Instant::now();
        let config = &self.config;
        let workers = config.workers;

        info!("{}", BenchmarkConfigDisplay { config });

        // Workers report their own temp-file failures if this does not work out.
        if workers > 0 {
            if let Err(e) = tokio::fs::create_dir_all(&config.scratch_dir).await {
                warn!(
                    "Cannot create scratch directory {}: {}",
                    config.scratch_dir.display(),
                    e
                );
            }
        }

        debug!("Creating connection to {}", config.uri);
        let conn = tokio::task::spawn_blocking(connect)
            .await?
            .map_err(|source| HarnessError::ConnectionFailed {
                uri: config.uri.clone(),
                source,
            })?;
        debug!("Created connection to {}", conn.uri());
        let conn = Arc::new(conn);
        self.set_phase(HarnessPhase::Launching);

        let (job_tx, job_rx) = crossbeam::channel::unbounded::<usize>();
        let mut enqueued = 0usize;
        for worker_id in 0..workers {
            if job_tx.send(worker_id).is_err() {
                break;
            }
            enqueued += 1;
        }
        drop(job_tx);

        let latch = Arc::new(CompletionLatch::new(enqueued));
        let (outcome_tx, outcome_rx) = mpsc::channel(config.channel_capacity.max(1));
        let tally = TallyCollector::new(enqueued, config.error_samples)?;
        let drainer = tokio::spawn(drain_outcomes(outcome_rx, tally));

        let mut master_rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let worker = BenchmarkWorker::new(config.worker_settings());
        let executors = config.executor_count().min(enqueued);

        let handles: Vec<_> = (0..executors)
            .map(|id| {
                let executor = Executor {
                    id,
                    conn: Arc::clone(&conn),
                    jobs: job_rx.clone(),
                    outcomes: outcome_tx.clone(),
                    latch: Arc::clone(&latch),
                    worker: worker.clone(),
                    rng: StdRng::seed_from_u64(master_rng.gen()),
                    cancel: self.cancel.clone(),
                    timeout: config.timeout,
                };
                tokio::task::spawn_blocking(move || executor.run())
            })
            .collect();
        drop(job_rx);
        drop(outcome_tx);

        self.set_phase(HarnessPhase::Running);
        info!("Launched {} workers on {} executors", enqueued, executors);

        self.set_phase(HarnessPhase::Draining);
        latch.wait().await;
        debug!("All {} workers reported", enqueued);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Executor terminated abnormally: {}", e);
            }
        }

        match Arc::try_unwrap(conn) {
            Ok(conn) => {
                let uri = conn.uri().to_string();
                match tokio::task::spawn_blocking(move || conn.close()).await? {
                    Ok(()) => debug!("Closed connection to {}", uri),
                    Err(e) => warn!("Failed to close connection to {}: {}", uri, e),
                }
            }
            Err(_) => warn!("Connection still referenced after all workers finished; not closing"),
        }

        let tally = drainer.await?;
        self.set_phase(HarnessPhase::Complete);

        let tally = tally.finish(started.elapsed());
        info!(
            "Benchmark completed: {} succeeded, {} failed in {}",
            tally.succeeded,
            tally.failed,
            format_duration(tally.wall_clock)
        );
        Ok(tally)
    }
}

/// Receive outcomes until every executor has hung up
async fn drain_outcomes(
    mut outcomes: mpsc::Receiver<WorkerOutcome>,
    mut tally: TallyCollector,
) -> TallyCollector {
    while let Some(outcome) = outcomes.recv().await {
        report_outcome(&outcome);
        tally.record(outcome);
    }
    debug!("Drainer finished after {} outcomes", tally.completed());
    tally
}

fn report_outcome(outcome: &WorkerOutcome) {
    match &outcome.result {
        Ok(report) => info!(
            "Worker {} completed volume {}: {} uploaded, {} downloaded in {}",
            outcome.worker_id,
            report.volume_name,
            format_bytes(report.bytes_uploaded),
            format_bytes(report.bytes_downloaded),
            format_duration(outcome.elapsed)
        ),
        Err(failure) => warn!("Worker {} failed: {}", outcome.worker_id, failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{FaultPlan, FaultRule, MemoryHypervisor};
    use crate::worker::FailureKind;
    use clap::Parser;
    use tempfile::TempDir;

    fn test_config(workers: usize, scratch: &TempDir) -> BenchmarkConfig {
        BenchmarkConfig {
            workers,
            uri: "test:///default".to_string(),
            capacity_bytes: 4096,
            pool_size: 4,
            scratch_dir: scratch.path().to_path_buf(),
            ..BenchmarkConfig::default()
        }
    }

    fn hypervisor(faults: FaultPlan) -> MemoryHypervisor {
        let hv = MemoryHypervisor::with_faults(faults);
        hv.add_pool(crate::defaults::POOL, crate::defaults::POOL_PATH);
        hv
    }

    /// Test configuration creation from default arguments
    #[test]
    fn test_benchmark_config_creation() {
        let args = Args::parse_from(["virt-storage-bench"]);
        let config = BenchmarkConfig::from_args(&args).unwrap();

        assert_eq!(config.workers, 700);
        assert_eq!(config.capacity_bytes, 10 * 1024 * 1024);
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.executor_count(), 64);
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.payload(), crate::defaults::PAYLOAD);
    }

    /// Test that invalid arguments are rejected
    #[test]
    fn test_benchmark_config_validation() {
        let args = Args::parse_from(["virt-storage-bench", "--pool-size", "0"]);
        assert!(BenchmarkConfig::from_args(&args).is_err());

        let args = Args::parse_from(["virt-storage-bench", "--capacity-mib", "0"]);
        assert!(BenchmarkConfig::from_args(&args).is_err());

        let args = Args::parse_from([
            "virt-storage-bench",
            "--capacity-mib",
            "1",
            "--payload-size",
            "2097152",
        ]);
        assert!(BenchmarkConfig::from_args(&args).is_err());
    }

    /// Test that a sized payload repeats the default pattern
    #[test]
    fn test_payload_sizing() {
        let config = BenchmarkConfig {
            payload_size: Some(crate::defaults::PAYLOAD.len() * 2 + 3),
            ..BenchmarkConfig::default()
        };
        let payload = config.payload();
        assert_eq!(payload.len(), config.payload_len());
        assert!(payload.starts_with(crate::defaults::PAYLOAD));
        assert_eq!(&payload[crate::defaults::PAYLOAD.len()..][..3], &crate::defaults::PAYLOAD[..3]);
    }

    /// Test that the executor pool never outnumbers the workers
    #[test]
    fn test_executor_count() {
        let mut config = BenchmarkConfig::default();
        config.workers = 3;
        assert_eq!(config.executor_count(), 3);
        config.workers = 0;
        assert_eq!(config.executor_count(), 0);
    }

    /// Test the latch reaches zero once and ignores extra count-downs
    #[tokio::test]
    async fn test_completion_latch() {
        let latch = Arc::new(CompletionLatch::new(3));
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };

        for _ in 0..3 {
            let latch = Arc::clone(&latch);
            tokio::task::spawn_blocking(move || {
                let _guard = latch.guard();
            })
            .await
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
    }

    /// Test an unarmed latch does not block
    #[tokio::test]
    async fn test_completion_latch_zero() {
        let latch = CompletionLatch::new(0);
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap();
    }

    /// Test a small run end to end and the final phase
    #[tokio::test]
    async fn test_runner_completes_all_workers() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let config = test_config(6, &scratch);
        let runner = BenchmarkRunner::new(config);
        assert_eq!(runner.phase(), HarnessPhase::Idle);

        let connect_hv = hv.clone();
        let tally = runner
            .run(move || connect_hv.connect("test:///default"))
            .await
            .unwrap();

        assert_eq!(runner.phase(), HarnessPhase::Complete);
        assert_eq!(tally.launched, 6);
        assert_eq!(tally.succeeded, 6);
        assert_eq!(tally.completed(), 6);
        assert_eq!(tally.bytes_downloaded, 6 * 4096);

        let stats = hv.stats();
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.connections_closed, 1);
        assert_eq!(stats.volumes_created, 6);
        assert_eq!(stats.volumes_freed, 6);
    }

    /// Test that a failed connection is fatal and launches nothing
    #[tokio::test]
    async fn test_runner_connection_failure() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan {
            connect: FaultRule::Always,
            ..FaultPlan::default()
        });
        let runner = BenchmarkRunner::new(test_config(3, &scratch));

        let connect_hv = hv.clone();
        let err = runner
            .run(move || connect_hv.connect("test:///default"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::ConnectionFailed { .. }));
        assert_eq!(runner.phase(), HarnessPhase::Idle);
        assert_eq!(hv.stats().pool_lookups, 0);
    }

    /// Test that cancelling before the run reports every worker as cancelled
    #[tokio::test]
    async fn test_runner_cancelled_before_start() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let runner = BenchmarkRunner::new(test_config(5, &scratch));
        runner.cancellation_token().cancel();

        let connect_hv = hv.clone();
        let tally = runner
            .run(move || connect_hv.connect("test:///default"))
            .await
            .unwrap();

        assert_eq!(tally.failures_of(FailureKind::Cancelled), 5);
        assert_eq!(tally.succeeded, 0);
        assert_eq!(hv.stats().pool_lookups, 0);
        assert_eq!(hv.stats().connections_closed, 1);
    }
}
