//! # Benchmark Worker Module
//!
//! One worker is one unit of work: create a volume, upload the payload into
//! it, download it back into a scratch file. The three steps run in order and
//! the first failure ends the worker; every acquired handle is released
//! before the outcome leaves this module.
//!
//! ## Key Components
//!
//! - **WorkerContext**: Cancellation token plus an optional deadline, checked
//!   before every remote call
//! - **WorkerError / FailureKind**: Per-worker error taxonomy
//! - **WorkerOutcome**: Exactly one per launched worker, success or failure
//! - **BenchmarkWorker**: Runs the lifecycle against a shared connection
//!
//! Per-worker failures are values, not panics. A worker never stops another
//! worker and nothing is retried.

use crate::hypervisor::{BackendError, Connection, Volume};
use crate::stream_io::interrupt_of;
use crate::volume::{self, VolumeSpec};
use rand::Rng;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why a worker stopped before its next remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Cancellation and deadline state handed to a single worker
#[derive(Debug, Clone)]
pub struct WorkerContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl WorkerContext {
    /// Start the worker clock now; `timeout` bounds the whole lifecycle
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        Self {
            cancel,
            timeout,
            deadline,
        }
    }

    /// A context that is never cancelled and never expires
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match (self.deadline, self.timeout) {
            (Some(deadline), Some(timeout)) if Instant::now() >= deadline => {
                Err(Interrupt::DeadlineExceeded(timeout))
            }
            _ => Ok(()),
        }
    }
}

/// Direction of a stream transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// Errors a single worker can end with
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("can't find storage pool '{pool}': {source}")]
    PoolNotFound {
        pool: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to create volume '{name}': {source}")]
    CreateFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("error retrieving info for volume '{name}': {source}")]
    InfoRetrievalFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("stream creation error: {0}")]
    StreamOpenFailed(#[source] BackendError),

    #[error("error while uploading volume '{name}': {source}")]
    UploadBindFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("volume download error for '{name}': {source}")]
    DownloadBindFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("{direction} copy failed: {source}")]
    CopyFailed {
        direction: TransferDirection,
        #[source]
        source: io::Error,
    },

    #[error("cannot create temp file in {}: {source}", .path.display())]
    TempFileCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("worker cancelled")]
    Cancelled,
}

impl From<Interrupt> for WorkerError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::DeadlineExceeded(timeout) => WorkerError::Timeout(timeout),
            Interrupt::Cancelled => WorkerError::Cancelled,
        }
    }
}

impl WorkerError {
    /// Classify an error returned by `io::copy` through the stream adapter
    pub fn from_copy(direction: TransferDirection, err: io::Error) -> Self {
        match interrupt_of(&err) {
            Some(interrupt) => interrupt.into(),
            None => WorkerError::CopyFailed {
                direction,
                source: err,
            },
        }
    }

    /// The stream refused to complete after all bytes went through
    pub fn from_finish(direction: TransferDirection, err: BackendError) -> Self {
        WorkerError::CopyFailed {
            direction,
            source: io::Error::new(io::ErrorKind::Other, err),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            WorkerError::PoolNotFound { .. } => FailureKind::PoolNotFound,
            WorkerError::CreateFailed { .. } => FailureKind::CreateFailed,
            WorkerError::InfoRetrievalFailed { .. } => FailureKind::InfoRetrievalFailed,
            WorkerError::StreamOpenFailed(_) => FailureKind::StreamOpenFailed,
            WorkerError::UploadBindFailed { .. } => FailureKind::UploadBindFailed,
            WorkerError::DownloadBindFailed { .. } => FailureKind::DownloadBindFailed,
            WorkerError::CopyFailed { .. } => FailureKind::CopyFailed,
            WorkerError::TempFileCreateFailed { .. } => FailureKind::TempFileCreateFailed,
            WorkerError::Timeout(_) => FailureKind::Timeout,
            WorkerError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Fieldless mirror of [`WorkerError`], used as a tally key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PoolNotFound,
    CreateFailed,
    InfoRetrievalFailed,
    StreamOpenFailed,
    UploadBindFailed,
    DownloadBindFailed,
    CopyFailed,
    TempFileCreateFailed,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::PoolNotFound => "pool not found",
            FailureKind::CreateFailed => "create failed",
            FailureKind::InfoRetrievalFailed => "info retrieval failed",
            FailureKind::StreamOpenFailed => "stream open failed",
            FailureKind::UploadBindFailed => "upload bind failed",
            FailureKind::DownloadBindFailed => "download bind failed",
            FailureKind::CopyFailed => "copy failed",
            FailureKind::TempFileCreateFailed => "temp file create failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Step of the volume lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    Create,
    WritePopulate,
    ReadExtract,
}

impl LifecycleStep {
    pub const ALL: [LifecycleStep; 3] = [
        LifecycleStep::Create,
        LifecycleStep::WritePopulate,
        LifecycleStep::ReadExtract,
    ];
}

impl std::fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleStep::Create => write!(f, "create"),
            LifecycleStep::WritePopulate => write!(f, "write-populate"),
            LifecycleStep::ReadExtract => write!(f, "read-extract"),
        }
    }
}

/// What a successful worker did
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub volume_name: String,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub create_time: Duration,
    pub write_time: Duration,
    pub read_time: Duration,
    /// Scratch file kept on disk when temp files are retained
    pub retained_file: Option<PathBuf>,
}

impl WorkerReport {
    pub fn step_time(&self, step: LifecycleStep) -> Duration {
        match step {
            LifecycleStep::Create => self.create_time,
            LifecycleStep::WritePopulate => self.write_time,
            LifecycleStep::ReadExtract => self.read_time,
        }
    }
}

/// The first error a worker hit, tagged with its step
#[derive(Debug)]
pub struct WorkerFailure {
    pub step: LifecycleStep,
    pub error: WorkerError,
}

impl WorkerFailure {
    pub fn new(step: LifecycleStep, error: WorkerError) -> Self {
        Self { step, error }
    }

    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} step failed: {}", self.step, self.error)
    }
}

/// Result of one worker, produced exactly once
#[derive(Debug)]
pub struct WorkerOutcome {
    pub worker_id: usize,
    pub elapsed: Duration,
    pub result: Result<WorkerReport, WorkerFailure>,
}

impl WorkerOutcome {
    /// Outcome for a job that was dequeued after the run was cancelled
    pub fn cancelled(worker_id: usize) -> Self {
        Self {
            worker_id,
            elapsed: Duration::ZERO,
            result: Err(WorkerFailure::new(
                LifecycleStep::Create,
                WorkerError::Cancelled,
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Settings shared by every worker of a run
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub volume: VolumeSpec,
    pub payload: Vec<u8>,
    pub scratch_dir: PathBuf,
    pub keep_temp_files: bool,
    pub delete_volumes: bool,
}

/// Runs the create / write-populate / read-extract lifecycle
///
/// Cheap to clone; clones share the same settings.
#[derive(Debug, Clone)]
pub struct BenchmarkWorker {
    settings: Arc<WorkerSettings>,
}

impl BenchmarkWorker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// Execute one worker to completion
    ///
    /// ## Parameters
    /// - `worker_id`: Identifier carried into the outcome and the logs
    /// - `conn`: Connection shared with every other worker
    /// - `rng`: Source for the volume name
    /// - `ctx`: Cancellation and deadline for this worker
    ///
    /// ## Returns
    /// The outcome. The volume handle, stream sessions and (unless retained)
    /// the scratch file have all been released by the time it is returned.
    pub fn run<C: Connection, R: Rng>(
        &self,
        worker_id: usize,
        conn: &C,
        rng: &mut R,
        ctx: &WorkerContext,
    ) -> WorkerOutcome {
        let start = Instant::now();
        trace!("Worker {} starting", worker_id);
        let result = self.lifecycle(conn, rng, ctx);
        let elapsed = start.elapsed();

        match &result {
            Ok(report) => debug!(
                "Worker {} finished volume {} in {:?} ({} bytes up, {} bytes down)",
                worker_id,
                report.volume_name,
                elapsed,
                report.bytes_uploaded,
                report.bytes_downloaded
            ),
            Err(failure) => debug!("Worker {} failed after {:?}: {}", worker_id, elapsed, failure),
        }

        WorkerOutcome {
            worker_id,
            elapsed,
            result,
        }
    }

    fn lifecycle<C: Connection, R: Rng>(
        &self,
        conn: &C,
        rng: &mut R,
        ctx: &WorkerContext,
    ) -> Result<WorkerReport, WorkerFailure> {
        let step_start = Instant::now();
        let volume = volume::create_volume(conn, &self.settings.volume, rng, ctx)
            .map_err(|e| WorkerFailure::new(LifecycleStep::Create, e))?;
        let create_time = step_start.elapsed();

        let transfer = self.transfer(conn, &volume, ctx);

        if self.settings.delete_volumes {
            match volume.delete() {
                Ok(()) => trace!("Deleted volume {}", volume.name()),
                Err(e) => warn!("Failed to delete volume {}: {}", volume.name(), e),
            }
        }
        let volume_name = volume.name().to_string();
        drop(volume);

        let transfer = transfer?;
        Ok(WorkerReport {
            volume_name,
            bytes_uploaded: transfer.bytes_uploaded,
            bytes_downloaded: transfer.bytes_downloaded,
            create_time,
            write_time: transfer.write_time,
            read_time: transfer.read_time,
            retained_file: transfer.retained_file,
        })
    }

    fn transfer<C: Connection>(
        &self,
        conn: &C,
        volume: &C::Volume,
        ctx: &WorkerContext,
    ) -> Result<Transfer, WorkerFailure> {
        let step_start = Instant::now();
        let bytes_uploaded = volume::write_populate(conn, volume, &self.settings.payload, ctx)
            .map_err(|e| WorkerFailure::new(LifecycleStep::WritePopulate, e))?;
        let write_time = step_start.elapsed();

        let step_start = Instant::now();
        let extracted = volume::read_extract(conn, volume, &self.settings.scratch_dir, ctx)
            .map_err(|e| WorkerFailure::new(LifecycleStep::ReadExtract, e))?;
        let read_time = step_start.elapsed();

        let retained_file = if self.settings.keep_temp_files {
            match extracted.file.into_temp_path().keep() {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Failed to retain scratch file: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Transfer {
            bytes_uploaded,
            bytes_downloaded: extracted.bytes,
            write_time,
            read_time,
            retained_file,
        })
    }
}

struct Transfer {
    bytes_uploaded: u64,
    bytes_downloaded: u64,
    write_time: Duration,
    read_time: Duration,
    retained_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{FaultPlan, FaultRule, MemoryHypervisor};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"worker payload\n";

    fn settings(scratch: &TempDir) -> WorkerSettings {
        WorkerSettings {
            volume: VolumeSpec {
                pool: "default".to_string(),
                pool_path: PathBuf::from("/var/lib/libvirt/images"),
                capacity_bytes: 4096,
            },
            payload: PAYLOAD.to_vec(),
            scratch_dir: scratch.path().to_path_buf(),
            keep_temp_files: false,
            delete_volumes: false,
        }
    }

    fn hypervisor(faults: FaultPlan) -> MemoryHypervisor {
        let hv = MemoryHypervisor::with_faults(faults);
        hv.add_pool("default", "/var/lib/libvirt/images");
        hv
    }

    fn scratch_entries(scratch: &TempDir) -> usize {
        std::fs::read_dir(scratch.path()).unwrap().count()
    }

    /// Test that an unexpired context passes and an expired one reports its timeout
    #[test]
    fn test_context_deadline() {
        let ctx = WorkerContext::new(CancellationToken::new(), Some(Duration::from_secs(60)));
        assert!(ctx.check().is_ok());

        let ctx = WorkerContext::new(CancellationToken::new(), Some(Duration::ZERO));
        assert_eq!(
            ctx.check(),
            Err(Interrupt::DeadlineExceeded(Duration::ZERO))
        );
    }

    /// Test that cancellation wins over an expired deadline
    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = WorkerContext::new(token.clone(), Some(Duration::ZERO));
        token.cancel();
        assert_eq!(ctx.check(), Err(Interrupt::Cancelled));
        assert!(WorkerContext::unbounded().check().is_ok());
    }

    /// Test interrupt to error conversion and kinds
    #[test]
    fn test_error_kinds() {
        let timeout: WorkerError = Interrupt::DeadlineExceeded(Duration::from_secs(1)).into();
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        let cancelled: WorkerError = Interrupt::Cancelled.into();
        assert_eq!(cancelled.kind(), FailureKind::Cancelled);

        let copy = WorkerError::from_copy(
            TransferDirection::Upload,
            io::Error::new(io::ErrorKind::Other, "boom"),
        );
        assert_eq!(copy.kind(), FailureKind::CopyFailed);
        assert_eq!(copy.to_string(), "upload copy failed: boom");

        let interrupted = WorkerError::from_copy(
            TransferDirection::Download,
            io::Error::new(io::ErrorKind::TimedOut, Interrupt::DeadlineExceeded(Duration::ZERO)),
        );
        assert_eq!(interrupted.kind(), FailureKind::Timeout);
    }

    /// Test a full successful lifecycle against the in-process backend
    #[test]
    fn test_worker_success_releases_everything() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let conn = hv.connect("test:///default").unwrap();
        let worker = BenchmarkWorker::new(settings(&scratch));
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = worker.run(3, &conn, &mut rng, &WorkerContext::unbounded());
        assert_eq!(outcome.worker_id, 3);
        let report = outcome.result.unwrap();
        assert_eq!(report.bytes_uploaded, PAYLOAD.len() as u64);
        assert_eq!(report.bytes_downloaded, 4096);
        assert_eq!(report.volume_name.len(), volume::NAME_LENGTH);
        assert!(report.retained_file.is_none());

        let stats = hv.stats();
        assert_eq!(stats.volumes_created, 1);
        assert_eq!(stats.volumes_freed, 1);
        assert_eq!(stats.streams_opened, 2);
        assert_eq!(stats.streams_finished, 2);
        assert_eq!(stats.streams_aborted, 0);
        assert_eq!(stats.streams_freed, 2);
        assert_eq!(scratch_entries(&scratch), 0);
        assert_eq!(hv.volume_names("default"), vec![report.volume_name]);
    }

    /// Test that a download bind failure aborts the session and still frees the volume
    #[test]
    fn test_worker_bind_failure_is_tagged_with_step() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan {
            download_bind: FaultRule::Always,
            ..FaultPlan::default()
        });
        let conn = hv.connect("test:///default").unwrap();
        let worker = BenchmarkWorker::new(settings(&scratch));
        let mut rng = StdRng::seed_from_u64(7);

        let failure = worker
            .run(0, &conn, &mut rng, &WorkerContext::unbounded())
            .result
            .unwrap_err();
        assert_eq!(failure.step, LifecycleStep::ReadExtract);
        assert_eq!(failure.kind(), FailureKind::DownloadBindFailed);

        let stats = hv.stats();
        assert_eq!(stats.volumes_freed, 1);
        assert_eq!(stats.streams_finished, 1);
        assert_eq!(stats.streams_aborted, 1);
        assert_eq!(stats.streams_freed, 2);
        assert_eq!(scratch_entries(&scratch), 0);
    }

    /// Test that volumes are deleted after the lifecycle when requested
    #[test]
    fn test_worker_deletes_volume() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let conn = hv.connect("test:///default").unwrap();
        let mut settings = settings(&scratch);
        settings.delete_volumes = true;
        let worker = BenchmarkWorker::new(settings);
        let mut rng = StdRng::seed_from_u64(11);

        assert!(worker
            .run(0, &conn, &mut rng, &WorkerContext::unbounded())
            .is_success());
        assert!(hv.volume_names("default").is_empty());
        assert_eq!(hv.stats().volumes_deleted, 1);
        assert_eq!(hv.stats().volumes_freed, 1);
    }

    /// Test that retained scratch files survive the worker
    #[test]
    fn test_worker_keeps_temp_file() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let conn = hv.connect("test:///default").unwrap();
        let mut settings = settings(&scratch);
        settings.keep_temp_files = true;
        let worker = BenchmarkWorker::new(settings);
        let mut rng = StdRng::seed_from_u64(5);

        let report = worker
            .run(0, &conn, &mut rng, &WorkerContext::unbounded())
            .result
            .unwrap();
        let path = report.retained_file.unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents.starts_with(PAYLOAD));
        assert!(path.starts_with(scratch.path()));
    }

    /// Test that a cancelled worker never touches the connection
    #[test]
    fn test_worker_cancelled_before_start() {
        let scratch = TempDir::new().unwrap();
        let hv = hypervisor(FaultPlan::default());
        let conn = hv.connect("test:///default").unwrap();
        let worker = BenchmarkWorker::new(settings(&scratch));
        let token = CancellationToken::new();
        token.cancel();
        let mut rng = StdRng::seed_from_u64(1);

        let failure = worker
            .run(0, &conn, &mut rng, &WorkerContext::new(token, None))
            .result
            .unwrap_err();
        assert_eq!(failure.step, LifecycleStep::Create);
        assert_eq!(failure.kind(), FailureKind::Cancelled);
        assert_eq!(hv.stats().pool_lookups, 0);
        assert_eq!(hv.stats().volumes_created, 0);
    }
}
