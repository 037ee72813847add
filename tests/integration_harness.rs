use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use virt_storage_bench::{
    defaults,
    hypervisor::{FaultPlan, FaultRule, MemoryHypervisor},
    BenchmarkConfig, BenchmarkRunner, BenchmarkTally, FailureKind, HarnessError, HarnessPhase,
};

const URI: &str = "test:///default";

fn config(workers: usize, scratch_dir: &Path) -> BenchmarkConfig {
    BenchmarkConfig {
        workers,
        uri: URI.to_string(),
        capacity_bytes: 4096,
        pool_size: 4,
        scratch_dir: scratch_dir.to_path_buf(),
        ..BenchmarkConfig::default()
    }
}

fn hypervisor(faults: FaultPlan) -> MemoryHypervisor {
    let hv = MemoryHypervisor::with_faults(faults);
    hv.add_pool(defaults::POOL, defaults::POOL_PATH);
    hv
}

async fn run(hv: &MemoryHypervisor, config: BenchmarkConfig) -> Result<BenchmarkTally> {
    let runner = BenchmarkRunner::new(config);
    let hv = hv.clone();
    let tally = runner.run(move || hv.connect(URI)).await?;
    assert_eq!(runner.phase(), HarnessPhase::Complete);
    Ok(tally)
}

/// A run with no workers still opens and closes the connection and returns
/// an empty tally without touching the scratch directory.
#[tokio::test]
async fn zero_workers_complete_immediately() -> Result<()> {
    let tmp = TempDir::new()?;
    let scratch = tmp.path().join("scratch");
    let hv = hypervisor(FaultPlan::default());

    let tally = run(&hv, config(0, &scratch)).await?;

    assert_eq!(tally.launched, 0);
    assert_eq!(tally.completed(), 0);
    assert!(tally.error_samples.is_empty());
    assert!(!scratch.exists());

    let stats = hv.stats();
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.pool_lookups, 0);
    Ok(())
}

/// Every worker succeeds and leaves a populated volume behind.
#[tokio::test]
async fn all_workers_succeed() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan::default());

    let tally = run(&hv, config(3, scratch.path())).await?;

    assert_eq!(tally.launched, 3);
    assert_eq!(tally.succeeded, 3);
    assert_eq!(tally.failed, 0);
    assert!(tally.failures_by_kind.is_empty());
    assert_eq!(tally.bytes_uploaded, 3 * defaults::PAYLOAD.len() as u64);
    assert_eq!(tally.bytes_downloaded, 3 * 4096);

    let names = hv.volume_names(defaults::POOL);
    assert_eq!(names.len(), 3);
    for name in &names {
        assert_eq!(name.len(), 10);
        let contents = hv.volume_contents(defaults::POOL, name).unwrap();
        assert!(contents.starts_with(defaults::PAYLOAD));
    }

    let stats = hv.stats();
    assert_eq!(stats.volumes_created, 3);
    assert_eq!(stats.volumes_freed, 3);
    assert_eq!(stats.streams_opened, 6);
    assert_eq!(stats.streams_finished, 6);
    assert_eq!(stats.streams_aborted, 0);
    assert_eq!(stats.streams_freed, 6);
    assert_eq!(stats.connections_closed, 1);

    // Scratch files are removed unless asked to keep them.
    assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
    Ok(())
}

/// With a single executor, workers run strictly one after another, so their
/// failures arrive in launch order.
#[tokio::test]
async fn single_executor_runs_workers_in_order() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan {
        pool_lookup: FaultRule::Always,
        ..FaultPlan::default()
    });
    let config = BenchmarkConfig {
        pool_size: 1,
        ..config(5, scratch.path())
    };

    let tally = run(&hv, config).await?;

    assert_eq!(tally.failed, 5);
    assert_eq!(tally.failures_of(FailureKind::PoolNotFound), 5);
    let order: Vec<usize> = tally.error_samples.iter().map(|s| s.worker_id).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    let stats = hv.stats();
    assert_eq!(stats.pool_lookups, 5);
    assert_eq!(stats.volumes_created, 0);
    assert_eq!(stats.streams_opened, 0);
    assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
    Ok(())
}

/// The error sample list is capped while the counts stay exact.
#[tokio::test]
async fn error_samples_are_capped() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan {
        create_volume: FaultRule::Always,
        ..FaultPlan::default()
    });
    let config = BenchmarkConfig {
        error_samples: 2,
        ..config(12, scratch.path())
    };

    let tally = run(&hv, config).await?;

    assert_eq!(tally.failures_of(FailureKind::CreateFailed), 12);
    assert_eq!(tally.error_samples.len(), 2);
    assert_eq!(hv.stats().streams_opened, 0);
    Ok(())
}

/// Two runs against the same pool never collide on volume names.
#[tokio::test]
async fn volume_names_are_distinct_across_runs() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan::default());

    let first = run(&hv, config(20, scratch.path())).await?;
    let second = run(&hv, config(20, scratch.path())).await?;

    assert_eq!(first.succeeded, 20);
    assert_eq!(second.succeeded, 20);
    assert_eq!(hv.volume_names(defaults::POOL).len(), 40);
    assert_eq!(hv.stats().connections_closed, 2);
    Ok(())
}

/// A fixed seed with one executor reproduces the same volume names.
#[tokio::test]
async fn seeded_runs_are_reproducible() -> Result<()> {
    let scratch = TempDir::new()?;
    let seeded = |scratch: &Path| BenchmarkConfig {
        seed: Some(7),
        pool_size: 1,
        ..config(5, scratch)
    };

    let first = hypervisor(FaultPlan::default());
    run(&first, seeded(scratch.path())).await?;
    let second = hypervisor(FaultPlan::default());
    run(&second, seeded(scratch.path())).await?;

    assert_eq!(
        first.volume_names(defaults::POOL),
        second.volume_names(defaults::POOL)
    );
    Ok(())
}

/// A connection failure stops the run before any worker is launched.
#[tokio::test]
async fn connection_failure_is_fatal() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan::default());
    let runner = BenchmarkRunner::new(config(4, scratch.path()));

    let connect = hv.clone();
    let err = runner
        .run(move || connect.connect("qemu:///system"))
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::ConnectionFailed { .. }));
    assert!(err.to_string().contains("qemu:///system"));
    assert_eq!(runner.phase(), HarnessPhase::Idle);
    assert_eq!(hv.stats().connections_opened, 0);
    assert_eq!(hv.stats().pool_lookups, 0);
    Ok(())
}

/// Cancelling mid-run still yields one outcome per launched worker and
/// leaves nothing allocated.
#[tokio::test]
async fn cancellation_mid_run_reports_every_worker() -> Result<()> {
    let scratch = TempDir::new()?;
    let hv = hypervisor(FaultPlan {
        latency: Some(Duration::from_millis(20)),
        ..FaultPlan::default()
    });
    let config = BenchmarkConfig {
        pool_size: 2,
        ..config(50, scratch.path())
    };
    let runner = BenchmarkRunner::new(config);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let connect = hv.clone();
    let tally = runner.run(move || connect.connect(URI)).await?;

    assert_eq!(tally.completed(), 50);
    assert!(tally.failures_of(FailureKind::Cancelled) > 0);

    let stats = hv.stats();
    assert_eq!(stats.volumes_created, stats.volumes_freed);
    assert_eq!(stats.streams_opened, stats.streams_freed);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(std::fs::read_dir(scratch.path())?.count(), 0);
    Ok(())
}
