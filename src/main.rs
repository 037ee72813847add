//! # Virt Storage Benchmark - Main Entry Point
//!
//! Runs one benchmark: many workers concurrently create storage volumes on a
//! single hypervisor connection and stream data into and out of them.
//!
//! ## Architecture Overview
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: Processes command-line configuration
//! 2. **Initialize logging**: Console output plus an optional log file
//! 3. **Create benchmark config**: Converts and validates CLI args
//! 4. **Select a backend**: `test://` URIs use the in-process driver, all
//!    other URIs go to libvirt
//! 5. **Run the benchmark**: Waits for every worker; Ctrl+C cancels the rest
//! 6. **Generate results**: Prints the summary and writes the JSON report
//!
//! ## Error Handling
//!
//! Only failures that stop the whole run (bad configuration, no connection,
//! unwritable scratch directory or report) produce a non-zero exit status.
//! Individual worker failures are part of the results.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use virt_storage_bench::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::Args,
    hypervisor::{BackendKind, MemoryHypervisor},
    logging::init_logging,
    results::{BenchmarkTally, ResultsManager},
};

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so the log file is flushed on exit.
    let _log_guard = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting Virt Storage Benchmark v{}", virt_storage_bench::VERSION);

    let config = BenchmarkConfig::from_args(&args)?;
    let results_manager = ResultsManager::new(args.output_file.as_deref());
    info!("Run ID: {}", results_manager.run_id());

    let runner = BenchmarkRunner::new(config);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling workers that have not finished");
            cancel.cancel();
        }
    });

    let tally = run_benchmark(&runner).await?;

    results_manager.print_summary(&tally);
    results_manager
        .write_report(runner.config(), &tally)
        .context("Failed to write benchmark report")?;

    info!("Virt Storage Benchmark completed");
    Ok(())
}

/// Run the benchmark against the backend selected by the configured URI
///
/// ## Parameters
/// - `runner`: Runner owning the configuration and cancellation token
///
/// ## Returns
/// - `Ok(BenchmarkTally)` once every worker has reported
/// - `Err(anyhow::Error)` if the run could not start
async fn run_benchmark(runner: &BenchmarkRunner) -> Result<BenchmarkTally> {
    let config = runner.config();
    let backend = BackendKind::from_uri(&config.uri);
    info!("Using {} backend for {}", backend, config.uri);

    let tally = match backend {
        BackendKind::Memory => {
            let hypervisor = MemoryHypervisor::new();
            hypervisor.add_pool(&config.pool, &config.pool_path);
            let uri = config.uri.clone();
            runner.run(move || hypervisor.connect(&uri)).await?
        }
        #[cfg(feature = "libvirt")]
        BackendKind::Libvirt => {
            use virt_storage_bench::hypervisor::libvirt::LibvirtConnection;
            let uri = config.uri.clone();
            runner.run(move || LibvirtConnection::open(&uri)).await?
        }
        #[cfg(not(feature = "libvirt"))]
        BackendKind::Libvirt => {
            anyhow::bail!(
                "URI '{}' needs libvirt, but this binary was built without the `libvirt` \
                 feature; rebuild with `--features libvirt` or use a test:///default URI",
                config.uri
            );
        }
    };

    Ok(tally)
}
