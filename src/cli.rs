use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// Virt Storage Benchmark - concurrent volume upload/download stress test
///
/// Launches many workers against one hypervisor connection. Each worker creates
/// a storage volume, streams a payload into it and streams it back out into a
/// scratch file. Per-worker failures are reported and tallied, never fatal.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of workers to launch
    #[clap(
        short = 'n',
        long = "numb",
        default_value_t = crate::defaults::WORKERS,
        help_heading = "Core Options"
    )]
    pub workers: usize,

    /// Hypervisor connection URI
    ///
    /// test:///default selects the in-process driver. Any other URI needs a
    /// build with the `libvirt` feature.
    #[clap(long, default_value = crate::defaults::URI, help_heading = "Core Options")]
    pub uri: String,

    /// Storage pool volumes are created in
    #[clap(long, default_value = crate::defaults::POOL, help_heading = "Volume Options")]
    pub pool: String,

    /// Directory backing the storage pool
    #[clap(long, default_value = crate::defaults::POOL_PATH, help_heading = "Volume Options")]
    pub pool_path: PathBuf,

    /// Capacity of each created volume, in MiB
    #[clap(long, default_value_t = crate::defaults::CAPACITY_MIB, help_heading = "Volume Options")]
    pub capacity_mib: u64,

    /// Delete each volume from its pool once the worker is done with it
    #[clap(long, default_value_t = false, help_heading = "Volume Options")]
    pub delete_volumes: bool,

    /// Upload payload size in bytes (defaults to a short fixed text)
    #[clap(long, help_heading = "Volume Options")]
    pub payload_size: Option<usize>,

    /// Number of executor threads running workers
    #[clap(long, default_value_t = crate::defaults::POOL_SIZE, help_heading = "Execution Options")]
    pub pool_size: usize,

    /// Per-worker deadline (e.g. 500ms, 10s, 5m)
    #[clap(long, value_parser = parse_duration, help_heading = "Execution Options")]
    pub timeout: Option<Duration>,

    /// Seed for volume name generation
    #[clap(long, help_heading = "Execution Options")]
    pub seed: Option<u64>,

    /// Directory for downloaded scratch files
    #[clap(long, default_value = crate::defaults::SCRATCH_DIR, help_heading = "Scratch Files")]
    pub scratch_dir: PathBuf,

    /// Keep downloaded scratch files instead of deleting them
    #[clap(long, default_value_t = false, help_heading = "Scratch Files")]
    pub keep_temp_files: bool,

    /// Number of failure messages kept in the report
    #[clap(long, default_value_t = crate::defaults::ERROR_SAMPLES, help_heading = "Output")]
    pub error_samples: usize,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(
        short = 'q',
        long,
        default_value_t = false,
        conflicts_with = "verbose",
        help_heading = "Output"
    )]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}
