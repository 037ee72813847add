//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the harness, the report writer and the binary.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: Human-readable display of durations, bytes, and rates
//! - **Validation**: Configuration checks with clear error messages
//! - **System Information**: Run identifiers and CPU detection
//!
//! ## Usage Examples
//!
//! ```rust
//! use virt_storage_bench::utils::*;
//! use std::time::Duration;
//!
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! let rate_str = format_rate(1048576.0);
//! assert_eq!(rate_str, "1.00 MB/s");
//!
//! # fn main() -> anyhow::Result<()> {
//! validate_pool_size(64)?;
//! assert_eq!(capacity_bytes(10)?, 10 * 1024 * 1024);
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on executor threads
pub const MAX_POOL_SIZE: usize = 1024;

/// Generate a unique identifier for a benchmark run
///
/// ## Returns
/// String representation of a UUID v4 (e.g., "550e8400-e29b-41d4-a716-446655440000")
///
/// The identifier is written into the JSON report so results from repeated
/// runs against the same host can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// ## Formatting Rules
///
/// - Sub-second units use 2 decimal places for meaningful precision
/// - Durations of a minute or more use compound units (e.g. "1m 30s")
///
/// ## Examples
///
/// ```rust
/// # use virt_storage_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte count in a human-readable way
///
/// Uses binary (1024-based) scaling, which is standard for storage.
///
/// ```rust
/// # use virt_storage_bench::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

/// Format bytes (as f64) in a human-readable way
pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a rate (bytes per second) in a human-readable way
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Validate the executor pool size
///
/// ## Parameters
/// - `pool_size`: Number of executor threads requested
///
/// ## Returns
/// - `Ok(())`: Pool size is valid
/// - `Err(anyhow::Error)`: Pool size is zero or above [`MAX_POOL_SIZE`]
///
/// Each executor is a blocking thread holding one in-flight worker, so the
/// pool size is also the number of concurrent requests sent to the hypervisor.
pub fn validate_pool_size(pool_size: usize) -> Result<()> {
    if pool_size == 0 {
        anyhow::bail!("Pool size cannot be zero");
    }
    if pool_size > MAX_POOL_SIZE {
        anyhow::bail!(
            "Pool size {} is too high (maximum {})",
            pool_size,
            MAX_POOL_SIZE
        );
    }
    Ok(())
}

/// Convert a volume capacity in MiB to bytes
///
/// ## Returns
/// - `Ok(bytes)`: Capacity in bytes
/// - `Err(anyhow::Error)`: Capacity is zero or does not fit in 64 bits
pub fn capacity_bytes(capacity_mib: u64) -> Result<u64> {
    if capacity_mib == 0 {
        anyhow::bail!("Volume capacity cannot be zero");
    }
    capacity_mib
        .checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow::anyhow!("Volume capacity {} MiB is too large", capacity_mib))
}

/// Ensure the upload payload fits in a volume
///
/// Uploads are bound over the full capacity and the stream refuses bytes past
/// the end, so an oversized payload would fail every worker.
pub fn validate_payload_size(payload_size: usize, capacity_bytes: u64) -> Result<()> {
    if payload_size as u64 > capacity_bytes {
        anyhow::bail!(
            "Payload of {} does not fit in a {} volume",
            format_bytes(payload_size as u64),
            format_bytes(capacity_bytes)
        );
    }
    Ok(())
}

/// Get the number of CPU cores available
///
/// Uses the `num_cpus` crate, which accounts for container limits and
/// process affinity.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}
