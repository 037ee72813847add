//! # Volume Lifecycle Operations
//!
//! The three remote operations a worker performs on its volume:
//!
//! 1. **Create**: allocate a volume with a random name in the configured pool
//! 2. **Write-Populate**: upload the payload over the volume's full capacity range
//! 3. **Read-Extract**: download the full capacity range into a scratch file
//!
//! Capacity is read from live metadata at the start of each transfer and used
//! as the exact transfer length. Each transfer opens its own stream session
//! and releases it before returning, whatever the result.

use crate::hypervisor::{Connection, StoragePool, Volume};
use crate::stream_io::{ScopedSession, StreamIo};
use crate::worker::{TransferDirection, WorkerContext, WorkerError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Length of generated volume names
pub const NAME_LENGTH: usize = 10;

/// Prefix of scratch files created by read-extract
pub const TEMP_FILE_PREFIX: &str = "cloudinit";

/// Owner and group applied to created volumes (the qemu user on most hosts)
const VOLUME_OWNER: u32 = 107;
const VOLUME_MODE: &str = "0744";

/// Where and how large the benchmark's volumes are
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub pool: String,
    /// Directory backing the pool; volume paths are built under it
    pub pool_path: PathBuf,
    pub capacity_bytes: u64,
}

/// Draw a volume name uniformly from `[A-Za-z0-9]`
pub fn random_volume_name<R: Rng>(rng: &mut R) -> String {
    (0..NAME_LENGTH)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

/// Build the XML descriptor for a new volume
pub fn volume_xml(name: &str, pool_path: &Path, capacity_bytes: u64) -> String {
    format!(
        r#"<volume>
  <name>{name}</name>
  <allocation>0</allocation>
  <capacity unit="bytes">{capacity}</capacity>
  <target>
    <path>{path}</path>
    <permissions>
      <owner>{owner}</owner>
      <group>{owner}</group>
      <mode>{mode}</mode>
      <label>testLabel0</label>
    </permissions>
  </target>
</volume>"#,
        name = name,
        capacity = capacity_bytes,
        path = pool_path.join(name).display(),
        owner = VOLUME_OWNER,
        mode = VOLUME_MODE,
    )
}

/// Create a freshly named volume in the configured pool
///
/// ## Returns
/// - `Ok(volume)`: A handle exclusively owned by the caller
/// - `Err(PoolNotFound)`: The pool lookup failed; nothing was created
/// - `Err(CreateFailed)`: The pool refused the descriptor
pub fn create_volume<C: Connection, R: Rng>(
    conn: &C,
    spec: &VolumeSpec,
    rng: &mut R,
    ctx: &WorkerContext,
) -> Result<C::Volume, WorkerError> {
    ctx.check()?;
    let pool = conn
        .lookup_pool(&spec.pool)
        .map_err(|source| WorkerError::PoolNotFound {
            pool: spec.pool.clone(),
            source,
        })?;

    let name = random_volume_name(rng);
    let xml = volume_xml(&name, &spec.pool_path, spec.capacity_bytes);
    trace!("Creating volume {} in pool {}", name, pool.name());

    ctx.check()?;
    let volume = pool
        .create_volume(&xml, 0)
        .map_err(|source| WorkerError::CreateFailed {
            name: name.clone(),
            source,
        })?;
    debug!("Created volume {}", volume.name());
    Ok(volume)
}

/// Upload `payload` into `volume`
///
/// The stream is bound over `[0, capacity)`; the payload must fit in it.
///
/// ## Returns
/// The number of bytes uploaded.
pub fn write_populate<C: Connection>(
    conn: &C,
    volume: &C::Volume,
    payload: &[u8],
    ctx: &WorkerContext,
) -> Result<u64, WorkerError> {
    ctx.check()?;
    let info = volume
        .info()
        .map_err(|source| WorkerError::InfoRetrievalFailed {
            name: volume.name().to_string(),
            source,
        })?;

    ctx.check()?;
    let stream = conn.new_stream(0).map_err(WorkerError::StreamOpenFailed)?;
    let mut session = ScopedSession::new(stream);
    volume
        .upload(session.session_mut(), 0, info.capacity, 0)
        .map_err(|source| WorkerError::UploadBindFailed {
            name: volume.name().to_string(),
            source,
        })?;

    let mut reader = payload;
    let copied = io::copy(&mut reader, &mut StreamIo::new(session.session_mut(), ctx))
        .map_err(|e| WorkerError::from_copy(TransferDirection::Upload, e))?;
    session
        .finish()
        .map_err(|e| WorkerError::from_finish(TransferDirection::Upload, e))?;

    debug!("{} bytes uploaded to volume {}", copied, volume.name());
    Ok(copied)
}

/// Result of a read-extract
#[derive(Debug)]
pub struct Extracted {
    pub bytes: u64,
    /// Scratch file holding the downloaded content; removed when dropped
    pub file: NamedTempFile,
}

/// Download the whole of `volume` into a new file under `scratch_dir`
pub fn read_extract<C: Connection>(
    conn: &C,
    volume: &C::Volume,
    scratch_dir: &Path,
    ctx: &WorkerContext,
) -> Result<Extracted, WorkerError> {
    ctx.check()?;
    let info = volume
        .info()
        .map_err(|source| WorkerError::InfoRetrievalFailed {
            name: volume.name().to_string(),
            source,
        })?;

    let mut file = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(scratch_dir)
        .map_err(|source| WorkerError::TempFileCreateFailed {
            path: scratch_dir.to_path_buf(),
            source,
        })?;

    ctx.check()?;
    let stream = conn.new_stream(0).map_err(WorkerError::StreamOpenFailed)?;
    let mut session = ScopedSession::new(stream);
    volume
        .download(session.session_mut(), 0, info.capacity, 0)
        .map_err(|source| WorkerError::DownloadBindFailed {
            name: volume.name().to_string(),
            source,
        })?;

    let copied = io::copy(
        &mut StreamIo::new(session.session_mut(), ctx),
        file.as_file_mut(),
    )
    .map_err(|e| WorkerError::from_copy(TransferDirection::Download, e))?;
    session
        .finish()
        .map_err(|e| WorkerError::from_finish(TransferDirection::Download, e))?;

    debug!(
        "{} bytes copied from volume {} to {}",
        copied,
        volume.name(),
        file.path().display()
    );
    Ok(Extracted {
        bytes: copied,
        file,
    })
}
