//! # Hypervisor Storage Abstraction
//!
//! The benchmark never talks to a virtualization control plane directly. It
//! drives four small traits that mirror the storage surface of libvirt:
//!
//! - [`Connection`]: an authenticated session shared by every worker
//! - [`StoragePool`]: a named pool volumes are allocated from
//! - [`Volume`]: one storage volume, exclusively owned by the worker that created it
//! - [`StreamSession`]: a directional chunked transfer channel bound to a volume
//!
//! Releasing a handle is tied to `Drop`: dropping a volume or a stream session
//! frees it on the remote side. Connections are closed explicitly, by value,
//! so the harness can only close one once every worker has let go of it.
//!
//! ## Backends
//!
//! - [`memory`]: an in-process control plane selected with `test://` URIs.
//!   It honours the same contracts as libvirt, supports fault injection and
//!   counts every acquire/release, which is what the test-suite relies on.
//! - `libvirt` (cargo feature `libvirt`): the real thing, through the `virt` crate.

use thiserror::Error;

pub mod memory;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use memory::{FaultPlan, FaultRule, MemoryConnection, MemoryHypervisor, MemoryStats};

/// Capacity and allocation of a volume, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub capacity: u64,
    pub allocation: u64,
}

/// Faults reported by a hypervisor backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported connection URI '{0}'")]
    UnsupportedUri(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("storage pool '{0}' not found")]
    PoolNotFound(String),

    #[error("invalid volume descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("volume '{0}' already exists")]
    VolumeExists(String),

    #[error("volume '{0}' no longer exists")]
    VolumeMissing(String),

    #[error("range {offset}+{length} exceeds volume capacity {capacity}")]
    OutOfRange {
        offset: u64,
        length: u64,
        capacity: u64,
    },

    #[error("stream is not bound for {0}")]
    StreamNotBound(&'static str),

    #[error("stream is already bound to a volume")]
    StreamAlreadyBound,

    #[error("injected fault during {0}")]
    Injected(&'static str),

    #[error("libvirt: {0}")]
    Libvirt(String),
}

/// A shared session to the virtualization control plane
///
/// Implementations must be safe to use from many worker threads at once;
/// the benchmark shares a single connection across the whole executor pool.
pub trait Connection: Send + Sync + 'static {
    type Pool: StoragePool<Volume = Self::Volume>;
    type Volume: Volume<Stream = Self::Stream>;
    type Stream: StreamSession;

    /// URI this connection was opened against
    fn uri(&self) -> &str;

    fn lookup_pool(&self, name: &str) -> Result<Self::Pool, BackendError>;

    /// Open a new, unbound stream session
    fn new_stream(&self, flags: u32) -> Result<Self::Stream, BackendError>;

    /// Close the session. Consumes the handle, so it can happen once.
    fn close(self) -> Result<(), BackendError>
    where
        Self: Sized;
}

pub trait StoragePool {
    type Volume: Volume;

    fn name(&self) -> &str;

    /// Create a volume from an XML descriptor
    fn create_volume(&self, descriptor_xml: &str, flags: u32) -> Result<Self::Volume, BackendError>;
}

/// A storage volume handle; dropping it frees the handle (not the volume)
pub trait Volume: Send {
    type Stream: StreamSession;

    fn name(&self) -> &str;

    /// Live metadata; never cached by callers
    fn info(&self) -> Result<VolumeInfo, BackendError>;

    /// Bind `stream` for uploading `length` bytes starting at `offset`
    fn upload(
        &self,
        stream: &mut Self::Stream,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<(), BackendError>;

    /// Bind `stream` for downloading `length` bytes starting at `offset`
    fn download(
        &self,
        stream: &mut Self::Stream,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<(), BackendError>;

    /// Remove the volume from its pool
    fn delete(&self) -> Result<(), BackendError>;
}

/// A chunked, directional transfer channel; dropping it frees the session
pub trait StreamSession: Send {
    /// Send one chunk, returning how many bytes the remote side accepted
    fn send(&mut self, data: &[u8]) -> Result<usize, BackendError>;

    /// Receive up to `buf.len()` bytes; `Ok(0)` means the transfer is over
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, BackendError>;

    /// Complete the transfer successfully
    fn finish(&mut self) -> Result<(), BackendError>;

    /// Tear the transfer down after a failure
    fn abort(&mut self) -> Result<(), BackendError>;
}

/// Backend selected by a connection URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process control plane (`test://...`)
    Memory,
    /// Everything else is handed to libvirt
    Libvirt,
}

impl BackendKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with(memory::URI_SCHEME) {
            BackendKind::Memory
        } else {
            BackendKind::Libvirt
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "in-process test driver"),
            BackendKind::Libvirt => write!(f, "libvirt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_uri() {
        assert_eq!(BackendKind::from_uri("test:///default"), BackendKind::Memory);
        assert_eq!(BackendKind::from_uri("qemu:///system"), BackendKind::Libvirt);
        assert_eq!(
            BackendKind::from_uri("qemu+ssh://host/system"),
            BackendKind::Libvirt
        );
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::OutOfRange {
            offset: 0,
            length: 20,
            capacity: 10,
        };
        assert_eq!(err.to_string(), "range 0+20 exceeds volume capacity 10");
        assert_eq!(
            BackendError::PoolNotFound("default".to_string()).to_string(),
            "storage pool 'default' not found"
        );
    }
}
