//! libvirt backend built on the `virt` bindings
//!
//! Every call here blocks on the libvirt RPC connection, so callers run it on
//! blocking threads. libvirt connections are thread-safe; one handle is shared
//! by the whole executor pool.

use super::{BackendError, Connection, StoragePool, StreamSession, Volume, VolumeInfo};
use tracing::debug;
use virt::connect::Connect;
use virt::storage_pool::StoragePool as VirtPool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;

fn libvirt_error(err: virt::error::Error) -> BackendError {
    BackendError::Libvirt(err.to_string())
}

pub struct LibvirtConnection {
    conn: Connect,
    uri: String,
}

impl LibvirtConnection {
    pub fn open(uri: &str) -> Result<Self, BackendError> {
        let conn = Connect::open(Some(uri)).map_err(libvirt_error)?;
        debug!("Opened libvirt connection to {}", uri);
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }
}

impl Connection for LibvirtConnection {
    type Pool = LibvirtPool;
    type Volume = LibvirtVolume;
    type Stream = LibvirtStream;

    fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup_pool(&self, name: &str) -> Result<LibvirtPool, BackendError> {
        let pool = VirtPool::lookup_by_name(&self.conn, name).map_err(libvirt_error)?;
        Ok(LibvirtPool {
            pool,
            name: name.to_string(),
        })
    }

    fn new_stream(&self, flags: u32) -> Result<LibvirtStream, BackendError> {
        let stream = Stream::new(&self.conn, flags).map_err(libvirt_error)?;
        Ok(LibvirtStream {
            stream: Some(stream),
        })
    }

    fn close(mut self) -> Result<(), BackendError> {
        self.conn.close().map_err(libvirt_error)?;
        debug!("Closed libvirt connection to {}", self.uri);
        Ok(())
    }
}

pub struct LibvirtPool {
    pool: VirtPool,
    name: String,
}

impl StoragePool for LibvirtPool {
    type Volume = LibvirtVolume;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_volume(
        &self,
        descriptor_xml: &str,
        flags: u32,
    ) -> Result<LibvirtVolume, BackendError> {
        let vol =
            StorageVol::create_xml(&self.pool, descriptor_xml, flags).map_err(libvirt_error)?;
        let name = vol.get_name().map_err(libvirt_error)?;
        Ok(LibvirtVolume { vol, name })
    }
}

pub struct LibvirtVolume {
    vol: StorageVol,
    name: String,
}

impl Volume for LibvirtVolume {
    type Stream = LibvirtStream;

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Result<VolumeInfo, BackendError> {
        let info = self.vol.get_info().map_err(libvirt_error)?;
        Ok(VolumeInfo {
            capacity: info.capacity,
            allocation: info.allocation,
        })
    }

    fn upload(
        &self,
        stream: &mut LibvirtStream,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<(), BackendError> {
        let inner = stream.inner("upload")?;
        self.vol
            .upload(inner, offset, length, flags)
            .map_err(libvirt_error)
    }

    fn download(
        &self,
        stream: &mut LibvirtStream,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<(), BackendError> {
        let inner = stream.inner("download")?;
        self.vol
            .download(inner, offset, length, flags)
            .map_err(libvirt_error)
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.vol.delete(0).map_err(libvirt_error)
    }
}

/// Stream handle; `None` once finish/abort consumed the underlying stream
pub struct LibvirtStream {
    stream: Option<Stream>,
}

impl LibvirtStream {
    fn inner(&mut self, operation: &'static str) -> Result<&mut Stream, BackendError> {
        self.stream
            .as_mut()
            .ok_or(BackendError::StreamNotBound(operation))
    }
}

impl StreamSession for LibvirtStream {
    fn send(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        self.inner("upload")?.send(data).map_err(libvirt_error)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        self.inner("download")?.recv(buf).map_err(libvirt_error)
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        match self.stream.take() {
            Some(stream) => stream.finish().map_err(libvirt_error),
            None => Err(BackendError::StreamNotBound("finish")),
        }
    }

    fn abort(&mut self) -> Result<(), BackendError> {
        match self.stream.take() {
            Some(stream) => stream.abort().map_err(libvirt_error),
            None => Ok(()),
        }
    }
}
