//! In-process storage control plane
//!
//! Selected with `test://` URIs. Pools live in memory, volumes are sparse
//! byte buffers sized from the `<capacity>` of their XML descriptor, and
//! stream sessions move bytes in and out of them with the same bind/send/recv
//! contract as a libvirt stream. Every acquire and release is counted so a
//! run can be audited afterwards through [`MemoryHypervisor::stats`].
//!
//! A [`FaultPlan`] makes any step fail (always or on every n-th call) and can
//! slow control or transfer calls down to provoke deadlines.

use super::{BackendError, Connection, StoragePool, StreamSession, Volume, VolumeInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// URI prefix routed to this backend
pub const URI_SCHEME: &str = "test://";

/// Canonical URI for the in-process driver
pub const DEFAULT_URI: &str = "test:///default";

/// When an injected fault fires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultRule {
    #[default]
    Never,
    Always,
    /// Fail the n-th, 2n-th, ... call (1-based)
    EveryNth(usize),
}

impl FaultRule {
    fn fires(&self, calls: &AtomicUsize) -> bool {
        match *self {
            FaultRule::Never => false,
            FaultRule::Always => true,
            FaultRule::EveryNth(n) => {
                let call = calls.fetch_add(1, Ordering::Relaxed) + 1;
                n > 0 && call % n == 0
            }
        }
    }
}

/// Faults and latencies injected into the in-process backend
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub connect: FaultRule,
    pub pool_lookup: FaultRule,
    pub create_volume: FaultRule,
    pub volume_info: FaultRule,
    pub new_stream: FaultRule,
    pub upload_bind: FaultRule,
    pub download_bind: FaultRule,
    pub send: FaultRule,
    pub recv: FaultRule,
    pub finish: FaultRule,
    /// Added to every control-plane call
    pub latency: Option<Duration>,
    /// Added to every send/recv chunk
    pub transfer_latency: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Connect,
    PoolLookup,
    CreateVolume,
    VolumeInfo,
    NewStream,
    UploadBind,
    DownloadBind,
    Send,
    Recv,
    Finish,
}

impl Op {
    const COUNT: usize = 10;

    fn label(self) -> &'static str {
        match self {
            Op::Connect => "connect",
            Op::PoolLookup => "pool lookup",
            Op::CreateVolume => "volume creation",
            Op::VolumeInfo => "volume info",
            Op::NewStream => "stream creation",
            Op::UploadBind => "upload bind",
            Op::DownloadBind => "download bind",
            Op::Send => "stream send",
            Op::Recv => "stream receive",
            Op::Finish => "stream finish",
        }
    }
}

impl FaultPlan {
    fn rule(&self, op: Op) -> FaultRule {
        match op {
            Op::Connect => self.connect,
            Op::PoolLookup => self.pool_lookup,
            Op::CreateVolume => self.create_volume,
            Op::VolumeInfo => self.volume_info,
            Op::NewStream => self.new_stream,
            Op::UploadBind => self.upload_bind,
            Op::DownloadBind => self.download_bind,
            Op::Send => self.send,
            Op::Recv => self.recv,
            Op::Finish => self.finish,
        }
    }
}

/// Snapshot of everything the backend has handed out and taken back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub pool_lookups: u64,
    pub volumes_created: u64,
    pub volumes_freed: u64,
    pub volumes_deleted: u64,
    pub streams_opened: u64,
    pub streams_finished: u64,
    pub streams_aborted: u64,
    pub streams_freed: u64,
    pub upload_binds: u64,
    pub download_binds: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    pool_lookups: AtomicU64,
    volumes_created: AtomicU64,
    volumes_freed: AtomicU64,
    volumes_deleted: AtomicU64,
    streams_opened: AtomicU64,
    streams_finished: AtomicU64,
    streams_aborted: AtomicU64,
    streams_freed: AtomicU64,
    upload_binds: AtomicU64,
    download_binds: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> MemoryStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MemoryStats {
            connections_opened: get(&self.connections_opened),
            connections_closed: get(&self.connections_closed),
            pool_lookups: get(&self.pool_lookups),
            volumes_created: get(&self.volumes_created),
            volumes_freed: get(&self.volumes_freed),
            volumes_deleted: get(&self.volumes_deleted),
            streams_opened: get(&self.streams_opened),
            streams_finished: get(&self.streams_finished),
            streams_aborted: get(&self.streams_aborted),
            streams_freed: get(&self.streams_freed),
            upload_binds: get(&self.upload_binds),
            download_binds: get(&self.download_binds),
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
        }
    }
}

/// Sparse volume contents; bytes past `data.len()` read back as zero
struct VolumeState {
    capacity: u64,
    data: Vec<u8>,
    deleted: bool,
}

type SharedVolume = Arc<Mutex<VolumeState>>;

struct PoolState {
    path: PathBuf,
    volumes: HashMap<String, SharedVolume>,
}

struct Shared {
    pools: Mutex<HashMap<String, PoolState>>,
    faults: FaultPlan,
    fault_calls: [AtomicUsize; Op::COUNT],
    stats: Counters,
}

impl Shared {
    fn control_delay(&self) {
        if let Some(latency) = self.faults.latency {
            std::thread::sleep(latency);
        }
    }

    fn transfer_delay(&self) {
        if let Some(latency) = self.faults.transfer_latency {
            std::thread::sleep(latency);
        }
    }

    fn inject(&self, op: Op) -> Result<(), BackendError> {
        if self.faults.rule(op).fires(&self.fault_calls[op as usize]) {
            debug!("Injecting fault into {}", op.label());
            return Err(BackendError::Injected(op.label()));
        }
        Ok(())
    }
}

/// The in-process control plane. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryHypervisor {
    shared: Arc<Shared>,
}

impl Default for MemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHypervisor {
    /// A control plane without pools or faults
    pub fn new() -> Self {
        Self::with_faults(FaultPlan::default())
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            shared: Arc::new(Shared {
                pools: Mutex::new(HashMap::new()),
                faults,
                fault_calls: Default::default(),
                stats: Counters::default(),
            }),
        }
    }

    /// Register a storage pool; re-registering a name keeps its volumes
    pub fn add_pool(&self, name: &str, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut pools = self.shared.pools.lock();
        pools
            .entry(name.to_string())
            .and_modify(|pool| pool.path = path.clone())
            .or_insert_with(|| PoolState {
                path,
                volumes: HashMap::new(),
            });
    }

    pub fn connect(&self, uri: &str) -> Result<MemoryConnection, BackendError> {
        if !uri.starts_with(URI_SCHEME) {
            return Err(BackendError::UnsupportedUri(uri.to_string()));
        }
        self.shared.control_delay();
        self.shared.inject(Op::Connect)?;
        bump(&self.shared.stats.connections_opened);
        debug!("Opened in-process connection to {}", uri);
        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            uri: uri.to_string(),
        })
    }

    pub fn stats(&self) -> MemoryStats {
        self.shared.stats.snapshot()
    }

    /// Names of the volumes currently held by `pool`, sorted
    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        let pools = self.shared.pools.lock();
        let mut names: Vec<String> = pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Bytes written to a volume so far (its allocation)
    pub fn volume_contents(&self, pool: &str, volume: &str) -> Option<Vec<u8>> {
        let pools = self.shared.pools.lock();
        let state = pools.get(pool)?.volumes.get(volume)?;
        let contents = state.lock().data.clone();
        Some(contents)
    }
}

/// A connection to the in-process control plane
pub struct MemoryConnection {
    shared: Arc<Shared>,
    uri: String,
}

impl Connection for MemoryConnection {
    type Pool = MemoryPool;
    type Volume = MemoryVolume;
    type Stream = MemoryStream;

    fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup_pool(&self, name: &str) -> Result<MemoryPool, BackendError> {
        self.shared.control_delay();
        bump(&self.shared.stats.pool_lookups);
        self.shared.inject(Op::PoolLookup)?;
        if !self.shared.pools.lock().contains_key(name) {
            return Err(BackendError::PoolNotFound(name.to_string()));
        }
        Ok(MemoryPool {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        })
    }

    fn new_stream(&self, _flags: u32) -> Result<MemoryStream, BackendError> {
        self.shared.control_delay();
        self.shared.inject(Op::NewStream)?;
        bump(&self.shared.stats.streams_opened);
        Ok(MemoryStream {
            shared: Arc::clone(&self.shared),
            binding: None,
        })
    }

    fn close(self) -> Result<(), BackendError> {
        bump(&self.shared.stats.connections_closed);
        debug!("Closed in-process connection to {}", self.uri);
        Ok(())
    }
}

pub struct MemoryPool {
    shared: Arc<Shared>,
    name: String,
}

impl StoragePool for MemoryPool {
    type Volume = MemoryVolume;

    fn name(&self) -> &str {
        &self.name
    }

    fn create_volume(
        &self,
        descriptor_xml: &str,
        _flags: u32,
    ) -> Result<MemoryVolume, BackendError> {
        self.shared.control_delay();
        self.shared.inject(Op::CreateVolume)?;

        let name = element_text(descriptor_xml, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BackendError::InvalidDescriptor("missing <name>".to_string()))?
            .to_string();
        let capacity = parse_capacity(descriptor_xml)?;

        let mut pools = self.shared.pools.lock();
        let pool = pools
            .get_mut(&self.name)
            .ok_or_else(|| BackendError::PoolNotFound(self.name.clone()))?;
        if pool.volumes.contains_key(&name) {
            return Err(BackendError::VolumeExists(name));
        }

        let state = Arc::new(Mutex::new(VolumeState {
            capacity,
            data: Vec::new(),
            deleted: false,
        }));
        pool.volumes.insert(name.clone(), Arc::clone(&state));
        bump(&self.shared.stats.volumes_created);
        trace!("Created volume {} ({} bytes) in pool {}", name, capacity, self.name);

        Ok(MemoryVolume {
            shared: Arc::clone(&self.shared),
            pool: self.name.clone(),
            name,
            state,
        })
    }
}

pub struct MemoryVolume {
    shared: Arc<Shared>,
    pool: String,
    name: String,
    state: SharedVolume,
}

impl std::fmt::Debug for MemoryVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryVolume")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryVolume {
    fn bind(
        &self,
        stream: &mut MemoryStream,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<(), BackendError> {
        let capacity = {
            let state = self.state.lock();
            if state.deleted {
                return Err(BackendError::VolumeMissing(self.name.clone()));
            }
            state.capacity
        };
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= capacity)
            .ok_or(BackendError::OutOfRange {
                offset,
                length,
                capacity,
            })?;
        if stream.binding.is_some() {
            return Err(BackendError::StreamAlreadyBound);
        }
        stream.binding = Some(Binding {
            direction,
            volume: Arc::clone(&self.state),
            cursor: offset,
            end,
        });
        Ok(())
    }
}

impl Volume for MemoryVolume {
    type Stream = MemoryStream;

    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Result<VolumeInfo, BackendError> {
        self.shared.control_delay();
        self.shared.inject(Op::VolumeInfo)?;
        let state = self.state.lock();
        if state.deleted {
            return Err(BackendError::VolumeMissing(self.name.clone()));
        }
        Ok(VolumeInfo {
            capacity: state.capacity,
            allocation: state.data.len() as u64,
        })
    }

    fn upload(
        &self,
        stream: &mut MemoryStream,
        offset: u64,
        length: u64,
        _flags: u32,
    ) -> Result<(), BackendError> {
        self.shared.control_delay();
        self.shared.inject(Op::UploadBind)?;
        self.bind(stream, Direction::Upload, offset, length)?;
        bump(&self.shared.stats.upload_binds);
        Ok(())
    }

    fn download(
        &self,
        stream: &mut MemoryStream,
        offset: u64,
        length: u64,
        _flags: u32,
    ) -> Result<(), BackendError> {
        self.shared.control_delay();
        self.shared.inject(Op::DownloadBind)?;
        self.bind(stream, Direction::Download, offset, length)?;
        bump(&self.shared.stats.download_binds);
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.shared.control_delay();
        let removed = self
            .shared
            .pools
            .lock()
            .get_mut(&self.pool)
            .and_then(|pool| pool.volumes.remove(&self.name));
        if removed.is_none() {
            return Err(BackendError::VolumeMissing(self.name.clone()));
        }
        self.state.lock().deleted = true;
        bump(&self.shared.stats.volumes_deleted);
        Ok(())
    }
}

impl Drop for MemoryVolume {
    fn drop(&mut self) {
        bump(&self.shared.stats.volumes_freed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

struct Binding {
    direction: Direction,
    volume: SharedVolume,
    cursor: u64,
    end: u64,
}

fn bound<'a>(
    binding: &'a mut Option<Binding>,
    direction: Direction,
    label: &'static str,
) -> Result<&'a mut Binding, BackendError> {
    match binding {
        Some(b) if b.direction == direction => Ok(b),
        _ => Err(BackendError::StreamNotBound(label)),
    }
}

pub struct MemoryStream {
    shared: Arc<Shared>,
    binding: Option<Binding>,
}

impl StreamSession for MemoryStream {
    fn send(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        self.shared.transfer_delay();
        self.shared.inject(Op::Send)?;
        let binding = bound(&mut self.binding, Direction::Upload, "upload")?;

        let room = binding.end - binding.cursor;
        let n = (data.len() as u64).min(room) as usize;
        let start = binding.cursor as usize;
        {
            let mut volume = binding.volume.lock();
            if volume.data.len() < start + n {
                volume.data.resize(start + n, 0);
            }
            volume.data[start..start + n].copy_from_slice(&data[..n]);
        }
        binding.cursor += n as u64;
        self.shared
            .stats
            .bytes_sent
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        self.shared.transfer_delay();
        self.shared.inject(Op::Recv)?;
        let binding = bound(&mut self.binding, Direction::Download, "download")?;

        let n = (buf.len() as u64).min(binding.end - binding.cursor) as usize;
        let start = binding.cursor as usize;
        {
            let volume = binding.volume.lock();
            let stored_end = volume.data.len().min(start + n);
            let stored = stored_end.saturating_sub(start);
            if stored > 0 {
                buf[..stored].copy_from_slice(&volume.data[start..stored_end]);
            }
            buf[stored..n].fill(0);
        }
        binding.cursor += n as u64;
        self.shared
            .stats
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        self.shared.inject(Op::Finish)?;
        self.binding = None;
        bump(&self.shared.stats.streams_finished);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), BackendError> {
        self.binding = None;
        bump(&self.shared.stats.streams_aborted);
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        bump(&self.shared.stats.streams_freed);
    }
}

/// Text content of the first `<tag>...</tag>` element
fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let (_, body) = element(xml, tag)?;
    Some(body.trim())
}

/// Attribute list and body of the first `<tag ...>...</tag>` element
fn element<'a>(xml: &'a str, tag: &str) -> Option<(&'a str, &'a str)> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search = xml;
    loop {
        let start = search.find(&open)?;
        let rest = &search[start + open.len()..];
        match rest.chars().next() {
            Some('>') | Some(' ') | Some('\t') | Some('\n') => {
                let gt = rest.find('>')?;
                let attrs = &rest[..gt];
                let body = &rest[gt + 1..];
                let end = body.find(&close)?;
                return Some((attrs, &body[..end]));
            }
            _ => search = rest,
        }
    }
}

fn parse_capacity(xml: &str) -> Result<u64, BackendError> {
    let (attrs, body) = element(xml, "capacity")
        .ok_or_else(|| BackendError::InvalidDescriptor("missing <capacity>".to_string()))?;
    let value: u64 = body.trim().parse().map_err(|_| {
        BackendError::InvalidDescriptor(format!("invalid capacity '{}'", body.trim()))
    })?;
    let unit = attrs
        .split("unit=")
        .nth(1)
        .and_then(|u| {
            let u = u.trim_start();
            let quote = u.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            u[1..].split(quote).next()
        })
        .unwrap_or("bytes");
    let scale: u64 = match unit {
        "" | "b" | "B" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "K" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        other => {
            return Err(BackendError::InvalidDescriptor(format!(
                "unknown capacity unit '{}'",
                other
            )))
        }
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| BackendError::InvalidDescriptor("capacity overflows".to_string()))
}
