//! The NIC seam.
//!
//! The transport never touches interconnect hardware directly. Everything it
//! needs is expressed by [`NicDriver`]: completion queues, endpoints bound to
//! a remote instance, memory registration, posted RDMA/atomic operations and
//! event polling. [`crate::rdma_sim`] provides an in-process implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DeliveryMode;

/// NIC-derived identifier of a process's endpoint on the fabric.
pub type InstanceId = u32;

static NEXT_REGION_BASE: AtomicU64 = AtomicU64::new(0x1000_0000);

const REGION_ALIGN: u64 = 0x1000;

/// Opaque memory-handle pair returned by registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemHandle {
    /// First word, assigned by the NIC.
    pub qword1: u64,
    /// Second word, assigned by the NIC.
    pub qword2: u64,
}

impl MemHandle {
    /// True for the default handle no registration ever returns.
    pub fn is_null(&self) -> bool {
        self.qword1 == 0 && self.qword2 == 0
    }
}

/// Protection-domain credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// Protection tag of the domain.
    pub ptag: u32,
    /// Cookie that must accompany the tag.
    pub cookie: u32,
}

/// Where a process sits on the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementInfo {
    /// NIC device number on the host.
    pub device_id: u32,
    /// Hardware address of the NIC, used when binding endpoints to it.
    pub local_addr: u32,
    /// Protection tag the process attached with.
    pub ptag: u32,
    /// Cookie the process attached with.
    pub cookie: u32,
}

/// Completion queue created by a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CqId(pub u64);

/// Endpoint created by a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpId(pub u64);

/// Protection-domain attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u64);

impl fmt::Display for CqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cq#{}", self.0)
    }
}

impl fmt::Display for EpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// A contiguous block of host memory that can be registered with the NIC.
///
/// Clones share the same bytes; the NIC keeps a clone for as long as the
/// region is registered. Each region is assigned a unique virtual base
/// address at creation so remote descriptors can address it.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    base: u64,
    len: usize,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRegion {
    /// Takes ownership of `buffer` and assigns it a fresh base address.
    pub fn new(buffer: Vec<u8>) -> Self {
        let len = buffer.len();
        let span = (len as u64).max(1).div_ceil(REGION_ALIGN) * REGION_ALIGN;
        let base = NEXT_REGION_BASE.fetch_add(span + REGION_ALIGN, Ordering::Relaxed);
        Self {
            base,
            len,
            bytes: Arc::new(Mutex::new(buffer)),
        }
    }

    /// Allocates a zero-filled region, reporting allocation failure instead of aborting.
    pub fn zeroed(len: usize) -> Result<Self, NicError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| NicError::OutOfMemory {
                reason: format!("{len} bytes: {e}"),
            })?;
        buffer.resize(len, 0);
        Ok(Self::new(buffer))
    }

    /// Virtual address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of `addr` inside the region if `[addr, addr + len)` fits.
    pub fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let end = offset.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        Some(offset as usize)
    }

    /// Copies `len` bytes out, or `None` if the range is out of bounds.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.bytes.lock();
        let end = offset.checked_add(len)?;
        if end > buf.len() {
            return None;
        }
        Some(buf[offset..end].to_vec())
    }

    /// Copies `data` in; `false` if the range is out of bounds.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = self.bytes.lock();
        let end = match offset.checked_add(data.len()) {
            Some(end) if end <= buf.len() => end,
            _ => return false,
        };
        buf[offset..end].copy_from_slice(data);
        true
    }

    /// Little-endian word at `offset`.
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.read_at(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(word))
    }

    /// Stores a little-endian word at `offset`.
    pub fn write_u64(&self, offset: usize, value: u64) -> bool {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Atomically replaces the word at `offset` with `f(old)` and returns `old`.
    pub fn fetch_update(&self, offset: usize, f: impl FnOnce(u64) -> u64) -> Option<u64> {
        let mut buf = self.bytes.lock();
        let end = offset.checked_add(8)?;
        if end > buf.len() {
            return None;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[offset..end]);
        let old = u64::from_le_bytes(word);
        buf[offset..end].copy_from_slice(&f(old).to_le_bytes());
        Some(old)
    }

    /// Returns the bytes, copying only if another clone is still alive.
    pub fn into_vec(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes.into_inner(),
            Err(shared) => shared.lock().clone(),
        }
    }
}

/// Kind of operation carried by a [`PostDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    /// Write local bytes into remote memory.
    Put,
    /// Read remote bytes into local memory.
    Get,
    /// Remote 64-bit fetch-add; the previous value lands at the local address.
    FetchAdd(u64),
    /// Remote 64-bit fetch-and; the previous value lands at the local address.
    FetchAnd(u64),
    /// Raise an event carrying `value` on the completion queue attached to
    /// the remote registration.
    CqWrite(u64),
}

/// One posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostDescriptor {
    /// What the NIC should do.
    pub op: PostOp,
    /// Local address the data comes from or lands at.
    pub local_addr: u64,
    /// Registration covering `local_addr`.
    pub local_mem: MemHandle,
    /// Remote address the operation targets.
    pub remote_addr: u64,
    /// Registration covering `remote_addr` on the peer.
    pub remote_mem: MemHandle,
    /// Bytes to move; 8 for atomics, 0 for a completion-queue write.
    pub length: u64,
    /// Also raise an event at the remote registration's completion queue.
    pub remote_event: bool,
    /// Ordering guarantee requested from the NIC.
    pub delivery: DeliveryMode,
}

impl PostDescriptor {
    /// Writes `length` local bytes to the remote address.
    pub fn put(
        local: (u64, MemHandle),
        remote: (u64, MemHandle),
        length: u64,
        delivery: DeliveryMode,
    ) -> Self {
        Self {
            op: PostOp::Put,
            local_addr: local.0,
            local_mem: local.1,
            remote_addr: remote.0,
            remote_mem: remote.1,
            length,
            remote_event: false,
            delivery,
        }
    }

    /// Reads `length` remote bytes into the local address.
    pub fn get(
        local: (u64, MemHandle),
        remote: (u64, MemHandle),
        length: u64,
        delivery: DeliveryMode,
    ) -> Self {
        Self {
            op: PostOp::Get,
            ..Self::put(local, remote, length, delivery)
        }
    }

    /// 64-bit atomic on the remote word; the old value lands locally.
    pub fn atomic(
        op: PostOp,
        local: (u64, MemHandle),
        remote: (u64, MemHandle),
        delivery: DeliveryMode,
    ) -> Self {
        Self {
            op,
            ..Self::put(local, remote, 8, delivery)
        }
    }

    /// Raises an event with `value` on the remote registration's queue.
    pub fn cq_write(remote: (u64, MemHandle), value: u64, delivery: DeliveryMode) -> Self {
        Self {
            op: PostOp::CqWrite(value),
            local_addr: 0,
            local_mem: MemHandle::default(),
            remote_addr: remote.0,
            remote_mem: remote.1,
            length: 0,
            remote_event: true,
            delivery,
        }
    }

    /// Also notify the target's completion queue.
    pub fn with_remote_event(mut self) -> Self {
        self.remote_event = true;
        self
    }
}

/// Which side of an operation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// The local post finished.
    Local,
    /// A peer's operation touched a local registration.
    Remote,
}

/// One completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEvent {
    /// Which side of the operation this event reports.
    pub source: EventSource,
    /// Event data of the posting endpoint; by default the poster's instance id.
    pub data: u32,
    /// Value carried by a completion-queue write.
    pub payload: u64,
    /// False when the NIC reports the operation failed.
    pub ok: bool,
}

/// Errors reported by a [`NicDriver`].
#[derive(Debug, Error)]
pub enum NicError {
    /// `wait_event` saw nothing before its timeout.
    #[error("timed out waiting on {cq}")]
    Timeout {
        /// The queue that was polled.
        cq: CqId,
    },

    /// The protection domain rejected the credentials.
    #[error("protection domain attach refused for ptag {ptag}")]
    PermissionDenied {
        /// The refused tag.
        ptag: u32,
    },

    /// The NIC could not allocate.
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// What could not be allocated.
        reason: String,
    },

    /// A queue, endpoint, registration or domain id is not known.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle {
        /// Kind of handle.
        kind: &'static str,
        /// The id that was looked up.
        id: u64,
    },

    /// A post was issued on an endpoint with no remote binding.
    #[error("{ep} is not bound to a remote instance")]
    Unbound {
        /// The unbound endpoint.
        ep: EpId,
    },

    /// A descriptor names memory outside its registration.
    #[error("invalid descriptor: {reason}")]
    InvalidDescriptor {
        /// Which check failed.
        reason: String,
    },

    /// The hardware reported a fault.
    #[error("hardware failure: {reason}")]
    Hardware {
        /// Fault description.
        reason: String,
    },
}

/// Hardware primitives the transport is built on.
///
/// Implementations must be usable from several threads at once; each method
/// is a single, non-blocking hardware call except [`NicDriver::wait_event`],
/// which blocks for at most `timeout`.
pub trait NicDriver: Send + Sync {
    /// Instance id of this NIC endpoint.
    fn instance(&self) -> InstanceId;

    /// Placement information advertised to peers.
    fn placement(&self) -> PlacementInfo;

    /// Joins the protection domain named by `credentials`.
    fn attach_domain(&self, credentials: Credentials) -> Result<DomainId, NicError>;

    /// Leaves a domain joined with `attach_domain`.
    fn detach_domain(&self, domain: DomainId) -> Result<(), NicError>;

    /// Creates a completion queue holding at most `depth` events.
    fn create_cq(&self, depth: usize) -> Result<CqId, NicError>;

    /// Destroys a completion queue and drops its pending events.
    fn destroy_cq(&self, cq: CqId) -> Result<(), NicError>;

    /// Creates an endpoint whose local completions land on `cq`.
    fn create_ep(&self, cq: CqId) -> Result<EpId, NicError>;

    /// Binds an endpoint to the remote NIC address and instance.
    fn bind_ep(&self, ep: EpId, remote_addr: u32, instance: InstanceId) -> Result<(), NicError>;

    /// Clears an endpoint's remote binding.
    fn unbind_ep(&self, ep: EpId) -> Result<(), NicError>;

    /// Destroys an endpoint.
    fn destroy_ep(&self, ep: EpId) -> Result<(), NicError>;

    /// Sets the event data carried by local and remote events of posts on `ep`.
    fn set_event_data(&self, ep: EpId, local: u32, remote: u32) -> Result<(), NicError>;

    /// Registers a region. Remote events targeting it are raised on `cq`.
    fn register(&self, region: &MemoryRegion, cq: Option<CqId>) -> Result<MemHandle, NicError>;

    /// Releases a registration.
    fn deregister(&self, mem: MemHandle) -> Result<(), NicError>;

    /// Issues `desc` on a bound endpoint. The local completion lands on the
    /// endpoint's queue.
    fn post(&self, ep: EpId, desc: &PostDescriptor) -> Result<(), NicError>;

    /// Waits up to `timeout` for the next event; [`NicError::Timeout`] if none arrives.
    fn wait_event(&self, cq: CqId, timeout: Duration) -> Result<CqEvent, NicError>;

    /// Takes the next event without blocking.
    fn try_event(&self, cq: CqId) -> Result<Option<CqEvent>, NicError>;
}
