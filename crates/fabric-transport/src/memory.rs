//! Buffer registration.
//!
//! A [`MemoryHandle`] owns one registered application buffer plus the NIC
//! resources its role needs: a data endpoint, a side-channel endpoint and
//! record, and for target roles the memory completion queues that observe
//! remote arrivals.

use serde::{Deserialize, Serialize};

use crate::completion::{OpContext, Status};
use crate::connection::{Connection, Peer};
use crate::directory::ConnId;
use crate::error::{Result, TransportError};
use crate::nic::{CqId, EpId, InstanceId, MemHandle, MemoryRegion, NicDriver};
use crate::role::{OpState, QueueSel, Role, RoleState};
use crate::wc::{OpCode, WorkCompletion, WC_RECORD_LEN};

/// Address and key of a side-channel record on a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideChannel {
    /// Address of the record on the peer.
    pub addr: u64,
    /// Registration covering it.
    pub mem: MemHandle,
}

/// What a peer needs to target a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuffer {
    /// Instance that owns the buffer.
    pub instance: InstanceId,
    /// Address of the first byte on the owner.
    pub addr: u64,
    /// Length in bytes.
    pub size: u64,
    /// Registration covering the buffer.
    pub mem: MemHandle,
    /// Role the owner registered it with.
    pub role: Role,
    /// Where the acknowledgment record for an operation on this buffer goes.
    pub side_channel: Option<SideChannel>,
}

impl RemoteBuffer {
    /// Encodes the descriptor for shipping to a peer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a descriptor received from a peer. Addresses are not trusted;
    /// transfers recheck them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// NIC resources of a buffer registered against a peer.
#[derive(Debug)]
pub(crate) struct PeerChannels {
    pub conn: ConnId,
    pub peer: Peer,
    pub ep_cq: CqId,
    pub ep: EpId,
    pub wc_cq: CqId,
    pub wc_ep: EpId,
    pub wc_region: MemoryRegion,
    pub wc_mem: MemHandle,
    pub mem_cq: Option<CqId>,
    pub wc_mem_cq: Option<CqId>,
    /// Peer side channel the next acknowledgment is written to.
    pub ack_target: Option<SideChannel>,
}

/// A registered buffer.
///
/// Operations that change the buffer's state take `&mut MemoryHandle`; only
/// one operation may be in flight at a time.
#[derive(Debug)]
pub struct MemoryHandle {
    pub(crate) id: u64,
    pub(crate) instance: InstanceId,
    pub(crate) rs: RoleState,
    pub(crate) region: MemoryRegion,
    pub(crate) mem: MemHandle,
    pub(crate) elem_size: usize,
    pub(crate) channels: Option<PeerChannels>,
    /// Record of the last locally issued operation.
    pub(crate) wc: WorkCompletion,
    pub(crate) status: Option<Status>,
}

impl MemoryHandle {
    pub(crate) fn for_queue(
        id: u64,
        instance: InstanceId,
        region: MemoryRegion,
        mem: MemHandle,
        slot_size: usize,
    ) -> Self {
        Self {
            id,
            instance,
            rs: RoleState::for_role(Role::RequestQueue),
            region,
            mem,
            elem_size: slot_size,
            channels: None,
            wc: WorkCompletion::default(),
            status: None,
        }
    }

    /// Handle number, unique within the transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Role given at registration.
    pub fn role(&self) -> Role {
        self.rs.role()
    }

    /// Progress of the current operation.
    pub fn state(&self) -> OpState {
        self.rs.state()
    }

    /// Most recent operation on the buffer.
    pub fn last_op(&self) -> Option<OpCode> {
        self.rs.last_op()
    }

    /// True once the current operation has finished.
    pub fn is_complete(&self) -> bool {
        self.rs.is_complete()
    }

    /// Puts a completed target buffer back to waiting for the next arrival.
    pub fn rearm(&mut self) {
        self.rs.rearm();
        self.status = None;
    }

    /// Status of the last completed operation.
    pub fn last_status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Element size given at registration; the slot size for a request queue.
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Registered address of the first byte.
    pub fn base(&self) -> u64 {
        self.region.base()
    }

    /// Peer the buffer was registered against; `None` for the request queue.
    pub fn peer(&self) -> Option<&Peer> {
        self.channels.as_ref().map(|ch| &ch.peer)
    }

    /// Copies `len` bytes out of the buffer.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.region.read_at(offset, len).ok_or_else(|| {
            TransportError::invalid(format!(
                "read of {len} bytes at {offset} outside {}-byte buffer",
                self.len()
            ))
        })
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if self.region.write_at(offset, data) {
            Ok(())
        } else {
            Err(TransportError::invalid(format!(
                "write of {} bytes at {offset} outside {}-byte buffer",
                data.len(),
                self.len()
            )))
        }
    }

    /// Descriptor a peer uses to target this buffer.
    pub fn remote(&self) -> RemoteBuffer {
        RemoteBuffer {
            instance: self.instance,
            addr: self.region.base(),
            size: self.region.len() as u64,
            mem: self.mem,
            role: self.role(),
            side_channel: self.channels.as_ref().map(|ch| SideChannel {
                addr: ch.wc_region.base(),
                mem: ch.wc_mem,
            }),
        }
    }

    pub(crate) fn channels(&self) -> Result<&PeerChannels> {
        self.channels
            .as_ref()
            .ok_or_else(|| TransportError::invalid("request queue buffers cannot issue operations"))
    }

    pub(crate) fn cq_for(&self, sel: QueueSel) -> Result<CqId> {
        let ch = self.channels()?;
        let cq = match sel {
            QueueSel::Endpoint => Some(ch.ep_cq),
            QueueSel::SideChannel => Some(ch.wc_cq),
            QueueSel::Memory => ch.mem_cq,
            QueueSel::SideChannelMemory => ch.wc_mem_cq,
            QueueSel::RequestQueue => None,
        };
        cq.ok_or_else(|| {
            TransportError::invalid(format!("{} buffer has no {sel:?} queue", self.role()))
        })
    }
}

/// Releases staged NIC resources unless disarmed.
pub(crate) struct Rollback<'a> {
    nic: &'a dyn NicDriver,
    cqs: Vec<CqId>,
    eps: Vec<EpId>,
    mems: Vec<MemHandle>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    pub fn new(nic: &'a dyn NicDriver) -> Self {
        Self {
            nic,
            cqs: Vec::new(),
            eps: Vec::new(),
            mems: Vec::new(),
            armed: true,
        }
    }

    pub fn cq(&mut self, depth: usize) -> Result<CqId> {
        let cq = self.nic.create_cq(depth)?;
        self.cqs.push(cq);
        Ok(cq)
    }

    pub fn ep(&mut self, cq: CqId) -> Result<EpId> {
        let ep = self.nic.create_ep(cq)?;
        self.eps.push(ep);
        Ok(ep)
    }

    pub fn register(&mut self, region: &MemoryRegion, cq: Option<CqId>) -> Result<MemHandle> {
        let mem = self.nic.register(region, cq)?;
        self.mems.push(mem);
        Ok(mem)
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for ep in self.eps.drain(..) {
            let _ = self.nic.destroy_ep(ep);
        }
        for mem in self.mems.drain(..) {
            let _ = self.nic.deregister(mem);
        }
        for cq in self.cqs.drain(..) {
            let _ = self.nic.destroy_cq(cq);
        }
    }
}

pub(crate) fn check_layout(len: usize, elem_size: usize) -> Result<()> {
    if len == 0 {
        return Err(TransportError::invalid("buffer is empty"));
    }
    if elem_size == 0 {
        return Err(TransportError::invalid("element size is zero"));
    }
    if len % elem_size != 0 {
        return Err(TransportError::invalid(format!(
            "buffer of {len} bytes is not a multiple of {elem_size}"
        )));
    }
    Ok(())
}

/// Registers `buffer` for `role` against the peer behind `conn`.
pub(crate) fn register(
    ctx: &OpContext<'_>,
    id: u64,
    buffer: Vec<u8>,
    elem_size: usize,
    role: Role,
    conn: &Connection,
) -> Result<MemoryHandle> {
    check_layout(buffer.len(), elem_size)?;
    let depth = ctx.config.cq_depth;
    let peer_addr = conn.placement.local_addr;
    let peer_instance = conn.peer.instance;

    let region = MemoryRegion::new(buffer);
    let wc_region = MemoryRegion::zeroed(WC_RECORD_LEN)?;

    let mut staged = Rollback::new(ctx.nic);
    let (mem_cq, wc_mem_cq) = if role.needs_memory_cq() {
        (Some(staged.cq(depth)?), Some(staged.cq(depth)?))
    } else {
        (None, None)
    };
    let mem = staged.register(&region, mem_cq)?;
    let wc_mem = staged.register(&wc_region, wc_mem_cq)?;

    let ep_cq = staged.cq(depth)?;
    let ep = staged.ep(ep_cq)?;
    ctx.nic.bind_ep(ep, peer_addr, peer_instance)?;
    let wc_cq = staged.cq(depth)?;
    let wc_ep = staged.ep(wc_cq)?;
    ctx.nic.bind_ep(wc_ep, peer_addr, peer_instance)?;
    staged.disarm();

    tracing::debug!(
        handle = id,
        %role,
        len = region.len(),
        peer = %conn.peer,
        "buffer registered"
    );
    Ok(MemoryHandle {
        id,
        instance: ctx.instance(),
        rs: RoleState::for_role(role),
        region,
        mem,
        elem_size,
        channels: Some(PeerChannels {
            conn: conn.id,
            peer: conn.peer.clone(),
            ep_cq,
            ep,
            wc_cq,
            wc_ep,
            wc_region,
            wc_mem,
            mem_cq,
            wc_mem_cq,
            ack_target: None,
        }),
        wc: WorkCompletion::default(),
        status: None,
    })
}

/// Tears down a peer buffer's NIC resources and returns its bytes.
pub(crate) fn unregister(nic: &dyn NicDriver, handle: MemoryHandle) -> Result<Vec<u8>> {
    let MemoryHandle {
        id,
        region,
        mem,
        channels,
        ..
    } = handle;
    let ch = channels
        .ok_or_else(|| TransportError::invalid("request queue is unregistered by the transport"))?;

    let mut first_err: Option<TransportError> = None;
    let mut note = |r: std::result::Result<(), crate::nic::NicError>| {
        if let Err(e) = r {
            tracing::warn!(handle = id, error = %e, "buffer teardown step failed");
            first_err.get_or_insert(e.into());
        }
    };
    note(nic.destroy_ep(ch.ep));
    note(nic.destroy_ep(ch.wc_ep));
    note(nic.deregister(mem));
    note(nic.deregister(ch.wc_mem));
    note(nic.destroy_cq(ch.ep_cq));
    note(nic.destroy_cq(ch.wc_cq));
    for cq in [ch.mem_cq, ch.wc_mem_cq].into_iter().flatten() {
        note(nic.destroy_cq(cq));
    }

    match first_err {
        Some(err) => Err(err),
        None => {
            tracing::debug!(handle = id, "buffer unregistered");
            Ok(region.into_vec())
        }
    }
}
