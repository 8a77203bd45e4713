//! Completion processing.
//!
//! [`wait`] polls whichever completion queue the buffer's role state selects,
//! feeds successful events through the state table, posts acknowledgment
//! writes when an initiator's data transfer lands, and hands request-queue
//! events to the queue's in-order delivery logic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::{DeliveryMode, TransportConfig};
use crate::connection::Peer;
use crate::deadline::Deadline;
use crate::error::{Result, ResultCode, TransportError};
use crate::handshake::ClientQueueAttrs;
use crate::memory::MemoryHandle;
use crate::metrics::TransportMetrics;
use crate::nic::{CqEvent, CqId, InstanceId, NicDriver, NicError};
use crate::request_queue::{Delivery, RequestQueue};
use crate::role::{Operation, QueueSel, Transition};
use crate::transfer;
use crate::wc::{OpCode, WorkCompletion};

/// Everything an operation needs from the transport.
pub(crate) struct OpContext<'a> {
    pub nic: &'a dyn NicDriver,
    pub config: &'a TransportConfig,
    pub cancel: &'a CancelToken,
    pub metrics: &'a TransportMetrics,
}

impl OpContext<'_> {
    pub fn instance(&self) -> InstanceId {
        self.nic.instance()
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.config.delivery_mode
    }

    /// Deadline for internal waits.
    pub fn op_deadline(&self) -> Deadline {
        Deadline::after(self.config.op_timeout())
    }
}

/// A client the request queue can send unblock notifications to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnblockTarget {
    pub instance: InstanceId,
    pub nic_addr: u32,
    pub attrs: ClientQueueAttrs,
}

/// Connection lookups needed while processing completions.
pub(crate) trait PeerLookup {
    fn peer_by_instance(&self, instance: InstanceId) -> Option<Peer>;

    fn unblock_targets(&self) -> Vec<UnblockTarget>;
}

/// Outcome of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The operation the caller waited for.
    pub op: Operation,
    /// Always `Ok` on a returned status; failures surface as errors.
    pub result: ResultCode,
    /// Base address of the local buffer.
    pub start: u64,
    /// Byte offset of the transfer within the buffer.
    pub offset: u64,
    /// Bytes moved.
    pub length: u64,
    /// Peer that supplied the data.
    pub src: Option<Peer>,
    /// Peer that received the data.
    pub dest: Option<Peer>,
}

/// Polls `cq` once for at most one slice of `deadline`.
///
/// An expired deadline turns into a non-blocking poll.
pub(crate) fn poll_slice(
    ctx: &OpContext<'_>,
    cq: CqId,
    deadline: &Deadline,
) -> Result<Option<CqEvent>> {
    let slice = deadline.slice(ctx.config.poll_interval());
    if slice.is_zero() {
        return Ok(ctx.nic.try_event(cq)?);
    }
    match ctx.nic.wait_event(cq, slice) {
        Ok(event) => Ok(Some(event)),
        Err(NicError::Timeout { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Waits for one successful event on `cq`, observing cancellation.
pub(crate) fn poll_until(
    ctx: &OpContext<'_>,
    cq: CqId,
    deadline: Deadline,
    what: &'static str,
) -> Result<CqEvent> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match poll_slice(ctx, cq, &deadline)? {
            Some(event) if event.ok => return Ok(event),
            Some(event) => {
                ctx.metrics.inc_completion_errors();
                tracing::error!(%cq, what, data = event.data, "completion failure");
                return Err(TransportError::Completion {
                    cq: cq.0,
                    detail: format!("{what}: {:?} event reported failure", event.source),
                });
            }
            None if deadline.is_expired() => {
                return Err(TransportError::Timeout {
                    what,
                    elapsed_ms: deadline.elapsed_ms(),
                })
            }
            None => {}
        }
    }
}

/// Waits until `handle`'s current operation completes.
///
/// `queue` must be the request queue when `handle` is the request-queue
/// buffer. `None` for `timeout` waits without a deadline.
pub(crate) fn wait(
    ctx: &OpContext<'_>,
    handle: &mut MemoryHandle,
    op: Operation,
    timeout: Option<Duration>,
    mut queue: Option<&mut RequestQueue>,
    local: &Peer,
    peers: &dyn PeerLookup,
) -> Result<Status> {
    if !handle.role().accepts(op) {
        return Err(TransportError::invalid(format!(
            "cannot wait for {op:?} on a {} buffer",
            handle.role()
        )));
    }
    if handle.rs.is_complete() && handle.rs.rearms_on_wait() {
        handle.rearm();
    }

    let deadline = Deadline::from_timeout(timeout);
    loop {
        if handle.rs.is_complete() {
            let mut status = handle
                .status
                .clone()
                .ok_or_else(|| TransportError::invalid("buffer has no completed operation"))?;
            // Offsets and peers come from the last operation; `op` echoes the caller.
            status.op = op;
            ctx.metrics.inc_waits_completed();
            return Ok(status);
        }
        if ctx.cancel.is_cancelled() {
            ctx.metrics.inc_waits_cancelled();
            return Err(TransportError::Cancelled);
        }

        let Some(sel) = handle.rs.select_queue() else {
            continue;
        };
        let cq = if sel == QueueSel::RequestQueue {
            let rq = queue
                .as_deref_mut()
                .ok_or_else(|| TransportError::invalid("no request queue registered"))?;
            if let Some(delivery) = rq.take_ready(ctx, peers)? {
                deliver(handle, delivery, local, peers);
                continue;
            }
            rq.wc_cq()
        } else {
            handle.cq_for(sel)?
        };

        match poll_slice(ctx, cq, &deadline)? {
            None if deadline.is_expired() => {
                ctx.metrics.inc_waits_timed_out();
                tracing::debug!(
                    handle = handle.id,
                    role = %handle.role(),
                    state = ?handle.state(),
                    elapsed_ms = deadline.elapsed_ms(),
                    "wait timed out"
                );
                return Err(TransportError::Timeout {
                    what: "wait",
                    elapsed_ms: deadline.elapsed_ms(),
                });
            }
            None => {}
            Some(event) if !event.ok => {
                ctx.metrics.inc_completion_errors();
                tracing::error!(
                    handle = handle.id,
                    role = %handle.role(),
                    state = ?handle.state(),
                    last_op = ?handle.last_op(),
                    queue = ?sel,
                    %cq,
                    source = ?event.source,
                    data = event.data,
                    "completion failure"
                );
                return Err(TransportError::Completion {
                    cq: cq.0,
                    detail: format!(
                        "{} buffer in {:?} (last op {:?}) got a failed {:?} event on {sel:?} queue",
                        handle.role(),
                        handle.state(),
                        handle.last_op(),
                        event.source
                    ),
                });
            }
            Some(event) => process_event(ctx, handle, event, queue.as_deref_mut(), local, peers)?,
        }
    }
}

fn process_event(
    ctx: &OpContext<'_>,
    handle: &mut MemoryHandle,
    event: CqEvent,
    queue: Option<&mut RequestQueue>,
    local: &Peer,
    peers: &dyn PeerLookup,
) -> Result<()> {
    match handle.rs.advance() {
        Transition::Progressed => {}
        Transition::NeedsAck => transfer::post_ack(ctx, handle)?,
        Transition::Completed => {
            let status = completed_status(handle, local)?;
            handle.status = Some(status);
        }
        Transition::Delegate => {
            let rq = queue.ok_or_else(|| TransportError::invalid("no request queue registered"))?;
            if let Some(delivery) = rq.next_request(ctx, event, peers)? {
                deliver(handle, delivery, local, peers);
            }
        }
    }
    Ok(())
}

fn completed_status(handle: &mut MemoryHandle, local: &Peer) -> Result<Status> {
    let (op, length, offset) = if handle.rs.initiated() {
        let op = handle
            .rs
            .last_op()
            .ok_or_else(|| TransportError::invalid("initiated buffer has no last operation"))?;
        let wc = handle.wc;
        let offset = match op {
            OpCode::GetInitiator => wc.dest_offset,
            OpCode::Send => wc.byte_offset,
            _ => wc.src_offset,
        };
        (op, wc.byte_len, offset)
    } else {
        let wc = WorkCompletion::read_from(&handle.channels()?.wc_region, 0)?;
        let op = wc.op_code().ok_or_else(|| {
            TransportError::Serialization(format!("unknown operation code {}", wc.op))
        })?;
        handle.rs.record_arrival(op);
        let offset = if op == OpCode::GetTarget {
            wc.src_offset
        } else {
            wc.dest_offset
        };
        (op, wc.byte_len, offset)
    };

    let peer = handle.channels()?.peer.clone();
    let (src, dest) = if op.local_is_source() {
        (local.clone(), peer)
    } else {
        (peer, local.clone())
    };
    tracing::debug!(
        handle = handle.id,
        role = %handle.role(),
        ?op,
        length,
        offset,
        "operation complete"
    );
    Ok(Status {
        op: Operation::of(op),
        result: ResultCode::Ok,
        start: handle.base(),
        offset,
        length,
        src: Some(src),
        dest: Some(dest),
    })
}

fn deliver(handle: &mut MemoryHandle, delivery: Delivery, local: &Peer, peers: &dyn PeerLookup) {
    handle.rs.deliver();
    let sender = peers.peer_by_instance(delivery.wc.sender());
    if sender.is_none() {
        tracing::warn!(
            slot = delivery.slot,
            instance = delivery.wc.sender(),
            "request from unknown instance"
        );
    }
    handle.status = Some(Status {
        op: Operation::of(OpCode::NewRequest),
        result: ResultCode::Ok,
        start: handle.base(),
        offset: delivery.wc.byte_offset,
        length: delivery.wc.byte_len,
        src: sender,
        dest: Some(local.clone()),
    });
}
