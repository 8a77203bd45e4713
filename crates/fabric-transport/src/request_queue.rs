//! Many-to-one request queue.
//!
//! The server owns a ring of `slot_count` fixed-size slots, a parallel array
//! of work-completion records and a shared index. A client claims a slot with
//! a remote fetch-add on the index, writes its payload into the slot, then
//! writes its record into the matching array entry with the slot number as
//! event data.
//!
//! The server delivers slots strictly in index order. Once half of the ring
//! has been consumed it clears the index with a fetch-and and broadcasts an
//! unblock event to every client, releasing any client whose claim landed
//! past the end of the ring. The reset races with concurrent claims: this is
//! a best-effort overflow heuristic, not a linearizable counter.
//!
//! Slot uniqueness and delivery order hold while fewer than `slot_count / 2`
//! requests are live (claimed but not yet delivered) across all clients.
//! After a reset the new cycle's claims start at slot 0 while the old cycle
//! still owns the slots from `slot_count / 2` up to its ceiling; under the
//! bound the new claims cannot reach them before they drain. Past the bound
//! a claim can land on an undelivered slot and overwrite it. Callers that
//! need the guarantee must throttle, for example one request in flight per
//! client with fewer clients than half the ring.

use crate::completion::{poll_slice, poll_until, OpContext, PeerLookup, UnblockTarget};
use crate::deadline::Deadline;
use crate::error::{Result, TransportError};
use crate::handshake::{ClientQueueAttrs, Identity, ServerQueueAttrs};
use crate::memory::{check_layout, MemoryHandle, Rollback};
use crate::nic::{CqId, EpId, MemHandle, MemoryRegion, NicDriver, PostDescriptor, PostOp};
use crate::wc::{OpCode, WorkCompletion, WC_RECORD_LEN};

/// A request handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub slot: usize,
    pub wc: WorkCompletion,
}

/// Counters of the server-side queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    /// Slots in the ring.
    pub slot_count: usize,
    /// Bytes per slot.
    pub slot_size: usize,
    /// Next slot to deliver.
    pub processed: usize,
    /// Processed-count ceiling of the current half-cycle.
    pub reset_limit: usize,
    /// Requests delivered since the queue was created.
    pub total_processed: u64,
    /// Index resets performed.
    pub resets: u64,
}

/// Server side.
pub(crate) struct RequestQueue {
    slot_size: usize,
    slot_count: usize,
    slots: MemoryRegion,
    slots_mem: MemHandle,
    records: MemoryRegion,
    records_mem: MemHandle,
    records_cq: CqId,
    index: MemoryRegion,
    index_mem: MemHandle,
    reset_result: MemoryRegion,
    reset_result_mem: MemHandle,
    reset_cq: CqId,
    reset_ep: EpId,
    unblock_cq: CqId,
    unblock_ep: EpId,
    processed: usize,
    reset_limit: usize,
    total_processed: u64,
    resets: u64,
}

impl RequestQueue {
    pub fn create(ctx: &OpContext<'_>, buffer: Vec<u8>, slot_size: usize) -> Result<Self> {
        check_layout(buffer.len(), slot_size)?;
        let slot_count = buffer.len() / slot_size;
        if slot_count < 2 {
            return Err(TransportError::invalid(
                "request queue needs at least two slots",
            ));
        }
        let depth = ctx.config.cq_depth;
        let placement = ctx.nic.placement();

        let slots = MemoryRegion::new(buffer);
        let records = MemoryRegion::zeroed(slot_count * WC_RECORD_LEN)?;
        let index = MemoryRegion::zeroed(8)?;
        let reset_result = MemoryRegion::zeroed(8)?;

        let mut staged = Rollback::new(ctx.nic);
        let slots_mem = staged.register(&slots, None)?;
        let records_cq = staged.cq(depth.max(2 * slot_count))?;
        let records_mem = staged.register(&records, Some(records_cq))?;
        let index_mem = staged.register(&index, None)?;
        let reset_result_mem = staged.register(&reset_result, None)?;
        let reset_cq = staged.cq(depth)?;
        let reset_ep = staged.ep(reset_cq)?;
        ctx.nic
            .bind_ep(reset_ep, placement.local_addr, ctx.instance())?;
        let unblock_cq = staged.cq(depth)?;
        let unblock_ep = staged.ep(unblock_cq)?;
        staged.disarm();

        tracing::info!(slot_count, slot_size, "request queue created");
        Ok(Self {
            slot_size,
            slot_count,
            slots,
            slots_mem,
            records,
            records_mem,
            records_cq,
            index,
            index_mem,
            reset_result,
            reset_result_mem,
            reset_cq,
            reset_ep,
            unblock_cq,
            unblock_ep,
            processed: 0,
            reset_limit: slot_count,
            total_processed: 0,
            resets: 0,
        })
    }

    /// Descriptor advertised to connecting clients.
    pub fn attrs(&self) -> ServerQueueAttrs {
        ServerQueueAttrs {
            req_index_addr: self.index.base(),
            req_index_mem: self.index_mem,
            req_buffer_addr: self.slots.base(),
            req_size: self.slot_size as u64,
            req_count: self.slot_count as u64,
            req_mem: self.slots_mem,
            wc_buffer_addr: self.records.base(),
            wc_mem: self.records_mem,
        }
    }

    pub fn handle(&self, id: u64, instance: crate::nic::InstanceId) -> MemoryHandle {
        MemoryHandle::for_queue(
            id,
            instance,
            self.slots.clone(),
            self.slots_mem,
            self.slot_size,
        )
    }

    pub fn wc_cq(&self) -> CqId {
        self.records_cq
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            slot_count: self.slot_count,
            slot_size: self.slot_size,
            processed: self.processed,
            reset_limit: self.reset_limit,
            total_processed: self.total_processed,
            resets: self.resets,
        }
    }

    fn record_offset(slot: usize) -> usize {
        slot * WC_RECORD_LEN
    }

    fn arrived(&self, slot: usize) -> bool {
        self.records.read_u64(Self::record_offset(slot)) == Some(1)
    }

    /// True when the next slot in order has already arrived.
    pub fn head_ready(&self) -> bool {
        self.arrived(self.processed)
    }

    /// Delivers the head slot if it is buffered.
    pub fn take_ready(
        &mut self,
        ctx: &OpContext<'_>,
        peers: &dyn PeerLookup,
    ) -> Result<Option<Delivery>> {
        if self.head_ready() {
            self.deliver_head(ctx, peers).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Accounts for one record-array event and delivers the head slot if it
    /// is now available.
    pub fn next_request(
        &mut self,
        ctx: &OpContext<'_>,
        event: crate::nic::CqEvent,
        peers: &dyn PeerLookup,
    ) -> Result<Option<Delivery>> {
        let slot = event.data as usize;
        if slot >= self.slot_count {
            return Err(TransportError::Completion {
                cq: self.records_cq.0,
                detail: format!("event for slot {slot} outside a {}-slot queue", self.slot_count),
            });
        }
        self.records.write_u64(Self::record_offset(slot), 1);
        if slot != self.processed {
            tracing::trace!(slot, head = self.processed, "request buffered out of order");
        }
        self.take_ready(ctx, peers)
    }

    fn deliver_head(&mut self, ctx: &OpContext<'_>, peers: &dyn PeerLookup) -> Result<Delivery> {
        let slot = self.processed;
        let offset = Self::record_offset(slot);
        let wc = WorkCompletion::read_from(&self.records, offset)?;
        self.records.write_u64(offset, 0);

        self.processed += 1;
        self.total_processed += 1;
        ctx.metrics.inc_requests_received();
        tracing::debug!(slot, sender = wc.inst_id, len = wc.byte_len, "request delivered");

        let index = self.index.read_u64(0).unwrap_or(0);
        if self.processed == self.slot_count / 2 && index >= self.processed as u64 {
            if let Err(err) = self.reset_and_unblock(ctx, peers) {
                tracing::error!(error = %err, "request index reset failed");
            }
        }
        if self.processed >= self.reset_limit {
            self.processed = 0;
        }
        Ok(Delivery { slot, wc })
    }

    /// Clears the shared index and broadcasts an unblock to every client.
    ///
    /// Runs with the old cycle's slots `processed..reset_limit` possibly still
    /// in flight. Claims made after the clear restart at slot 0, so they only
    /// stay clear of those slots while fewer than `slot_count / 2` requests
    /// are live.
    fn reset_and_unblock(&mut self, ctx: &OpContext<'_>, peers: &dyn PeerLookup) -> Result<()> {
        let desc = PostDescriptor::atomic(
            PostOp::FetchAnd(0),
            (self.reset_result.base(), self.reset_result_mem),
            (self.index.base(), self.index_mem),
            ctx.delivery(),
        );
        ctx.nic.post(self.reset_ep, &desc)?;
        poll_until(ctx, self.reset_cq, ctx.op_deadline(), "queue reset")?;
        let previous = self.reset_result.read_u64(0).unwrap_or(0);
        self.reset_limit = (previous as usize).min(self.slot_count);
        self.resets += 1;
        ctx.metrics.inc_queue_resets();

        let targets = peers.unblock_targets();
        tracing::debug!(
            previous,
            reset_limit = self.reset_limit,
            clients = targets.len(),
            "request index reset"
        );
        for target in targets {
            match self.unblock(ctx, &target) {
                Ok(()) => ctx.metrics.inc_unblocks_sent(),
                Err(err) => tracing::warn!(
                    instance = target.instance,
                    error = %err,
                    "unblock notification failed"
                ),
            }
        }
        Ok(())
    }

    fn unblock(&self, ctx: &OpContext<'_>, target: &UnblockTarget) -> Result<()> {
        ctx.nic
            .bind_ep(self.unblock_ep, target.nic_addr, target.instance)?;
        let desc = PostDescriptor::cq_write(
            (target.attrs.unblock_addr, target.attrs.unblock_mem),
            self.total_processed,
            ctx.delivery(),
        );
        let posted = ctx
            .nic
            .post(self.unblock_ep, &desc)
            .map_err(TransportError::from)
            .and_then(|_| poll_until(ctx, self.unblock_cq, ctx.op_deadline(), "unblock").map(|_| ()));
        let unbound = ctx.nic.unbind_ep(self.unblock_ep);
        posted?;
        Ok(unbound?)
    }

    /// Releases every NIC resource and returns the slot bytes.
    pub fn release(self, nic: &dyn NicDriver) -> Vec<u8> {
        for ep in [self.reset_ep, self.unblock_ep] {
            let _ = nic.destroy_ep(ep);
        }
        for mem in [
            self.slots_mem,
            self.records_mem,
            self.index_mem,
            self.reset_result_mem,
        ] {
            let _ = nic.deregister(mem);
        }
        for cq in [self.records_cq, self.reset_cq, self.unblock_cq] {
            let _ = nic.destroy_cq(cq);
        }
        tracing::info!(total_processed = self.total_processed, "request queue destroyed");
        self.slots.into_vec()
    }
}

/// Client side, one per connection to a server with a queue.
pub(crate) struct ClientQueue {
    server: ServerQueueAttrs,
    index: MemoryRegion,
    index_mem: MemHandle,
    index_cq: CqId,
    index_ep: EpId,
    req_cq: CqId,
    req_ep: EpId,
    unblock: MemoryRegion,
    unblock_mem: MemHandle,
    unblock_cq: CqId,
    last_claim: Option<u64>,
}

impl ClientQueue {
    pub fn create(ctx: &OpContext<'_>, server: &Identity, attrs: ServerQueueAttrs) -> Result<Self> {
        let depth = ctx.config.cq_depth;
        let index = MemoryRegion::zeroed(8)?;
        let unblock = MemoryRegion::zeroed(8)?;

        let mut staged = Rollback::new(ctx.nic);
        let index_mem = staged.register(&index, None)?;
        let index_cq = staged.cq(depth)?;
        let index_ep = staged.ep(index_cq)?;
        ctx.nic
            .bind_ep(index_ep, server.placement.local_addr, server.instance)?;
        let req_cq = staged.cq(depth)?;
        let req_ep = staged.ep(req_cq)?;
        ctx.nic
            .bind_ep(req_ep, server.placement.local_addr, server.instance)?;
        let unblock_cq = staged.cq(depth)?;
        let unblock_mem = staged.register(&unblock, Some(unblock_cq))?;
        staged.disarm();

        Ok(Self {
            server: attrs,
            index,
            index_mem,
            index_cq,
            index_ep,
            req_cq,
            req_ep,
            unblock,
            unblock_mem,
            unblock_cq,
            last_claim: None,
        })
    }

    pub fn attrs(&self) -> ClientQueueAttrs {
        ClientQueueAttrs {
            unblock_addr: self.unblock.base(),
            unblock_mem: self.unblock_mem,
        }
    }

    fn fetch_add(&self, ctx: &OpContext<'_>) -> Result<u64> {
        let desc = PostDescriptor::atomic(
            PostOp::FetchAdd(1),
            (self.index.base(), self.index_mem),
            (self.server.req_index_addr, self.server.req_index_mem),
            ctx.delivery(),
        );
        ctx.nic.post(self.index_ep, &desc)?;
        poll_until(ctx, self.index_cq, ctx.op_deadline(), "slot claim")?;
        self.index.read_u64(0).ok_or_else(|| TransportError::Completion {
            cq: self.index_cq.0,
            detail: "slot claim result unreadable".to_string(),
        })
    }

    /// Claims a slot, blocking on the unblock queue while the ring is full.
    ///
    /// A claim below `slot_count` is taken as free without consulting the
    /// server. That is only true while fewer than half the ring's slots are
    /// live across all clients; see the module docs.
    pub fn claim_slot(&mut self, ctx: &OpContext<'_>) -> Result<u64> {
        let mut unblocked = false;
        loop {
            let claimed = self.fetch_add(ctx)?;
            if claimed >= self.server.req_count {
                ctx.metrics.inc_slot_overflows();
                tracing::debug!(claimed, slot_count = self.server.req_count, "request queue full");
                let event = poll_until(ctx, self.unblock_cq, ctx.op_deadline(), "unblock")?;
                ctx.metrics.inc_unblocks_received();
                while self.drain_unblock(ctx)? {}
                tracing::debug!(server_processed = event.payload, "unblocked");
                unblocked = true;
                continue;
            }

            if let Some(last) = self.last_claim {
                if claimed < last && !unblocked {
                    let absorb = Deadline::after(ctx.config.poll_interval());
                    if poll_slice(ctx, self.unblock_cq, &absorb)?.is_some() {
                        ctx.metrics.inc_unblocks_received();
                    }
                }
            }
            self.last_claim = Some(claimed);
            return Ok(claimed);
        }
    }

    fn drain_unblock(&self, ctx: &OpContext<'_>) -> Result<bool> {
        match ctx.nic.try_event(self.unblock_cq)? {
            Some(_) => {
                ctx.metrics.inc_unblocks_received();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn release(self, nic: &dyn NicDriver) {
        for ep in [self.index_ep, self.req_ep] {
            let _ = nic.destroy_ep(ep);
        }
        for mem in [self.index_mem, self.unblock_mem] {
            let _ = nic.deregister(mem);
        }
        for cq in [self.index_cq, self.req_cq, self.unblock_cq] {
            let _ = nic.destroy_cq(cq);
        }
    }
}

/// Sends the whole of `handle` as one request. Returns the claimed slot.
pub(crate) fn send_request(
    ctx: &OpContext<'_>,
    queue: &mut ClientQueue,
    handle: &mut MemoryHandle,
) -> Result<u64> {
    let len = handle.len() as u64;
    if len > queue.server.req_size {
        return Err(TransportError::invalid(format!(
            "request of {len} bytes exceeds the {}-byte slot",
            queue.server.req_size
        )));
    }
    let mut next = handle.rs;
    next.begin(OpCode::Send)?;

    let slot = queue.claim_slot(ctx)?;
    let offset = slot * queue.server.req_size;
    let payload = PostDescriptor::put(
        (handle.base(), handle.mem),
        (queue.server.req_buffer_addr + offset, queue.server.req_mem),
        len,
        ctx.delivery(),
    );
    ctx.nic.post(queue.req_ep, &payload)?;
    poll_until(ctx, queue.req_cq, ctx.op_deadline(), "request payload")?;

    let wc = WorkCompletion {
        byte_len: len,
        byte_offset: offset,
        dest_offset: offset,
        ..WorkCompletion::new(OpCode::Send, ctx.instance())
    };
    let ch = handle.channels()?;
    wc.write_into(&ch.wc_region, 0)?;
    ctx.nic.set_event_data(ch.wc_ep, slot as u32, slot as u32)?;
    let record = PostDescriptor::put(
        (ch.wc_region.base(), ch.wc_mem),
        (
            queue.server.wc_buffer_addr + slot * WC_RECORD_LEN as u64,
            queue.server.wc_mem,
        ),
        WC_RECORD_LEN as u64,
        ctx.delivery(),
    )
    .with_remote_event();
    ctx.nic.post(ch.wc_ep, &record)?;

    handle.rs = next;
    handle.wc = wc;
    handle.status = None;
    ctx.metrics.inc_requests_sent();
    ctx.metrics.add_bytes_put(len);
    tracing::debug!(handle = handle.id, slot, len, "request sent");
    Ok(slot)
}
