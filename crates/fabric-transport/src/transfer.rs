//! One-sided put/get and the acknowledgment write that follows them.

use crate::completion::OpContext;
use crate::error::{Result, TransportError};
use crate::memory::{MemoryHandle, RemoteBuffer, SideChannel};
use crate::nic::PostDescriptor;
use crate::wc::{OpCode, WorkCompletion, WC_RECORD_LEN};

fn check_range(what: &str, offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(TransportError::invalid(format!(
            "{what} range {offset}+{len} exceeds {size} bytes"
        ))),
    }
}

/// `base + offset`, rejecting descriptors whose address wraps.
fn target_addr(what: &str, base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset).ok_or_else(|| {
        TransportError::invalid(format!("{what} address {base:#x}+{offset} overflows"))
    })
}

fn check_remote(handle: &MemoryHandle, remote: &RemoteBuffer) -> Result<SideChannel> {
    let ch = handle.channels()?;
    if remote.instance != ch.peer.instance {
        return Err(TransportError::invalid(format!(
            "remote buffer belongs to instance {}, handle is bound to {}",
            remote.instance, ch.peer.instance
        )));
    }
    remote
        .side_channel
        .ok_or_else(|| TransportError::invalid("remote buffer has no side channel"))
}

/// Writes `len` bytes from `src` at `src_offset` into `dest` at `dest_offset`.
pub(crate) fn put(
    ctx: &OpContext<'_>,
    src: &mut MemoryHandle,
    src_offset: u64,
    len: u64,
    dest: &RemoteBuffer,
    dest_offset: u64,
) -> Result<()> {
    if len == 0 {
        return Err(TransportError::invalid("put of zero bytes"));
    }
    check_range("source", src_offset, len, src.len() as u64)?;
    check_range("destination", dest_offset, len, dest.size)?;
    let side = check_remote(src, dest)?;
    let mut next = src.rs;
    next.begin(OpCode::PutInitiator)?;

    let local = target_addr("source", src.base(), src_offset)?;
    let remote = target_addr("destination", dest.addr, dest_offset)?;
    let ch = src.channels()?;
    let desc = PostDescriptor::put(
        (local, src.mem),
        (remote, dest.mem),
        len,
        ctx.delivery(),
    )
    .with_remote_event();
    ctx.nic.post(ch.ep, &desc)?;

    src.rs = next;
    src.status = None;
    src.wc = WorkCompletion {
        byte_len: len,
        byte_offset: dest_offset,
        src_offset,
        dest_offset,
        ..WorkCompletion::new(OpCode::PutTarget, ctx.instance())
    };
    if let Some(ch) = src.channels.as_mut() {
        ch.ack_target = Some(side);
    }
    ctx.metrics.add_bytes_put(len);
    tracing::trace!(handle = src.id, len, src_offset, dest_offset, "put posted");
    Ok(())
}

/// Reads `len` bytes of `src` at `src_offset` into `dest` at `dest_offset`.
pub(crate) fn get(
    ctx: &OpContext<'_>,
    src: &RemoteBuffer,
    src_offset: u64,
    len: u64,
    dest: &mut MemoryHandle,
    dest_offset: u64,
) -> Result<()> {
    if len == 0 {
        return Err(TransportError::invalid("get of zero bytes"));
    }
    check_range("source", src_offset, len, src.size)?;
    check_range("destination", dest_offset, len, dest.len() as u64)?;
    let side = check_remote(dest, src)?;
    let mut next = dest.rs;
    next.begin(OpCode::GetInitiator)?;

    let local = target_addr("destination", dest.base(), dest_offset)?;
    let remote = target_addr("source", src.addr, src_offset)?;
    let ch = dest.channels()?;
    let desc = PostDescriptor::get(
        (local, dest.mem),
        (remote, src.mem),
        len,
        ctx.delivery(),
    )
    .with_remote_event();
    ctx.nic.post(ch.ep, &desc)?;

    dest.rs = next;
    dest.status = None;
    dest.wc = WorkCompletion {
        byte_len: len,
        byte_offset: src_offset,
        src_offset,
        dest_offset,
        ..WorkCompletion::new(OpCode::GetTarget, ctx.instance())
    };
    if let Some(ch) = dest.channels.as_mut() {
        ch.ack_target = Some(side);
    }
    ctx.metrics.add_bytes_got(len);
    tracing::trace!(handle = dest.id, len, src_offset, dest_offset, "get posted");
    Ok(())
}

/// Writes the handle's work-completion record into the peer's side channel.
pub(crate) fn post_ack(ctx: &OpContext<'_>, handle: &MemoryHandle) -> Result<()> {
    let ch = handle.channels()?;
    let target = ch
        .ack_target
        .ok_or_else(|| TransportError::invalid("no side channel to acknowledge to"))?;
    handle.wc.write_into(&ch.wc_region, 0)?;
    let desc = PostDescriptor::put(
        (ch.wc_region.base(), ch.wc_mem),
        (target.addr, target.mem),
        WC_RECORD_LEN as u64,
        ctx.delivery(),
    )
    .with_remote_event();
    ctx.nic.post(ch.wc_ep, &desc)?;
    tracing::trace!(handle = handle.id, "acknowledgment posted");
    Ok(())
}
