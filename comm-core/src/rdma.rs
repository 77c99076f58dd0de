//! The RDMA engine: `ofi_put`/`ofi_get`, batched `put_V`/`get_V`, and the
//! buffered (unordered) PUT/GET paths. `spec.md` §4.3.

use anyhow::Result;

use crate::context::CommSubstrate;
use crate::mcm;
use crate::tcx::Tcx;
use crate::types::NodeId;

/// `spec.md` §4.3: batched PUT/GET fire once a task has accumulated this
/// many same-kind operations.
pub const MAX_CHAINED_LEN: usize = 64;
/// `spec.md` §4.3: the buffered-PUT/GET path only applies at or below this
/// size; larger transfers fall through to the immediate path.
pub const MAX_UNORDERED_TRANS_SZ: u64 = 1024;

/// One element of a `put_v` batch.
pub struct PutOp<'a> {
    pub peer: NodeId,
    pub dst_remote: u64,
    pub src: &'a [u8],
}

/// One element of a `get_v` batch.
pub struct GetOp<'a> {
    pub peer: NodeId,
    pub src_remote: u64,
    pub dst: &'a mut [u8],
}

/// A buffered-PUT slot: the source bytes are copied in immediately so the
/// caller may reuse its buffer before the flush actually issues the
/// network write (`spec.md` §4.3: "do_remote_put_buff... copies the
/// source bytes into a slot... so the caller may immediately reuse the
/// source").
pub struct BufferedPut {
    peer: NodeId,
    dst_remote: u64,
    bytes: Vec<u8>,
}

/// A buffered-GET slot. Unlike `BufferedPut`, the destination is the
/// caller's own buffer and is *not* copied — `spec.md` §4.3: "does not
/// copy source bytes (the target buffer is caller's; caller must not read
/// it until flush)". Storing the raw pointer is the only way to defer a
/// write into borrowed memory across an arbitrary number of intervening
/// `task_yield`s without threading a lifetime through `TaskPrivate`.
///
/// # Safety contract
/// The pointer is only ever dereferenced by `flush_get_buffer`, which the
/// caller must invoke (directly or via `unordered_task_fence`) before the
/// original buffer goes out of scope — exactly the contract `spec.md`
/// already places on the caller.
pub struct BufferedGet {
    peer: NodeId,
    src_remote: u64,
    dst: *mut u8,
    len: usize,
}

// SAFETY: `dst` is only read back by `flush_get_buffer` on the same task
// that queued it, under the caller contract documented above.
unsafe impl Send for BufferedGet {}

fn resolve_and_issue_put(ctx: &CommSubstrate, tcx: &Tcx, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    let max = ctx.fabric.max_msg_size();
    if src.len() > max {
        let mut offset = 0u64;
        for chunk in src.chunks(max) {
            resolve_and_issue_put(ctx, tcx, chunk, peer, dst_remote + offset)?;
            offset += chunk.len() as u64;
        }
        return Ok(());
    }
    match ctx.mr.mr_get_key(peer, dst_remote, src.len() as u64) {
        Some((remote_key, remote_offset)) => put_direct(ctx, tcx, src, peer, remote_offset, remote_key),
        None => {
            ctx.metrics.record_am_proxy_fallback();
            crate::am::request::proxy_put(ctx, src, peer, dst_remote)
        }
    }
}

/// `ofi_put` step 3: pick a completion discipline given the provider's
/// ordering mode, `inject_size`, and whether this context is bound.
fn put_direct(ctx: &CommSubstrate, tcx: &Tcx, src: &[u8], peer: NodeId, remote_offset: u64, remote_key: u64) -> Result<()> {
    if ctx.fabric.delivery_complete() {
        ctx.fabric.write(peer, src, remote_offset, remote_key)?;
        tcx.record_issue(false);
        tcx.record_completion();
        return Ok(());
    }
    if tcx.is_bound() && src.len() <= ctx.fabric.inject_size() {
        ctx.fabric.inject_write(peer, src, remote_offset, remote_key)?;
        tcx.record_issue(true);
        mcm::note_injected_put(&*ctx.tasking, ctx.node_count(), peer);
        return Ok(());
    }
    ctx.fabric.write(peer, src, remote_offset, remote_key)?;
    tcx.record_issue(false);
    tcx.record_completion();
    mcm::dummy_get(&*ctx.fabric, &ctx.mr, peer)
}

fn resolve_and_issue_get(ctx: &CommSubstrate, tcx: &Tcx, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let max = ctx.fabric.max_msg_size();
    if dst.len() > max {
        let mut offset = 0u64;
        for chunk in dst.chunks_mut(max) {
            let len = chunk.len() as u64;
            resolve_and_issue_get(ctx, tcx, chunk, peer, src_remote + offset)?;
            offset += len;
        }
        return Ok(());
    }
    match ctx.mr.mr_get_key(peer, src_remote, dst.len() as u64) {
        Some((remote_key, remote_offset)) => {
            ctx.fabric.read(peer, dst, remote_offset, remote_key)?;
            tcx.record_issue(false);
            tcx.record_completion();
            if tcx.is_bound() {
                mcm::clear_pending_put(&*ctx.tasking, peer);
            }
            Ok(())
        }
        None => {
            ctx.metrics.record_am_proxy_fallback();
            crate::am::request::proxy_get(ctx, dst, peer, src_remote)
        }
    }
}

/// `ofi_put(src_local, peer, dst_remote, size)`. `size == 0` and
/// `peer == self` are boundary fast paths (`spec.md` §8).
pub fn put(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    if src.is_empty() {
        return Ok(());
    }
    ctx.metrics.record_put(src.len() as u64);
    if peer == ctx.self_rank() {
        ctx.fabric.local_heap().slice_mut(dst_remote, src.len()).copy_from_slice(src);
        return Ok(());
    }
    let lease = ctx.tcx.tci_alloc(ctx.tasking.task_is_fixed_thread(), &*ctx.tasking);
    resolve_and_issue_put(ctx, &lease, src, peer, dst_remote)
}

/// `ofi_get(dst_local, peer, src_remote, size)`.
pub fn get(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    ctx.metrics.record_get(dst.len() as u64);
    if peer == ctx.self_rank() {
        dst.copy_from_slice(ctx.fabric.local_heap().slice(src_remote, dst.len()));
        return Ok(());
    }
    let lease = ctx.tcx.tci_alloc(ctx.tasking.task_is_fixed_thread(), &*ctx.tasking);
    resolve_and_issue_get(ctx, &lease, dst, peer, src_remote)
}

/// `put_V`: one shared `Tcx` and one CQ-capacity reservation for the whole
/// batch, then visibility is forced once at the end over whatever
/// accumulated in the task's `put_bitmap` (`spec.md` §4.3).
pub fn put_v(ctx: &CommSubstrate, ops: &[PutOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    assert!(ops.len() <= MAX_CHAINED_LEN, "put_v batch of {} exceeds MAX_CHAINED_PUT_LEN", ops.len());
    let lease = ctx.tcx.tci_alloc(ctx.tasking.task_is_fixed_thread(), &*ctx.tasking);
    lease.reserve_cq_capacity(ops.len(), ctx.fabric.cq_capacity(), &*ctx.tasking);
    for op in ops {
        if op.peer == ctx.self_rank() {
            ctx.fabric.local_heap().slice_mut(op.dst_remote, op.src.len()).copy_from_slice(op.src);
            continue;
        }
        resolve_and_issue_put(ctx, &lease, op.src, op.peer, op.dst_remote)?;
    }
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)
}

/// `get_V`: every op in a batch is synchronous under `LoopbackFabric`, so
/// "wait for the group to drain" (`spec.md` §4.3) is already true by the
/// time the loop below returns.
pub fn get_v(ctx: &CommSubstrate, ops: &mut [GetOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    assert!(ops.len() <= MAX_CHAINED_LEN, "get_v batch of {} exceeds MAX_CHAINED_GET_LEN", ops.len());
    let lease = ctx.tcx.tci_alloc(ctx.tasking.task_is_fixed_thread(), &*ctx.tasking);
    lease.reserve_cq_capacity(ops.len(), ctx.fabric.cq_capacity(), &*ctx.tasking);
    for op in ops.iter_mut() {
        if op.peer == ctx.self_rank() {
            op.dst.copy_from_slice(ctx.fabric.local_heap().slice(op.src_remote, op.dst.len()));
            continue;
        }
        resolve_and_issue_get(ctx, &lease, op.dst, op.peer, op.src_remote)?;
    }
    Ok(())
}

/// `put_unordered` / `do_remote_put_buff`: buffers a small, MR-addressable
/// PUT instead of issuing it immediately; flushes automatically once
/// `MAX_CHAINED_LEN` slots accumulate.
pub fn put_unordered(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    let addressable = ctx.mr.mr_get_key(peer, dst_remote, src.len() as u64).is_some();
    if peer == ctx.self_rank() || src.len() as u64 > MAX_UNORDERED_TRANS_SZ || !addressable {
        return put(ctx, src, peer, dst_remote);
    }
    let should_flush = ctx.tasking.task_private_slot(&mut |tp| {
        tp.put_buf.push(BufferedPut { peer, dst_remote, bytes: src.to_vec() });
        tp.put_buf.len() >= MAX_CHAINED_LEN
    });
    if should_flush {
        flush_put_buffer(ctx)?;
    }
    Ok(())
}

/// `get_unordered` / `do_remote_get_buff`.
///
/// # Safety
/// `dst` must stay valid and exclusively borrowed by the caller until
/// `flush_get_buffer` (or `unordered_task_fence`) runs.
pub fn get_unordered(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    let addressable = ctx.mr.mr_get_key(peer, src_remote, dst.len() as u64).is_some();
    if peer == ctx.self_rank() || dst.len() as u64 > MAX_UNORDERED_TRANS_SZ || !addressable {
        return get(ctx, dst, peer, src_remote);
    }
    let ptr = dst.as_mut_ptr();
    let len = dst.len();
    let should_flush = ctx.tasking.task_private_slot(&mut |tp| {
        tp.get_buf.push(BufferedGet { peer, src_remote, dst: ptr, len });
        tp.get_buf.len() >= MAX_CHAINED_LEN
    });
    if should_flush {
        flush_get_buffer(ctx)?;
    }
    Ok(())
}

pub fn flush_put_buffer(ctx: &CommSubstrate) -> Result<()> {
    let batch = ctx.tasking.task_private_slot(&mut |tp| std::mem::take(&mut tp.put_buf));
    if batch.is_empty() {
        return Ok(());
    }
    let ops: Vec<PutOp> = batch
        .iter()
        .map(|b| PutOp {
            peer: b.peer,
            dst_remote: b.dst_remote,
            src: &b.bytes[..],
        })
        .collect();
    put_v(ctx, &ops)
}

pub fn flush_get_buffer(ctx: &CommSubstrate) -> Result<()> {
    let batch = ctx.tasking.task_private_slot(&mut |tp| std::mem::take(&mut tp.get_buf));
    if batch.is_empty() {
        return Ok(());
    }
    let mut ops: Vec<GetOp> = batch
        .iter()
        .map(|b| GetOp {
            peer: b.peer,
            src_remote: b.src_remote,
            // SAFETY: see BufferedGet's contract.
            dst: unsafe { std::slice::from_raw_parts_mut(b.dst, b.len) },
        })
        .collect();
    get_v(ctx, &mut ops)
}

/// `unordered_task_fence` / `getput_unordered_task_fence` (`spec.md` §6):
/// drains both buffers. Called at task end and whenever a caller needs a
/// synchronous view of previously-buffered transfers.
pub fn unordered_task_fence(ctx: &CommSubstrate) -> Result<()> {
    flush_put_buffer(ctx)?;
    flush_get_buffer(ctx)
}
