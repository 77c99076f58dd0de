//! The public surface, `spec.md` §6: every operation a caller embeds
//! against, gathered behind one module so `init_job`/`shutdown` plus this
//! file are the only things a caller needs to import. Everything here is a
//! thin forward onto `rdma.rs`/`amo.rs`/`am::request`/`barrier.rs` — the
//! split exists because those modules are organized by mechanism
//! (one-sided RDMA, AMOs, AMs, collectives), while this one is organized by
//! the caller-facing contract `spec.md` §6 actually lists.

use anyhow::Result;

use crate::am::request;
use crate::amo;
use crate::barrier;
use crate::context::CommSubstrate;
use crate::heap::HeapRegion;
use crate::mcm;
use crate::rdma::{self, GetOp, PutOp};
use crate::types::{AtomicOp, AtomicType, AtomicValue, NodeId};

pub use crate::init::{init_job, Job};
pub use crate::shutdown::{shutdown, shutdown_or_force};

/// `spec.md` §6's `post_mem_init`: nothing left to do once `init_job` has
/// returned — MR exchange and handler/liveness startup already happened
/// there. Kept as a named call so embeddings that phase their startup the
/// way the reference runtime does (`init` then `post_mem_init` then
/// `post_task_init`) have a place to put it without restructuring
/// `init_job`.
pub fn post_mem_init(_ctx: &CommSubstrate) -> Result<()> {
    Ok(())
}

/// `spec.md` §6's `post_task_init`: per-task setup once the caller's own
/// task/thread is running. `ThreadTasking` initializes `TaskPrivate` lazily
/// on first access, so there is nothing to force here either; the call
/// exists for API parity with embeddings that need an explicit hook point.
pub fn post_task_init(_ctx: &CommSubstrate) -> Result<()> {
    Ok(())
}

/// `spec.md` §6's `pre_task_exit`: drains buffered unordered PUT/GET,
/// retires a deferred blocking `executeOn`'s done-flag, and forces
/// visibility of every pending PUT so a task never leaves without the MCM
/// guarantees `spec.md` §4.6 promises by the time it ends.
pub fn pre_task_exit(ctx: &CommSubstrate) -> Result<()> {
    rdma::unordered_task_fence(ctx)?;
    request::retire_delayed_done(ctx)?;
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, true)
}

// --- One-sided RDMA (spec.md §4.3) -----------------------------------

pub fn put(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    rdma::put(ctx, src, peer, dst_remote)
}

/// `put_nb`: the engine's own `put` never blocks past the point the local
/// source buffer is safe to reuse (the reference implementation's
/// non-blocking variant exists to let a provider-level async write skip
/// that wait); under `LoopbackFabric` every transfer already completes
/// synchronously, so this is the same call.
pub fn put_nb(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    rdma::put(ctx, src, peer, dst_remote)
}

pub fn get(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    rdma::get(ctx, dst, peer, src_remote)
}

pub fn get_nb(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    rdma::get(ctx, dst, peer, src_remote)
}

/// `put_strided`: `count` elements of `elem_size` bytes, each at
/// `local_stride`/`remote_stride` apart, expressed as a `put_v` batch over
/// chained contexts (`spec.md` §4.3's "strided" operations are defined as
/// sugar over the batched V-call, not a distinct wire primitive).
pub fn put_strided(
    ctx: &CommSubstrate,
    src: &[u8],
    elem_size: usize,
    local_stride: usize,
    peer: NodeId,
    dst_remote: u64,
    remote_stride: u64,
    count: usize,
) -> Result<()> {
    for batch_start in (0..count).step_by(rdma::MAX_CHAINED_LEN) {
        let batch_len = rdma::MAX_CHAINED_LEN.min(count - batch_start);
        let ops: Vec<PutOp> = (0..batch_len)
            .map(|i| {
                let idx = batch_start + i;
                PutOp {
                    peer,
                    dst_remote: dst_remote + idx as u64 * remote_stride,
                    src: &src[idx * local_stride..idx * local_stride + elem_size],
                }
            })
            .collect();
        rdma::put_v(ctx, &ops)?;
    }
    Ok(())
}

pub fn get_strided(
    ctx: &CommSubstrate,
    dst: &mut [u8],
    elem_size: usize,
    local_stride: usize,
    peer: NodeId,
    src_remote: u64,
    remote_stride: u64,
    count: usize,
) -> Result<()> {
    for batch_start in (0..count).step_by(rdma::MAX_CHAINED_LEN) {
        let batch_len = rdma::MAX_CHAINED_LEN.min(count - batch_start);
        let mut chunks: Vec<&mut [u8]> = dst.chunks_mut(local_stride).skip(batch_start).take(batch_len).collect();
        let mut ops: Vec<GetOp> = chunks
            .iter_mut()
            .enumerate()
            .map(|(i, chunk)| {
                let idx = batch_start + i;
                GetOp { peer, src_remote: src_remote + idx as u64 * remote_stride, dst: &mut chunk[..elem_size] }
            })
            .collect();
        rdma::get_v(ctx, &mut ops)?;
    }
    Ok(())
}

pub fn put_v(ctx: &CommSubstrate, ops: &[PutOp]) -> Result<()> {
    rdma::put_v(ctx, ops)
}

pub fn get_v(ctx: &CommSubstrate, ops: &mut [GetOp]) -> Result<()> {
    rdma::get_v(ctx, ops)
}

// --- Buffered (unordered) RDMA ----------------------------------------

pub fn put_unordered(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    rdma::put_unordered(ctx, src, peer, dst_remote)
}

/// # Safety
/// `dst` must stay valid and exclusively borrowed until the matching fence
/// runs — see `rdma::get_unordered`'s contract.
pub fn get_unordered(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    rdma::get_unordered(ctx, dst, peer, src_remote)
}

pub fn unordered_task_fence(ctx: &CommSubstrate) -> Result<()> {
    rdma::unordered_task_fence(ctx)
}

/// `getput_unordered_task_fence`: same drain, named the way `spec.md` §6
/// lists it for callers that buffer both directions and want one call
/// covering both.
pub fn getput_unordered_task_fence(ctx: &CommSubstrate) -> Result<()> {
    rdma::unordered_task_fence(ctx)
}

/// `atomic_unordered_task_fence`: forces visibility of every PUT the
/// calling task has issued, the same barrier a mutating network AMO
/// imposes on itself internally — exposed directly for a caller that wants
/// that ordering without also issuing an AMO.
pub fn atomic_unordered_task_fence(ctx: &CommSubstrate) -> Result<()> {
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)
}

// --- Atomics (spec.md §4.4/§4.5) --------------------------------------

pub fn atomic(ctx: &CommSubstrate, peer: NodeId, addr: u64, op: AtomicOp, ty: AtomicType, operand1: AtomicValue, operand2: AtomicValue) -> Result<AtomicValue> {
    amo::do_amo(ctx, peer, addr, op, ty, operand1, operand2)
}

pub fn atomic_nf_v(ctx: &CommSubstrate, peer: NodeId, addrs: &[u64], op: AtomicOp, ty: AtomicType, operand: AtomicValue) -> Result<()> {
    amo::amo_nf_v(ctx, peer, addrs, op, ty, operand)
}

// --- Active messages (spec.md §4.7) -----------------------------------

pub fn execute_on(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    request::execute_on(ctx, peer, fid, arg)
}

pub fn execute_on_nb(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    request::execute_on_nb(ctx, peer, fid, arg)
}

pub fn execute_on_fast(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    request::execute_on_fast(ctx, peer, fid, arg)
}

// --- Collectives (spec.md §4.8) ---------------------------------------

pub fn barrier(ctx: &CommSubstrate, tag: u64) -> Result<()> {
    barrier::barrier(ctx, tag)
}

/// `broadcast_global_vars_helper`: rank 0's value of a fixed-size global is
/// PUT to every other node's copy of the same offset, then a barrier
/// ensures no node reads its copy before the broadcast lands — the
/// reference runtime's bootstrap mechanism for replicating `static`/global
/// data that every node's image carries independently (`spec.md` §4.8
/// groups this with the barrier primitive rather than RDMA since its
/// contract is "every node sees the same value after it returns", not
/// "data moved to one address").
pub fn broadcast_global_vars_helper(ctx: &CommSubstrate, local_addr: u64, len: usize, tag: u64) -> Result<()> {
    if ctx.self_rank() != 0 {
        barrier::barrier(ctx, tag)?;
        return Ok(());
    }
    let payload = ctx.fabric.local_heap().slice(local_addr, len).to_vec();
    for peer in 1..ctx.node_count() {
        rdma::put(ctx, &payload, peer, local_addr)?;
    }
    barrier::barrier(ctx, tag)
}

/// `broadcast_private`: identical contract to
/// [`broadcast_global_vars_helper`] but for a buffer that doesn't live at
/// a shared offset in the registered heap at all (ordinary task-private
/// state), so there's no remote address to PUT into — this rides the
/// bootstrap OOB transport's own `bcast` instead of the RDMA/AM path.
pub fn broadcast_private(ctx: &CommSubstrate, buf: &mut [u8], root: NodeId) -> Result<()> {
    let received = ctx.oob.bcast(root, buf)?;
    buf.copy_from_slice(&received);
    Ok(())
}

// --- Heap / capability introspection (spec.md §6) ----------------------

/// `reg_mem_heap_info`: base/size of the caller's own registered heap, the
/// way `spec.md` §1 describes the allocator interface this crate consumes.
pub fn reg_mem_heap_info(ctx: &CommSubstrate) -> (u64, usize) {
    let heap: HeapRegion = ctx.fabric.local_heap();
    (0, heap.size())
}

/// `reg_mem_heap_page_size`: the registered heap's backing page size.
/// `LoopbackFabric` backs its heap with an ordinary heap allocation rather
/// than hugepages, so this reports the host's regular page size; a real
/// provider embedding would report whatever hugepage size the allocator
/// actually reserved.
pub fn reg_mem_heap_page_size() -> usize {
    4096
}

/// `addr_gettable`: whether `addr` (for `len` bytes) on `peer` is directly
/// RDMA-addressable from here right now, i.e. whether `rdma::put`/`get`
/// would take the native path rather than falling back to the AM proxy.
pub fn addr_gettable(ctx: &CommSubstrate, peer: NodeId, addr: u64, len: usize) -> bool {
    peer == ctx.self_rank() || ctx.mr.mr_get_key(peer, addr, len as u64).is_some()
}

pub fn get_max_threads(ctx: &CommSubstrate) -> usize {
    ctx.tasking.max_parallelism()
}

pub fn get_fixed_num_threads(ctx: &CommSubstrate) -> usize {
    ctx.tasking.fixed_thread_count()
}

// --- Completion polling (spec.md §6) ------------------------------------

/// `test_nb_complete`/`wait_nb_some`/`try_nb_some`: every operation above
/// already runs to completion synchronously under this engine (there is no
/// async fabric progress thread to poll), so these exist purely for API
/// parity with callers written against a provider where `_nb` calls return
/// before completion. `test_nb_complete` and `try_nb_some` always report
/// done; `wait_nb_some` returns immediately for the same reason.
pub fn test_nb_complete(_tag: crate::types::CompletionTag) -> bool {
    true
}

pub fn wait_nb_some(_tags: &[crate::types::CompletionTag]) {}

pub fn try_nb_some(_tags: &[crate::types::CompletionTag]) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips_through_the_facade() {
        let job = init_job(2, Vec::new()).unwrap();
        put(&job.ctxs[0], &[9, 9, 9, 9], 1, 64).unwrap();
        let mut buf = [0u8; 4];
        get(&job.ctxs[0], &mut buf, 1, 64).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
        shutdown(job).unwrap();
    }

    #[test]
    fn strided_put_lands_every_element_at_its_stride() {
        let job = init_job(2, Vec::new()).unwrap();
        let src: Vec<u8> = (0..16u8).collect();
        put_strided(&job.ctxs[0], &src, 4, 4, 1, 100, 8, 4).unwrap();
        for i in 0..4u64 {
            let mut got = [0u8; 4];
            get(&job.ctxs[0], &mut got, 1, 100 + i * 8).unwrap();
            assert_eq!(got, src[i as usize * 4..i as usize * 4 + 4]);
        }
        shutdown(job).unwrap();
    }

    #[test]
    fn atomic_facade_forwards_to_do_amo() {
        let job = init_job(1, Vec::new()).unwrap();
        atomic(&job.ctxs[0], 0, 200, AtomicOp::AtomicWrite, AtomicType::U32, AtomicValue::U32(11), AtomicValue::U32(0)).unwrap();
        let old = atomic(&job.ctxs[0], 0, 200, AtomicOp::AtomicRead, AtomicType::U32, AtomicValue::U32(0), AtomicValue::U32(0)).unwrap();
        assert_eq!(old, AtomicValue::U32(11));
        shutdown(job).unwrap();
    }

    #[test]
    fn addr_gettable_is_true_for_self_and_any_replicated_peer() {
        let job = init_job(2, Vec::new()).unwrap();
        assert!(addr_gettable(&job.ctxs[0], 0, 0, 8));
        assert!(addr_gettable(&job.ctxs[0], 1, 0, 8));
        shutdown(job).unwrap();
    }

    #[test]
    fn broadcast_global_vars_replicates_root_value_to_every_node() {
        let job = init_job(3, Vec::new()).unwrap();
        job.ctxs[0].fabric.local_heap().slice_mut(300, 4).copy_from_slice(&[7, 7, 7, 7]);
        let handles: Vec<_> = job
            .ctxs
            .iter()
            .cloned()
            .map(|ctx| std::thread::spawn(move || broadcast_global_vars_helper(&ctx, 300, 4, 42).unwrap()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for ctx in &job.ctxs {
            assert_eq!(ctx.fabric.local_heap().slice(300, 4), &[7, 7, 7, 7]);
        }
        shutdown(job).unwrap();
    }
}
