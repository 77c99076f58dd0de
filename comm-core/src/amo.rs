//! Remote atomic memory operations. `spec.md` §4.4/§4.5: an atomic-validity
//! cache gates whether the provider's native `fetch_atomic` verb is used, or
//! the engine falls back to an AM carrying the operation to the target's
//! CPU (`cpu_amo.rs`, serviced by `am::handler`).

use anyhow::Result;

use crate::am::request;
use crate::context::CommSubstrate;
use crate::cpu_amo;
use crate::mcm;
use crate::types::{AtomicOp, AtomicType, AtomicValue, NodeId};

/// `spec.md` §4.4: "doAMO". Single operand/result AMO against `peer`'s
/// heap at `addr`.
pub fn do_amo(
    ctx: &CommSubstrate,
    peer: NodeId,
    addr: u64,
    op: AtomicOp,
    ty: AtomicType,
    operand1: AtomicValue,
    operand2: AtomicValue,
) -> Result<AtomicValue> {
    request::retire_delayed_done(ctx)?;
    ctx.metrics.record_amo();

    if peer == ctx.self_rank() {
        let ptr = ctx.fabric.local_heap().word_ptr(addr, ty.size());
        // SAFETY: word_ptr validated bounds/alignment against our own heap.
        return Ok(unsafe { cpu_amo::apply(ptr, ty, op, operand1, operand2) });
    }

    if op.is_mutating() {
        mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    }

    let native = ctx.fabric.atomic_valid(ty, op);
    match native.then(|| ctx.mr.mr_get_key(peer, addr, ty.size() as u64)).flatten() {
        Some((remote_key, remote_offset)) => ctx.fabric.fetch_atomic(peer, remote_offset, remote_key, op, ty, operand1, operand2),
        None => {
            ctx.metrics.record_am_proxy_fallback();
            request::proxy_amo(ctx, peer, addr, op, ty, operand1, operand2)
        }
    }
}

/// `amo_nf_V`: a batch of non-fetching AMOs against the same peer, sharing
/// one CQ-capacity reservation the way `rdma::put_v` does (`spec.md` §4.4:
/// "batched non-fetching AMO"). Each element applies `op` at `addrs[i]`
/// with `operand`; the pre-op values are discarded.
pub fn amo_nf_v(ctx: &CommSubstrate, peer: NodeId, addrs: &[u64], op: AtomicOp, ty: AtomicType, operand: AtomicValue) -> Result<()> {
    if addrs.is_empty() {
        return Ok(());
    }
    request::retire_delayed_done(ctx)?;

    if peer == ctx.self_rank() {
        for &addr in addrs {
            let ptr = ctx.fabric.local_heap().word_ptr(addr, ty.size());
            // SAFETY: word_ptr validated bounds/alignment against our own heap.
            unsafe {
                cpu_amo::apply(ptr, ty, op, operand, AtomicValue::zero(ty));
            }
        }
        return Ok(());
    }

    if op.is_mutating() {
        mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    }

    let lease = ctx.tcx.tci_alloc(ctx.tasking.task_is_fixed_thread(), &*ctx.tasking);
    lease.reserve_cq_capacity(addrs.len(), ctx.fabric.cq_capacity(), &*ctx.tasking);
    let native = ctx.fabric.atomic_valid(ty, op);
    for &addr in addrs {
        match native.then(|| ctx.mr.mr_get_key(peer, addr, ty.size() as u64)).flatten() {
            Some((remote_key, remote_offset)) => {
                ctx.fabric.fetch_atomic(peer, remote_offset, remote_key, op, ty, operand, AtomicValue::zero(ty))?;
                lease.record_issue(false);
                lease.record_completion();
            }
            None => {
                request::proxy_amo(ctx, peer, addr, op, ty, operand, AtomicValue::zero(ty))?;
            }
        }
    }
    Ok(())
}
