//! Initiator side of the AM protocol: `executeOn` and the AM-proxy fallback
//! `rdma.rs`/`amo.rs` fall through to when a target address isn't resolvable
//! against a peer's replicated MR table. `spec.md` §4.7.

use anyhow::Result;

use crate::am::protocol::{self, Request, RequestKind, RemoteSlot};
use crate::context::CommSubstrate;
use crate::mcm;
use crate::types::{AtomicOp, AtomicType, AtomicValue, NodeId};

/// `spec.md` §4.7: argument bundles at or below this size travel inline in
/// the AM payload; larger ones are staged through a bounce slot and fetched
/// by the handler (`ExecOnLrg`).
pub const MAX_INLINE_ARG: u64 = 512;

fn spin_until_done(ctx: &CommSubstrate, offset: u64) {
    loop {
        if ctx.fabric.local_heap().slice(offset, 1)[0] != 0 {
            return;
        }
        ctx.tasking.task_yield();
    }
}

/// Retires a deferred blocking `executeOn`'s done-flag, if one is pending
/// (`spec.md` §4.6's "Delayed blocking AM"). Called at the start of every
/// other AM-triggering operation, and at task end, so the flag is never
/// left unretired indefinitely.
pub fn retire_delayed_done(ctx: &CommSubstrate) -> Result<()> {
    let pending = ctx.tasking.task_private_slot(&mut |tp| tp.am_done_offset.take());
    if let Some(offset) = pending {
        spin_until_done(ctx, offset);
        ctx.bounce.release_by_offset(offset);
    }
    Ok(())
}

/// Dispatches `req` to `peer`, choosing inject vs. a full send purely by
/// size (`spec.md` §4.3's inline threshold applies here too — there is no
/// separate AM inline limit in the fabric contract).
fn dispatch(ctx: &CommSubstrate, peer: NodeId, req: &Request) -> Result<()> {
    let bytes = protocol::encode(req);
    if bytes.len() <= ctx.fabric.inject_size() {
        ctx.fabric.inject_send(peer, &bytes)
    } else {
        ctx.fabric.send(peer, &bytes)
    }
}

/// Sends `kind` to `peer`. `blocking` allocates a done-flag slot and folds
/// it into the request; `defer` (only meaningful when `blocking`) stashes
/// the slot in `TaskPrivate` instead of spinning immediately, per the
/// delayed-done optimization — only valid when the caller has no fetched
/// result it needs right away.
fn send_request(ctx: &CommSubstrate, peer: NodeId, kind: RequestKind, blocking: bool, defer: bool) -> Result<()> {
    retire_delayed_done(ctx)?;

    if !blocking {
        let req = Request { initiator: ctx.self_rank(), done: None, kind };
        return dispatch(ctx, peer, &req);
    }

    let lease = ctx.bounce.acquire(&*ctx.tasking);
    lease.copy_in(&[0u8]);
    let offset = lease.offset();
    let (key, offset) = ctx
        .mr
        .own_remote_key(offset, 1)
        .expect("bounce pool lives inside the node's own registered heap");
    let slot = RemoteSlot { key, offset };
    let req = Request { initiator: ctx.self_rank(), done: Some(slot), kind };
    dispatch(ctx, peer, &req)?;

    if defer {
        std::mem::forget(lease);
        ctx.tasking.task_private_slot(&mut |tp| tp.am_done_offset = Some(offset));
    } else {
        spin_until_done(ctx, offset);
        drop(lease);
    }
    Ok(())
}

/// Services an `ofi_put` whose destination wasn't locally MR-resolvable:
/// stage `src` in our own heap, ask `peer` to GET it into its own
/// `dst_remote` (`spec.md` §4.3).
pub fn proxy_put(ctx: &CommSubstrate, src: &[u8], peer: NodeId, dst_remote: u64) -> Result<()> {
    let lease = ctx.bounce.acquire(&*ctx.tasking);
    lease.copy_in(src);
    let (key, offset) = ctx
        .mr
        .own_remote_key(lease.offset(), src.len() as u64)
        .expect("bounce pool lives inside the node's own registered heap");
    let kind = RequestKind::Get {
        payload: RemoteSlot { key, offset },
        target_local_addr: dst_remote,
        size: src.len() as u64,
    };
    send_request(ctx, peer, kind, true, false)
}

/// Services an `ofi_get` whose source wasn't locally MR-resolvable: ask
/// `peer` to PUT from its own `src_remote` into a bounce slot of ours, then
/// copy it out to the caller's buffer.
pub fn proxy_get(ctx: &CommSubstrate, dst: &mut [u8], peer: NodeId, src_remote: u64) -> Result<()> {
    let lease = ctx.bounce.acquire(&*ctx.tasking);
    lease.copy_in(&vec![0u8; dst.len()]);
    let (key, offset) = ctx
        .mr
        .own_remote_key(lease.offset(), dst.len() as u64)
        .expect("bounce pool lives inside the node's own registered heap");
    let kind = RequestKind::Put {
        payload: RemoteSlot { key, offset },
        target_local_addr: src_remote,
        size: dst.len() as u64,
    };
    send_request(ctx, peer, kind, true, false)?;
    lease.copy_out(dst);
    Ok(())
}

/// Services a remote AMO that the provider can't issue natively
/// (`spec.md` §4.4 step 3: "fall back to an active message carrying the
/// AMO; the handler runs CPU AMO"). Always blocking, since the caller needs
/// the pre-op value.
#[allow(clippy::too_many_arguments)]
pub fn proxy_amo(
    ctx: &CommSubstrate,
    peer: NodeId,
    target_local_addr: u64,
    op: AtomicOp,
    ty: AtomicType,
    operand1: AtomicValue,
    operand2: AtomicValue,
) -> Result<AtomicValue> {
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    let lease = ctx.bounce.acquire(&*ctx.tasking);
    let (key, offset) = ctx
        .mr
        .own_remote_key(lease.offset(), ty.size() as u64)
        .expect("bounce pool lives inside the node's own registered heap");
    let kind = RequestKind::Amo {
        op,
        ty,
        operand1,
        operand2,
        target_local_addr,
        result: Some(RemoteSlot { key, offset }),
    };
    send_request(ctx, peer, kind, true, false)?;
    let mut raw = vec![0u8; ty.size()];
    lease.copy_out(&mut raw);
    Ok(AtomicValue::from_le_bytes(ty, &raw))
}

/// `executeOn`: blocking, non-fetching remote RPC. `fast=false` on the wire
/// — the target's handler hands the call to `Tasking::task_start_moved`
/// rather than running it inline (`spec.md` §4.7). Uses the deferred-done
/// optimization since the caller only needs to know the call has completed
/// by the next MCM-significant event, not immediately (`spec.md` §4.6).
pub fn execute_on(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    ctx.metrics.record_execute_on();
    if peer == ctx.self_rank() {
        run_local(ctx, fid, arg);
        return Ok(());
    }
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    let kind = exec_kind(ctx, fid, arg, false)?;
    send_request(ctx, peer, kind, true, true)
}

/// `execute_on_nb`: fire-and-forget, no done-flag at all. Also `fast=false`
/// on the wire — a moved task, same as `execute_on`.
pub fn execute_on_nb(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    ctx.metrics.record_execute_on();
    if peer == ctx.self_rank() {
        run_local(ctx, fid, arg);
        return Ok(());
    }
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    let kind = exec_kind(ctx, fid, arg, false)?;
    send_request(ctx, peer, kind, false, false)
}

/// `execute_on_fast`: sets the wire `fast` bit, so the target's handler
/// runs the user function inline on the handler thread instead of moving
/// it to a new task (`spec.md` §4.7: "if flagged `fast`, run the user
/// function inline in the handler"). Reserved for tiny bodies — an inline
/// handler run blocks that thread from servicing any other AM traffic
/// until the function returns. Also spins immediately on the done-flag
/// rather than deferring, since a caller reaching for the inline path is
/// already on a latency-sensitive one.
pub fn execute_on_fast(ctx: &CommSubstrate, peer: NodeId, fid: u64, arg: &[u8]) -> Result<()> {
    ctx.metrics.record_execute_on();
    if peer == ctx.self_rank() {
        run_local(ctx, fid, arg);
        return Ok(());
    }
    mcm::wait_puts_vis_all_nodes(&*ctx.fabric, &ctx.mr, &*ctx.tasking, false)?;
    let kind = exec_kind(ctx, fid, arg, true)?;
    send_request(ctx, peer, kind, true, false)
}

fn run_local(ctx: &CommSubstrate, fid: u64, arg: &[u8]) {
    if let Some(f) = ctx.exec_table.get(fid as usize) {
        f(ctx, arg);
    } else {
        log::warn!("executeOn: no function registered at index {fid}");
    }
}

fn exec_kind(ctx: &CommSubstrate, fid: u64, arg: &[u8], fast: bool) -> Result<RequestKind> {
    if (arg.len() as u64) <= MAX_INLINE_ARG {
        return Ok(RequestKind::ExecOn { fid, fast, arg: arg.to_vec() });
    }
    let lease = ctx.bounce.acquire(&*ctx.tasking);
    lease.copy_in(arg);
    let (key, offset) = ctx
        .mr
        .own_remote_key(lease.offset(), arg.len() as u64)
        .expect("bounce pool lives inside the node's own registered heap");
    std::mem::forget(lease); // released when the handler's Free AM arrives
    Ok(RequestKind::ExecOnLrg {
        fid,
        arg_len: arg.len() as u64,
        payload: RemoteSlot { key, offset },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounce::BouncePool;
    use crate::fabric::{LoopbackConfig, LoopbackFabric};
    use crate::mr::{MrTable, RegistrationMode};
    use crate::task::ThreadTasking;
    use crate::tcx::TcxTable;
    use comm_oob::loopback::LoopbackOob;
    use dashmap::DashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn build(node_count: usize) -> Vec<CommSubstrate> {
        let fabrics = LoopbackFabric::new_job_with_config(
            node_count,
            LoopbackConfig { heap_size: 1 << 16, delivery_complete: true, ..LoopbackConfig::default() },
        );
        let mut mrs: Vec<MrTable> = (0..node_count).map(|_| MrTable::new(RegistrationMode::Scalable, node_count)).collect();
        for (rank, mr) in mrs.iter_mut().enumerate() {
            mr.register(&fabrics[rank], 0, 1 << 16).unwrap();
        }
        let all: Vec<_> = mrs.iter().map(|m| m.local_descs()).collect();
        for (rank, mr) in mrs.iter_mut().enumerate() {
            mr.install_replicas(rank, all.clone());
        }
        let oobs = LoopbackOob::new_job(node_count);
        fabrics
            .into_iter()
            .zip(mrs)
            .zip(oobs)
            .map(|((fabric, mr), oob)| {
                let heap = fabric.local_heap();
                CommSubstrate {
                    fabric: Arc::new(fabric),
                    tasking: Arc::new(ThreadTasking::new(1, 1)),
                    mr,
                    tcx: TcxTable::new(4, 1),
                    bounce: BouncePool::carve(heap, 4096, 64, 4),
                    am_handlers_exit: AtomicBool::new(false),
                    shutdown_requested: AtomicBool::new(false),
                    exec_table: Vec::new(),
                    oob: Arc::new(oob),
                    barrier_state: DashMap::new(),
                    metrics: crate::metrics::Metrics::new(),
                }
            })
            .collect()
    }

    #[test]
    fn proxy_put_stages_through_bounce_and_completes_after_peer_gets() {
        let ctxs = build(2);
        let src = [11u8, 22, 33, 44];
        let peer_ctx = &ctxs[1];
        let sent = std::thread::scope(|s| {
            let h = s.spawn(|| proxy_put(&ctxs[0], &src, 1, 100));
            // service the one GET request ourselves, standing in for the handler thread
            let (from, bytes) = peer_ctx.fabric.recv_am(Duration::from_secs(1)).unwrap();
            let req = protocol::decode(&bytes).unwrap();
            if let RequestKind::Get { payload, target_local_addr, size } = req.kind {
                let mut buf = vec![0u8; size as usize];
                peer_ctx.fabric.read(from, &mut buf, payload.offset, payload.key).unwrap();
                peer_ctx.fabric.local_heap().slice_mut(target_local_addr, size as usize).copy_from_slice(&buf);
            } else {
                panic!("expected a Get request");
            }
            peer_ctx.fabric.inject_write(from, &[1u8], req.done.unwrap().offset, req.done.unwrap().key).unwrap();
            h.join().unwrap()
        });
        sent.unwrap();
        assert_eq!(ctxs[1].fabric.local_heap().slice(100, 4), &src);
    }

    #[test]
    fn execute_on_local_peer_runs_inline_without_any_am() {
        fn bump(ctx: &CommSubstrate, arg: &[u8]) {
            ctx.fabric.local_heap().slice_mut(0, arg.len()).copy_from_slice(arg);
        }
        let mut ctxs = build(1);
        ctxs[0].exec_table.push(bump);
        execute_on(&ctxs[0], 0, 0, &[9, 9, 9]).unwrap();
        assert_eq!(ctxs[0].fabric.local_heap().slice(0, 3), &[9, 9, 9]);
    }

    #[test]
    fn deferred_done_is_retired_by_the_next_request() {
        let ctxs = build(2);
        // fabricate a pending delayed-done pointing at an already-satisfied slot.
        let lease = ctxs[0].bounce.acquire(&*ctxs[0].tasking);
        lease.copy_in(&[1u8]);
        let offset = lease.offset();
        std::mem::forget(lease);
        ctxs[0].tasking.task_private_slot(&mut |tp| tp.am_done_offset = Some(offset));
        retire_delayed_done(&ctxs[0]).unwrap();
        let still_pending = ctxs[0].tasking.task_private_slot(&mut |tp| tp.am_done_offset);
        assert!(still_pending.is_none());
    }
}
