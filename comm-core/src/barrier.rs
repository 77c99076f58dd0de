//! Collective barrier. `spec.md` §4.8: a K-ary tree split-phase barrier run
//! over the AM channel once the handler threads are up, with the bootstrap
//! OOB transport (`comm-oob`) kept around as the fallback for use before
//! they exist (`init.rs`'s own startup barrier).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::am::protocol::{encode, Request, RequestKind};
use crate::context::CommSubstrate;
use crate::types::NodeId;

/// Children per internal node. `spec.md` §4.8 doesn't mandate a specific
/// fanout; 64 keeps tree depth shallow (log64 n) without making any single
/// node's arrival fan-in pathologically wide.
const FANOUT: usize = 64;

/// Per-tag arrival/release tracking, looked up by `am::handler`'s
/// `BarrierArrive`/`BarrierRelease` dispatch and by [`barrier`] itself.
pub struct BarrierState {
    arrived: AtomicUsize,
    released: AtomicBool,
}

impl BarrierState {
    pub(crate) fn new() -> Arc<BarrierState> {
        Arc::new(BarrierState { arrived: AtomicUsize::new(0), released: AtomicBool::new(false) })
    }

    pub(crate) fn mark_child_arrived(&self) {
        self.arrived.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }
}

fn parent(rank: NodeId) -> Option<NodeId> {
    if rank == 0 {
        None
    } else {
        Some((rank - 1) / FANOUT)
    }
}

fn children(rank: NodeId, node_count: usize) -> Vec<NodeId> {
    ((rank * FANOUT + 1)..node_count.min(rank * FANOUT + FANOUT + 1)).collect()
}

fn state_for(ctx: &CommSubstrate, tag: u64) -> Arc<BarrierState> {
    ctx.barrier_state.entry(tag).or_insert_with(BarrierState::new).clone()
}

/// `spec.md` §4.8's "barrier": every node calls this with the same `tag`
/// (a caller-chosen identifier distinguishing concurrent/successive
/// barriers) and none return until all of them have called it.
pub fn barrier(ctx: &CommSubstrate, tag: u64) -> Result<()> {
    ctx.metrics.record_barrier();
    let n = ctx.node_count();
    if n <= 1 {
        return Ok(());
    }
    let rank = ctx.self_rank();
    let state = state_for(ctx, tag);
    let kids = children(rank, n);

    while state.arrived.load(Ordering::Acquire) < kids.len() {
        ctx.tasking.task_yield();
    }

    if let Some(p) = parent(rank) {
        let req = Request { initiator: rank, done: None, kind: RequestKind::BarrierArrive { tag } };
        send(ctx, p, &req)?;
        while !state.released.load(Ordering::Acquire) {
            ctx.tasking.task_yield();
        }
    } else {
        state.mark_released();
    }

    for child in kids {
        let req = Request { initiator: rank, done: None, kind: RequestKind::BarrierRelease { tag } };
        send(ctx, child, &req)?;
    }

    ctx.barrier_state.remove(&tag);
    Ok(())
}

fn send(ctx: &CommSubstrate, peer: NodeId, req: &Request) -> Result<()> {
    let bytes = encode(req);
    if bytes.len() <= ctx.fabric.inject_size() {
        ctx.fabric.inject_send(peer, &bytes)
    } else {
        ctx.fabric.send(peer, &bytes)
    }
}

/// Passthrough to the bootstrap OOB transport's own barrier, for callers
/// before the AM handler threads exist to service the tree barrier above
/// (`init.rs`'s startup sequence) or as a fallback once `comm-oob`'s
/// teardown ordering requires one last synchronization point.
pub fn barrier_oob(ctx: &CommSubstrate) -> Result<()> {
    ctx.oob.barrier()
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
    use std::sync::atomic::AtomicBool as StdAtomicBool;

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
                    am_handlers_exit: StdAtomicBool::new(false),
                    shutdown_requested: StdAtomicBool::new(false),
                    exec_table: Vec::new(),
                    oob: Arc::new(oob),
                    barrier_state: DashMap::new(),
                    metrics: crate::metrics::Metrics::new(),
                }
            })
            .collect()
    }

    #[test]
    fn parent_and_children_agree_on_a_three_level_tree() {
        assert_eq!(parent(0), None);
        assert_eq!(parent(1), Some(0));
        assert_eq!(parent(FANOUT), Some(0));
        assert_eq!(parent(FANOUT + 1), Some(1));
        assert_eq!(children(0, FANOUT + 1), (1..=FANOUT).collect::<Vec<_>>());
        assert!(children(FANOUT, FANOUT + 1).is_empty());
    }

    #[test]
    fn single_node_job_never_touches_the_fabric() {
        let ctxs = build(1);
        barrier(&ctxs[0], 7).unwrap();
    }

    #[test]
    fn three_nodes_all_release_through_the_am_tree() {
        let ctxs: Vec<Arc<CommSubstrate>> = build(3).into_iter().map(Arc::new).collect();
        let handles: Vec<_> = ctxs
            .iter()
            .cloned()
            .map(|ctx| {
                std::thread::spawn(move || {
                    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                    while std::time::Instant::now() < deadline {
                        if let Some((from, payload)) = ctx.fabric.recv_am(std::time::Duration::from_millis(20)) {
                            crate::am::handler::dispatch_one(&ctx, from, &payload).unwrap();
                        }
                        if ctx.barrier_state.get(&1).map(|s| s.released.load(Ordering::Acquire)).unwrap_or(false) {
                            break;
                        }
                    }
                })
            })
            .collect();

        let callers: Vec<_> = ctxs
            .iter()
            .cloned()
            .map(|ctx| std::thread::spawn(move || barrier(&ctx, 1).unwrap()))
            .collect();
        for c in callers {
            c.join().unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn barrier_oob_passthrough_round_trips_on_a_solo_job() {
        let ctxs = build(1);
        barrier_oob(&ctxs[0]).unwrap();
    }
}
