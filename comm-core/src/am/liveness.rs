//! Self-tuning liveness probe. `SPEC_FULL.md` §4.7's addition: the
//! reference protocol only discovers a dead peer when some unrelated PUT or
//! AM actually targets it and the fabric returns a completion error, which
//! can be an arbitrarily long time after the peer actually died. A low-rate
//! `Nop` AM, rotating through every peer from node 0, bounds that detection
//! window without adding a dedicated heartbeat transport.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;

use crate::am::protocol::{encode, Request, RequestKind};
use crate::context::CommSubstrate;

/// Default interval between probes; "self-tuning" in the sense that
/// `init.rs` may shrink it under a larger job (more peers to rotate
/// through within the same total detection-latency budget) — `tick`
/// itself is interval-agnostic, `run` just owns the sleep.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// One probe: send a fire-and-forget `Nop` to the next peer in rotation.
/// `spec.md` §4.7 lists `Nop` as having no side effect beyond the AM round
/// trip, so failure here only ever comes from a dead/unreachable peer.
pub fn tick(ctx: &CommSubstrate, round: u64) -> Result<()> {
    let n = ctx.node_count();
    if n <= 1 {
        return Ok(());
    }
    let peer = ((ctx.self_rank() as u64 + 1 + round) % n as u64) as usize;
    let req = Request { initiator: ctx.self_rank(), done: None, kind: RequestKind::Nop };
    let bytes = encode(&req);
    if bytes.len() <= ctx.fabric.inject_size() {
        ctx.fabric.inject_send(peer, &bytes)
    } else {
        ctx.fabric.send(peer, &bytes)
    }
}

/// Runs until `ctx.am_handlers_exit` is observed set. Only node 0 starts
/// this loop (`init.rs`); every other node just answers the `Nop`s it
/// receives through the ordinary handler dispatch.
pub fn run(ctx: &CommSubstrate, interval: Duration) {
    let mut round = 0u64;
    while !ctx.am_handlers_exit.load(Ordering::Acquire) {
        if let Err(err) = tick(ctx, round) {
            log::warn!("liveness probe to round {round}'s target failed: {err:#}");
        }
        round = round.wrapping_add(1);
        std::thread::sleep(interval);
    }
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

    fn build(node_count: usize) -> Vec<CommSubstrate> {
        let fabrics = LoopbackFabric::new_job(node_count, 4096);
        let mut mrs: Vec<MrTable> = (0..node_count).map(|_| MrTable::new(RegistrationMode::Scalable, node_count)).collect();
        for (rank, mr) in mrs.iter_mut().enumerate() {
            mr.register(&fabrics[rank], 0, 4096).unwrap();
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
                    tcx: TcxTable::new(2, 1),
                    bounce: BouncePool::carve(heap, 1024, 64, 2),
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
    fn tick_rotates_through_every_other_peer() {
        let ctxs = build(3);
        tick(&ctxs[0], 0).unwrap();
        let (from, _) = ctxs[1].fabric.recv_am(Duration::from_secs(1)).unwrap();
        assert_eq!(from, 0);
        tick(&ctxs[0], 1).unwrap();
        let (from, _) = ctxs[2].fabric.recv_am(Duration::from_secs(1)).unwrap();
        assert_eq!(from, 0);
    }

    #[test]
    fn single_node_job_never_probes_itself() {
        let ctxs = build(1);
        tick(&ctxs[0], 0).unwrap();
        assert!(ctxs[0].fabric.recv_am(Duration::from_millis(20)).is_none());
    }
}
