//! Bootstrap: provider/capability selection, node discovery via the OOB
//! allgather, memory-region exchange, and spinning up the AM handler and
//! liveness threads. `spec.md` §4.9.
//!
//! There being exactly one provider (`LoopbackFabric`), "provider
//! selection" here reduces to logging the `COMM_OFI_*` hint overrides
//! `config.rs` parsed and honoring `do_delivery_complete`/`use_scalable_ep`
//! where `LoopbackFabric`/`MrTable` actually have a choice to make — on a
//! real fabric this is where `fi_getinfo`'s hint list would be built and
//! the returned `fi_info` chain walked.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use dashmap::DashMap;

use crate::am;
use crate::barrier;
use crate::bounce::BouncePool;
use crate::config::Config;
use crate::context::{CommSubstrate, ExecFn, SubstrateLimits};
use crate::fabric::{LoopbackConfig, LoopbackFabric};
use crate::mcm::ORDER_DUMMY_SIZE;
use crate::metrics::Metrics;
use crate::mr::{MrTable, RegistrationMode};
use crate::task::ThreadTasking;
use crate::tcx::TcxTable;

/// Per-node heap size for the simulated job `commtest` and the integration
/// tests run against. A real deployment would size this from the
/// provider's reported max registerable region instead of a constant.
pub const DEFAULT_HEAP_SIZE: usize = 1 << 24;
pub const DEFAULT_BOUNCE_SLOT_SIZE: usize = 4096;
pub const DEFAULT_BOUNCE_SLOT_COUNT: usize = 16;

pub fn default_limits(cfg: &Config) -> SubstrateLimits {
    SubstrateLimits {
        worker_tcx: cfg.concurrency.unwrap_or(64),
        am_handler_tcx: 2,
        bounce_slot_size: DEFAULT_BOUNCE_SLOT_SIZE,
        bounce_slot_count: DEFAULT_BOUNCE_SLOT_COUNT,
    }
}

/// A running job: every node's substrate plus the background threads
/// servicing it. `shutdown.rs` consumes this to tear everything down.
pub struct Job {
    pub ctxs: Vec<Arc<CommSubstrate>>,
    pub(crate) handler_threads: Vec<Vec<JoinHandle<()>>>,
    pub(crate) liveness_thread: Option<JoinHandle<()>>,
}

/// `spec.md` §4.9: provider/capability selection, node discovery, and MR
/// exchange, then handler/liveness threads are brought up so the job is
/// ready to serve `executeOn`/AMO/barrier traffic. Every node registers the
/// same `exec_table` in the same order — the RPC-by-function-index
/// convention `context.rs`'s `ExecFn` doc comment describes.
pub fn init_job(node_count: usize, exec_table: Vec<ExecFn>) -> Result<Job> {
    let cfg = Config::load();
    cfg.init_logging();
    let limits = default_limits(&cfg);

    let fabrics = LoopbackFabric::new_job_with_config(
        node_count,
        LoopbackConfig { delivery_complete: cfg.do_delivery_complete, heap_size: DEFAULT_HEAP_SIZE, ..LoopbackConfig::default() },
    );
    if !cfg.hints.is_empty() {
        log::debug!("ignoring provider hint overrides on the loopback fabric (only one provider exists): {:?}", cfg.hints);
    }

    let registration_mode = if cfg.use_scalable_ep { RegistrationMode::Scalable } else { RegistrationMode::Basic };
    let mut mrs: Vec<MrTable> = (0..node_count).map(|_| MrTable::new(registration_mode, node_count)).collect();
    for (rank, mr) in mrs.iter_mut().enumerate() {
        // `spec.md` §7: MR registration failure has no user-visible error
        // channel — it's a fatal setup error, not a recoverable `Result`.
        crate::ofi_chk!(mr.register(&fabrics[rank], 0, DEFAULT_HEAP_SIZE as u64), "MR registration");
    }
    let local_descs: Vec<_> = mrs.iter().map(|m| m.local_descs()).collect();
    for (rank, mr) in mrs.iter_mut().enumerate() {
        mr.install_replicas(rank, local_descs.clone());
    }

    let oobs = comm_oob::loopback::LoopbackOob::new_job(node_count);

    let ctxs: Vec<Arc<CommSubstrate>> = fabrics
        .into_iter()
        .zip(mrs)
        .zip(oobs)
        .map(|((fabric, mr), oob)| {
            let heap = fabric.local_heap();
            Arc::new(CommSubstrate {
                fabric: Arc::new(fabric),
                tasking: Arc::new(ThreadTasking::new(limits.worker_tcx, cfg.concurrency.unwrap_or(limits.worker_tcx))),
                mr,
                tcx: TcxTable::new(limits.worker_tcx, limits.am_handler_tcx),
                bounce: BouncePool::carve(heap, ORDER_DUMMY_SIZE, limits.bounce_slot_size, limits.bounce_slot_count),
                am_handlers_exit: std::sync::atomic::AtomicBool::new(false),
                shutdown_requested: std::sync::atomic::AtomicBool::new(false),
                exec_table: exec_table.clone(),
                oob: Arc::new(oob),
                barrier_state: DashMap::new(),
                metrics: Metrics::new(),
            })
        })
        .collect();

    // The tree barrier in `barrier.rs` needs AM handler threads to service
    // it; they don't exist yet, so this startup synchronization point goes
    // over the bootstrap OOB transport instead (`spec.md` §4.9: a node must
    // not begin serving AM traffic until every node has installed its
    // peers' MR replicas).
    for ctx in &ctxs {
        // Same §7 fatal-setup contract as MR registration above: a node
        // that can't even clear the startup rendezvous has nothing
        // recoverable to hand back to its caller.
        crate::ofi_chk!(barrier::barrier_oob(ctx), "startup OOB barrier");
    }

    let handler_threads: Vec<Vec<JoinHandle<()>>> = ctxs
        .iter()
        .map(|ctx| {
            (0..limits.am_handler_tcx)
                .map(|handler_index| {
                    let ctx = ctx.clone();
                    std::thread::spawn(move || am::handler::run(&ctx, handler_index))
                })
                .collect()
        })
        .collect();

    // Only node 0 probes; every other node just answers whatever `Nop`s
    // arrive through the ordinary handler dispatch (`am/liveness.rs`).
    let liveness_thread = ctxs.first().map(|ctx| {
        let ctx = ctx.clone();
        std::thread::spawn(move || am::liveness::run(&ctx, am::liveness::DEFAULT_INTERVAL))
    });

    Ok(Job { ctxs, handler_threads, liveness_thread })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_job_brings_up_every_node_with_working_am_traffic() {
        let job = init_job(2, Vec::new()).unwrap();
        crate::am::request::execute_on_nb(&job.ctxs[0], 1, 0, &[]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        crate::shutdown::shutdown(job).unwrap();
    }

    #[test]
    fn single_node_job_skips_the_oob_barrier_without_hanging() {
        let job = init_job(1, Vec::new()).unwrap();
        crate::shutdown::shutdown(job).unwrap();
    }
}
