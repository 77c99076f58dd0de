//! `CommSubstrate`: the explicit context object `spec.md` §9's DESIGN NOTES
//! call for in place of the reference implementation's process-wide
//! globals (`ofi_info`, `tciTab`, `memTab`, `ofi_av`, `bar_info`,
//! `am_handlers_exit`). Built once by `init.rs`, then shared (behind an
//! `Arc`) by every worker thread and the AM handler thread.

use std::sync::Arc;

use comm_oob::Oob;
use dashmap::DashMap;

use crate::barrier::BarrierState;
use crate::bounce::BouncePool;
use crate::fabric::Fabric;
use crate::metrics::Metrics;
use crate::mr::MrTable;
use crate::task::Tasking;
use crate::tcx::TcxTable;
use crate::types::NodeId;

/// How many contexts in the worker sub-range (`tcx.rs`'s `[0, W)`), how
/// large a bounce slot is, and how many slots the pool carries — the
/// knobs `init.rs` derives from capability probing and `COMM_CONCURRENCY`.
pub struct SubstrateLimits {
    pub worker_tcx: usize,
    pub am_handler_tcx: usize,
    pub bounce_slot_size: usize,
    pub bounce_slot_count: usize,
}

/// A registered `executeOn` target. `spec.md` §4.7 identifies the remote
/// function by an id the caller already agreed on with every other node;
/// here that's simply every node building `exec_table` with the same
/// functions in the same order at `init.rs` time, the same convention
/// real PGAS runtimes use for RPC-by-function-index.
pub type ExecFn = fn(&CommSubstrate, &[u8]);

/// Everything an operation (`rdma.rs`, `amo.rs`, `am/*`, `barrier.rs`)
/// needs to run, gathered in one place. `mr`/`tcx`/`bounce` are read-only
/// after `post_mem_init` (`spec.md` §5), so no interior mutability is
/// needed beyond what each already carries internally (`Tcx`'s atomics,
/// `BouncePool`'s atomics).
pub struct CommSubstrate {
    pub fabric: Arc<dyn Fabric>,
    pub tasking: Arc<dyn Tasking>,
    pub mr: MrTable,
    pub tcx: TcxTable,
    pub bounce: BouncePool,
    /// Flipped locally by `shutdown.rs` on every node, strictly after that
    /// node's shutdown barrier call has returned — never by the AM handler
    /// itself, so the handler threads stay alive to service the barrier's
    /// own traffic. `spec.md` §8.6: "no node exits before the barrier."
    pub am_handlers_exit: std::sync::atomic::AtomicBool,
    /// Set by the `Shutdown` AM handler on receipt (`am/handler.rs`); only
    /// node 0 sets its own directly, since it originates the fan-out.
    /// `shutdown.rs` waits on this before calling the shutdown barrier.
    pub shutdown_requested: std::sync::atomic::AtomicBool,
    pub exec_table: Vec<ExecFn>,
    /// Bootstrap transport, kept around past `post_mem_init` for
    /// `barrier.rs`'s OOB fallback and `init.rs`'s own startup barrier
    /// (before the AM handler threads exist to run the tree barrier).
    pub oob: Arc<dyn Oob>,
    /// Per-tag arrival/release tracking for the AM tree barrier
    /// (`barrier.rs`), populated by `am::handler`'s `BarrierArrive`/
    /// `BarrierRelease` dispatch.
    pub barrier_state: DashMap<u64, Arc<BarrierState>>,
    pub metrics: Metrics,
}

impl CommSubstrate {
    pub fn node_count(&self) -> usize {
        self.fabric.node_count()
    }

    pub fn self_rank(&self) -> NodeId {
        self.fabric.self_rank()
    }
}
