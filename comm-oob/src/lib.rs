//! Out-of-band bootstrap transport.
//!
//! `comm-core` needs exactly four primitives before the fabric is up:
//! allgather, broadcast, and barrier over byte strings, plus init/fini of
//! whatever carries them. Real PMI-like bootstraps (PMIx, a job launcher's
//! control channel, ...) are out of scope for this workspace — this crate
//! only defines the contract (`Oob`) and ships two small implementations:
//! an in-process [`loopback::LoopbackOob`] for tests and the `N==1` fast
//! path, and a star-topology [`tcp::TcpOob`] for real multi-process runs.

pub mod loopback;
pub mod tcp;

use anyhow::Result;

/// Bootstrap transport consumed by `comm-core` during `post_mem_init`.
///
/// All ranks must call each method the same number of times, in the same
/// order — these are collective operations, not point-to-point messaging.
pub trait Oob: Send + Sync {
    /// This rank's index in `[0, size())`.
    fn rank(&self) -> usize;

    /// Total number of participants.
    fn size(&self) -> usize;

    /// Every rank contributes `local`; every rank receives all contributions
    /// indexed by rank.
    fn allgather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// `root` contributes `data`; every rank (including root) receives it.
    fn bcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>>;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;
}

/// Tears down transport-level resources (sockets, shared state). Separate
/// from `Drop` because the fabric may still need the transport for a final
/// barrier during shutdown (`spec.md` §4.10) and we want that ordering
/// explicit rather than implicit in a destructor.
pub trait OobFini {
    fn fini(self);
}
