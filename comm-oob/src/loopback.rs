//! In-process OOB transport: every "node" is an OS thread sharing a [`Hub`].
//!
//! Used by `comm-core`'s own test suite (which simulates a job of N nodes as
//! N threads in one process) and by the `N==1` degenerate path, where
//! bootstrap is trivially a no-op over a single rank.

use std::sync::{Arc, Condvar, Mutex};

use anyhow::{bail, Result};

use crate::Oob;

/// Shared rendezvous point for one job's worth of loopback ranks.
///
/// Each collective call is a generation-barrier: every rank deposits its
/// contribution for the current generation, the last arrival snapshots and
/// publishes the round, and wakes everyone else. This requires ranks to
/// call `allgather`/`bcast`/`barrier` the same number of times in the same
/// order, which is exactly what `Oob`'s contract already demands.
struct Hub {
    size: usize,
    state: Mutex<HubState>,
    cond: Condvar,
}

struct HubState {
    generation: u64,
    arrived: usize,
    slots: Vec<Vec<u8>>,
}

impl Hub {
    fn new(size: usize) -> Self {
        Hub {
            size,
            state: Mutex::new(HubState {
                generation: 0,
                arrived: 0,
                slots: vec![Vec::new(); size],
            }),
            cond: Condvar::new(),
        }
    }

    fn collective(&self, rank: usize, payload: Vec<u8>) -> Vec<Vec<u8>> {
        let mut st = self.state.lock().unwrap();
        let my_gen = st.generation;
        st.slots[rank] = payload;
        st.arrived += 1;
        if st.arrived == self.size {
            st.arrived = 0;
            st.generation = st.generation.wrapping_add(1);
            self.cond.notify_all();
            st.slots.clone()
        } else {
            while st.generation == my_gen {
                st = self.cond.wait(st).unwrap();
            }
            st.slots.clone()
        }
    }
}

/// One rank's handle onto a [`Hub`]. Clone of the `Arc` is cheap; each
/// simulated node owns one.
pub struct LoopbackOob {
    hub: Arc<Hub>,
    rank: usize,
}

impl LoopbackOob {
    /// Builds `size` handles sharing one hub — `oob_init` for the loopback
    /// transport. Caller hands handle `i` to simulated node `i`.
    pub fn new_job(size: usize) -> Vec<LoopbackOob> {
        assert!(size > 0, "job size must be positive");
        let hub = Arc::new(Hub::new(size));
        (0..size)
            .map(|rank| LoopbackOob {
                hub: hub.clone(),
                rank,
            })
            .collect()
    }

    /// Convenience for the `N==1` fast path: a job of one rank that never
    /// actually blocks on anything.
    pub fn solo() -> LoopbackOob {
        Self::new_job(1).pop().unwrap()
    }
}

impl Oob for LoopbackOob {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.hub.size
    }

    fn allgather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.hub.collective(self.rank, local.to_vec()))
    }

    fn bcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>> {
        if root >= self.hub.size {
            bail!("bcast root {root} out of range for job of size {}", self.hub.size);
        }
        let payload = if self.rank == root { data.to_vec() } else { Vec::new() };
        let mut all = self.hub.collective(self.rank, payload);
        Ok(std::mem::take(&mut all[root]))
    }

    fn barrier(&self) -> Result<()> {
        self.hub.collective(self.rank, Vec::new());
        Ok(())
    }
}
