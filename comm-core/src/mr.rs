//! Memory-region table. `spec.md` §3/§4.1: local and remote MR descriptors,
//! remote-key/address lookup, two registration modes (scalable vs.
//! basic/fixed-heap).

use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};

use crate::fabric::Fabric;
use crate::types::NodeId;

/// At most this many registered regions per node (`spec.md` §3: "≤ 10").
pub const MAX_MR_PER_NODE: usize = 10;

/// How `mr_get_key`/`mr_get_desc` compute offsets, chosen at init based on
/// what the provider requires (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    /// One region covering the whole address space; `offset = addr`.
    Scalable,
    /// One region covering a pre-reserved heap; `offset = addr - base`.
    Basic,
}

/// Wire-shaped memory-region descriptor, exchanged via `comm-oob`'s
/// allgather during init. `#[repr(C)]` + `Pod` so it can be cast straight
/// to/from the byte buffers the OOB transport moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MrDesc {
    pub base_addr: u64,
    pub size: u64,
    pub remote_key: u64,
    pub remote_vaddr_base: u64,
}

impl MrDesc {
    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base_addr && addr.saturating_add(size) <= self.base_addr + self.size
    }
}

/// A locally registered region: the wire descriptor plus the fabric handle
/// needed to reuse `mr_desc`-equivalent local access.
#[derive(Debug, Clone, Copy)]
struct LocalMr {
    desc: MrDesc,
    #[allow(dead_code)] // carried for parity with spec's MR.local_handle; not consumed by LoopbackFabric
    handle: u64,
}

/// Resolved local descriptor returned by [`MrTable::mr_get_desc`].
#[derive(Debug, Clone, Copy)]
pub struct LocalDesc {
    pub base_addr: u64,
    pub size: u64,
}

/// Local + replicated-peer memory-region table.
///
/// Local entries are a fixed-capacity array (`spec.md`: "no heap growth
/// after init"); peer replicas are populated once, during
/// `post_mem_init`'s allgather, and are read-only afterward (`spec.md` §5:
/// "Memory-region tables: read-only after init").
pub struct MrTable {
    mode: RegistrationMode,
    local: Vec<LocalMr>,
    peer_replicas: Vec<Vec<MrDesc>>,
}

impl MrTable {
    pub fn new(mode: RegistrationMode, node_count: usize) -> MrTable {
        MrTable {
            mode,
            local: Vec::with_capacity(MAX_MR_PER_NODE),
            peer_replicas: vec![Vec::new(); node_count],
        }
    }

    pub fn mode(&self) -> RegistrationMode {
        self.mode
    }

    /// Registers `[base, base+size)` with the fabric. Called at most
    /// `MAX_MR_PER_NODE` times per node.
    pub fn register(&mut self, fabric: &dyn Fabric, base: u64, size: u64) -> Result<()> {
        if self.local.len() >= MAX_MR_PER_NODE {
            bail!("memory-region table full ({MAX_MR_PER_NODE} entries already registered)");
        }
        let (handle, remote_key) = fabric.mr_reg(base, size)?;
        let remote_vaddr_base = match self.mode {
            RegistrationMode::Scalable => 0,
            RegistrationMode::Basic => base,
        };
        self.local.push(LocalMr {
            desc: MrDesc {
                base_addr: base,
                size,
                remote_key,
                remote_vaddr_base,
            },
            handle,
        });
        Ok(())
    }

    /// This node's descriptors, to hand to `comm-oob`'s allgather.
    pub fn local_descs(&self) -> Vec<MrDesc> {
        self.local.iter().map(|m| m.desc).collect()
    }

    /// Installs the allgathered replica set. `replicas[p]` is peer `p`'s
    /// table (including our own slot, which we ignore — our authoritative
    /// copy is `self.local`).
    pub fn install_replicas(&mut self, self_rank: NodeId, replicas: Vec<Vec<MrDesc>>) {
        for (rank, descs) in replicas.into_iter().enumerate() {
            if rank != self_rank {
                self.peer_replicas[rank] = descs;
            }
        }
    }

    /// `spec.md` §4.1: "scans a short array, selecting the first region
    /// fully containing `[addr, addr+size)`."
    pub fn mr_get_desc(&self, addr: u64, size: u64) -> Option<LocalDesc> {
        self.local
            .iter()
            .find(|m| m.desc.contains(addr, size))
            .map(|m| LocalDesc {
                base_addr: m.desc.base_addr,
                size: m.desc.size,
            })
    }

    /// `spec.md` §4.1: remote-key + offset lookup for `peer`.
    pub fn mr_get_key(&self, peer: NodeId, addr: u64, size: u64) -> Option<(u64, u64)> {
        let replicas = self.peer_replicas.get(peer)?;
        let desc = replicas.iter().find(|d| d.contains(addr, size))?;
        let offset = match self.mode {
            RegistrationMode::Scalable => addr,
            RegistrationMode::Basic => addr - desc.remote_vaddr_base,
        };
        Some((desc.remote_key, offset))
    }

    /// Same shape as `mr_get_key` but resolved against *our own* local
    /// registrations rather than a peer's replica — used by the AM-proxy
    /// path to hand a peer the `(key, offset)` it needs to RMA directly
    /// into/out of one of our bounce slots (`bounce.rs`).
    pub fn own_remote_key(&self, addr: u64, size: u64) -> Option<(u64, u64)> {
        let m = self.local.iter().find(|m| m.desc.contains(addr, size))?;
        let offset = match self.mode {
            RegistrationMode::Scalable => addr,
            RegistrationMode::Basic => addr - m.desc.remote_vaddr_base,
        };
        Some((m.desc.remote_key, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LoopbackFabric;

    #[test]
    fn scalable_mode_offset_is_the_raw_address() {
        let nodes = LoopbackFabric::new_job(2, 4096);
        let mut tables: Vec<MrTable> = (0..2).map(|_| MrTable::new(RegistrationMode::Scalable, 2)).collect();
        for (rank, table) in tables.iter_mut().enumerate() {
            table.register(&nodes[rank], 0, 4096).unwrap();
        }
        let all: Vec<Vec<MrDesc>> = tables.iter().map(|t| t.local_descs()).collect();
        for (rank, table) in tables.iter_mut().enumerate() {
            table.install_replicas(rank, all.clone());
        }
        let (key, offset) = tables[0].mr_get_key(1, 128, 16).unwrap();
        assert_eq!(offset, 128);
        assert_ne!(key, 0);
    }

    #[test]
    fn basic_mode_offset_is_relative_to_heap_base() {
        let nodes = LoopbackFabric::new_job(2, 4096);
        let mut tables: Vec<MrTable> = (0..2).map(|_| MrTable::new(RegistrationMode::Basic, 2)).collect();
        for (rank, table) in tables.iter_mut().enumerate() {
            table.register(&nodes[rank], 1000, 2000).unwrap();
        }
        let all: Vec<Vec<MrDesc>> = tables.iter().map(|t| t.local_descs()).collect();
        for (rank, table) in tables.iter_mut().enumerate() {
            table.install_replicas(rank, all.clone());
        }
        let (_key, offset) = tables[0].mr_get_key(1, 1100, 16).unwrap();
        assert_eq!(offset, 100);
    }

    #[test]
    fn own_remote_key_resolves_without_peer_replicas() {
        let nodes = LoopbackFabric::new_job(1, 4096);
        let mut table = MrTable::new(RegistrationMode::Basic, 1);
        table.register(&nodes[0], 1000, 2000).unwrap();
        let (_key, offset) = table.own_remote_key(1100, 16).unwrap();
        assert_eq!(offset, 100);
        assert!(table.own_remote_key(5000, 16).is_none());
    }

    #[test]
    fn lookup_misses_outside_any_region() {
        let nodes = LoopbackFabric::new_job(1, 1024);
        let mut table = MrTable::new(RegistrationMode::Scalable, 1);
        table.register(&nodes[0], 0, 1024).unwrap();
        table.install_replicas(0, vec![table.local_descs()]);
        assert!(table.mr_get_key(0, 2000, 16).is_none());
        assert!(table.mr_get_desc(2000, 16).is_none());
    }

    #[test]
    fn registration_past_capacity_is_rejected() {
        let nodes = LoopbackFabric::new_job(1, 65536);
        let mut table = MrTable::new(RegistrationMode::Scalable, 1);
        for i in 0..MAX_MR_PER_NODE {
            table.register(&nodes[0], (i * 64) as u64, 64).unwrap();
        }
        assert!(table.register(&nodes[0], 10_000, 64).is_err());
    }
}
