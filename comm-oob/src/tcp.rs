//! Star-topology TCP bootstrap for real multi-process jobs.
//!
//! Rank 0 listens on a known address and accepts `size - 1` connections, one
//! per peer, in ascending rank order (callers arrange for peers to connect
//! in that order, e.g. by giving the job launcher the rank assignment up
//! front). Every collective after that routes through rank 0: peers send
//! their contribution, rank 0 assembles the result and fans it back out.
//! This is not latency-optimal (a real PMI would use a tree), but bootstrap
//! runs once at init and `spec.md` explicitly treats it as "implementation
//! not specified here" — a correct star is enough.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use anyhow::{Context, Result};

use crate::Oob;

// `TcpStream` implements `Read`/`Write` for `&TcpStream` too, so a `&self`
// API can still do blocking I/O: bind a local `mut` binding to the shared
// reference rather than requiring `&mut TcpStream`.

fn write_frame(mut stream: &TcpStream, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(data)?;
    Ok(())
}

fn read_frame(mut stream: &TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

enum Role {
    Root { peers: Vec<TcpStream> },
    Peer { root: TcpStream },
}

/// One rank's handle onto the star. `rank == 0` is always root.
pub struct TcpOob {
    rank: usize,
    size: usize,
    role: Role,
}

impl TcpOob {
    /// Rank 0: bind `addr` and accept `size - 1` peer connections.
    pub fn init_root(addr: &str, size: usize) -> Result<TcpOob> {
        assert!(size > 0);
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind OOB rendezvous address {addr}"))?;
        let mut peers = Vec::with_capacity(size.saturating_sub(1));
        for _ in 1..size {
            let (stream, _) = listener.accept().context("accepting OOB peer connection")?;
            stream.set_nodelay(true).ok();
            peers.push(stream);
        }
        Ok(TcpOob {
            rank: 0,
            size,
            role: Role::Root { peers },
        })
    }

    /// Rank `rank` (`> 0`): connect to root at `addr`.
    pub fn init_peer(addr: &str, rank: usize, size: usize) -> Result<TcpOob> {
        assert!(rank > 0 && rank < size);
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connecting to OOB root at {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(TcpOob {
            rank,
            size,
            role: Role::Peer { root: stream },
        })
    }

    fn root_collective(&self, peers: &[TcpStream], local: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut slots = vec![Vec::new(); self.size];
        slots[0] = local;
        for (i, peer) in peers.iter().enumerate() {
            slots[i + 1] = read_frame(peer).context("reading OOB contribution from peer")?;
        }
        let encoded = encode_slots(&slots);
        for peer in peers.iter() {
            write_frame(peer, &encoded).context("fanning out OOB result to peer")?;
        }
        Ok(slots)
    }

    fn peer_collective(&self, root: &TcpStream, local: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        write_frame(root, &local).context("sending OOB contribution to root")?;
        let encoded = read_frame(root).context("reading OOB result from root")?;
        Ok(decode_slots(&encoded))
    }

    fn collective(&self, local: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        match &self.role {
            Role::Root { peers } => self.root_collective(peers, local),
            Role::Peer { root } => self.peer_collective(root, local),
        }
    }
}

fn encode_slots(slots: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    for slot in slots {
        out.extend_from_slice(&(slot.len() as u32).to_le_bytes());
        out.extend_from_slice(slot);
    }
    out
}

fn decode_slots(buf: &[u8]) -> Vec<Vec<u8>> {
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut slots = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        slots.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    slots
}

impl Oob for TcpOob {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allgather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.collective(local.to_vec())
    }

    fn bcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>> {
        let payload = if self.rank == root { data.to_vec() } else { Vec::new() };
        let mut all = self.collective(payload)?;
        Ok(std::mem::take(&mut all[root]))
    }

    fn barrier(&self) -> Result<()> {
        self.allgather(&[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allgather_over_loopback_tcp() {
        let addr = "127.0.0.1:0";
        let listener = TcpListener::bind(addr).unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let addr = bound.to_string();

        let root_addr = addr.clone();
        let root = thread::spawn(move || {
            let oob = TcpOob::init_root(&root_addr, 3).unwrap();
            oob.allgather(b"root").unwrap()
        });

        let addr1 = addr.clone();
        let peer1 = thread::spawn(move || {
            // give root a head start binding the listener
            thread::sleep(std::time::Duration::from_millis(50));
            let oob = TcpOob::init_peer(&addr1, 1, 3).unwrap();
            oob.allgather(b"peer1").unwrap()
        });
        let peer2 = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(50));
            let oob = TcpOob::init_peer(&addr, 2, 3).unwrap();
            oob.allgather(b"peer2").unwrap()
        });

        let root_result = root.join().unwrap();
        let peer1_result = peer1.join().unwrap();
        let peer2_result = peer2.join().unwrap();
        let expected = vec![b"root".to_vec(), b"peer1".to_vec(), b"peer2".to_vec()];
        assert_eq!(root_result, expected);
        assert_eq!(peer1_result, expected);
        assert_eq!(peer2_result, expected);
    }
}
