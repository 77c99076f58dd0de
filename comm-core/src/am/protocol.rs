//! Active-message wire format. `spec.md` §4.7's request-kind table, hand-rolled
//! as a tagged union of plain byte fields rather than a `serde` message —
//! `Fabric::send`/`recv_am` move opaque `Vec<u8>` payloads, so something has
//! to do this encoding, and the reference implementation's own AM header is
//! exactly this shape: an opcode byte first, fixed-width fields after.

use anyhow::{bail, Result};

use crate::types::{AtomicOp, AtomicType, AtomicValue, NodeId};

/// `(remote_key, offset)` into some node's own registered heap, carried
/// inside a request so the receiver can RMA directly against memory it
/// doesn't own — the initiator's bounce slot, or its done-flag / AMO-result
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSlot {
    pub key: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    /// `spec.md` §4.7: inline argument bundle. `fast` is the wire-level
    /// dispatch-mode bit the spec describes: set by `execute_on_fast`, it
    /// tells the handler to run the user function inline on the handler
    /// thread; clear (the `execute_on`/`execute_on_nb` case), the handler
    /// hands it to `Tasking::task_start_moved` instead (`am/handler.rs`).
    ExecOn { fid: u64, fast: bool, arg: Vec<u8> },
    /// Oversized argument bundle staged in the initiator's own heap; the
    /// handler GETs it rather than carrying it inline.
    ExecOnLrg { fid: u64, arg_len: u64, payload: RemoteSlot },
    /// Servicing a PUT whose destination wasn't locally resolvable: target
    /// GETs `size` bytes from `payload` (the initiator's staged source) into
    /// its own `target_local_addr`.
    Get { payload: RemoteSlot, target_local_addr: u64, size: u64 },
    /// Servicing a GET whose source wasn't locally resolvable: target PUTs
    /// `size` bytes from its own `target_local_addr` into `payload` (the
    /// initiator's staged destination).
    Put { payload: RemoteSlot, target_local_addr: u64, size: u64 },
    /// Remote AMO serviced via CPU fallback in the handler thread.
    Amo {
        op: AtomicOp,
        ty: AtomicType,
        operand1: AtomicValue,
        operand2: AtomicValue,
        target_local_addr: u64,
        /// Where to write the pre-op value back, if the caller fetched.
        result: Option<RemoteSlot>,
    },
    /// Releases a bounce-staged heap copy once a peer no longer needs it
    /// (`ExecOnLrg`'s payload, once the handler has GET'd it).
    Free { local_addr: u64 },
    /// Liveness probe; no side effect beyond the AM round trip itself.
    Nop,
    /// Graceful-exit signal (`shutdown.rs`).
    Shutdown,
    /// `barrier.rs`'s up-phase: a child has reached the barrier and is
    /// notifying its parent. Not one of `spec.md` §4.7's table rows — the
    /// tree barrier (`spec.md` §4.8) rides the same AM channel rather than
    /// a dedicated wire, so it gets its own opcodes here.
    BarrierArrive { tag: u64 },
    /// `barrier.rs`'s down-phase: a parent releasing one child.
    BarrierRelease { tag: u64 },
}

impl RequestKind {
    fn opcode(&self) -> u8 {
        match self {
            RequestKind::ExecOn { .. } => 0,
            RequestKind::ExecOnLrg { .. } => 1,
            RequestKind::Get { .. } => 2,
            RequestKind::Put { .. } => 3,
            RequestKind::Amo { .. } => 4,
            RequestKind::Free { .. } => 5,
            RequestKind::Nop => 6,
            RequestKind::Shutdown => 7,
            RequestKind::BarrierArrive { .. } => 8,
            RequestKind::BarrierRelease { .. } => 9,
        }
    }
}

/// A full AM request: header (initiator identity, optional done-flag slot)
/// plus the opcode-specific body.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub initiator: NodeId,
    pub done: Option<RemoteSlot>,
    pub kind: RequestKind,
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn slot(&mut self, s: RemoteSlot) {
        self.u64(s.key);
        self.u64(s.offset);
    }
    fn opt_slot(&mut self, s: Option<RemoteSlot>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.slot(s);
            }
            None => self.u8(0),
        }
    }
    fn bytes(&mut self, b: &[u8]) {
        self.u64(b.len() as u64);
        self.0.extend_from_slice(b);
    }
    fn atomic_value(&mut self, v: AtomicValue) {
        match v {
            AtomicValue::I32(x) => {
                self.u8(0);
                self.u64(x as u32 as u64);
            }
            AtomicValue::U32(x) => {
                self.u8(1);
                self.u64(x as u64);
            }
            AtomicValue::I64(x) => {
                self.u8(2);
                self.u64(x as u64);
            }
            AtomicValue::U64(x) => {
                self.u8(3);
                self.u64(x);
            }
            AtomicValue::F32(x) => {
                self.u8(4);
                self.f32(x);
            }
            AtomicValue::F64(x) => {
                self.u8(5);
                self.f64(x);
            }
        }
    }
    fn atomic_op(&mut self, op: AtomicOp) {
        self.u8(match op {
            AtomicOp::Sum => 0,
            AtomicOp::Band => 1,
            AtomicOp::Bor => 2,
            AtomicOp::Bxor => 3,
            AtomicOp::AtomicWrite => 4,
            AtomicOp::AtomicRead => 5,
            AtomicOp::Cswap => 6,
        });
    }
    fn atomic_type(&mut self, ty: AtomicType) {
        self.u8(match ty {
            AtomicType::I32 => 0,
            AtomicType::U32 => 1,
            AtomicType::I64 => 2,
            AtomicType::U64 => 3,
            AtomicType::F32 => 4,
            AtomicType::F64 => 5,
        });
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let v = *self.buf.get(self.pos).ok_or_else(|| anyhow::anyhow!("truncated AM payload"))?;
        self.pos += 1;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8).ok_or_else(|| anyhow::anyhow!("truncated AM payload"))?;
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        let bytes = self.buf.get(self.pos..self.pos + 4).ok_or_else(|| anyhow::anyhow!("truncated AM payload"))?;
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        let bytes = self.buf.get(self.pos..self.pos + 8).ok_or_else(|| anyhow::anyhow!("truncated AM payload"))?;
        self.pos += 8;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn slot(&mut self) -> Result<RemoteSlot> {
        let key = self.u64()?;
        let offset = self.u64()?;
        Ok(RemoteSlot { key, offset })
    }

    fn opt_slot(&mut self) -> Result<Option<RemoteSlot>> {
        if self.u8()? == 1 {
            Ok(Some(self.slot()?))
        } else {
            Ok(None)
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        let b = self.buf.get(self.pos..self.pos + len).ok_or_else(|| anyhow::anyhow!("truncated AM payload"))?;
        self.pos += len;
        Ok(b.to_vec())
    }

    fn atomic_value(&mut self) -> Result<AtomicValue> {
        Ok(match self.u8()? {
            0 => AtomicValue::I32(self.u64()? as u32 as i32),
            1 => AtomicValue::U32(self.u64()? as u32),
            2 => AtomicValue::I64(self.u64()? as i64),
            3 => AtomicValue::U64(self.u64()?),
            4 => AtomicValue::F32(self.f32()?),
            5 => AtomicValue::F64(self.f64()?),
            other => bail!("unknown atomic value tag {other}"),
        })
    }

    fn atomic_op(&mut self) -> Result<AtomicOp> {
        Ok(match self.u8()? {
            0 => AtomicOp::Sum,
            1 => AtomicOp::Band,
            2 => AtomicOp::Bor,
            3 => AtomicOp::Bxor,
            4 => AtomicOp::AtomicWrite,
            5 => AtomicOp::AtomicRead,
            6 => AtomicOp::Cswap,
            other => bail!("unknown atomic op tag {other}"),
        })
    }

    fn atomic_type(&mut self) -> Result<AtomicType> {
        Ok(match self.u8()? {
            0 => AtomicType::I32,
            1 => AtomicType::U32,
            2 => AtomicType::I64,
            3 => AtomicType::U64,
            4 => AtomicType::F32,
            5 => AtomicType::F64,
            other => bail!("unknown atomic type tag {other}"),
        })
    }
}

pub fn encode(req: &Request) -> Vec<u8> {
    let mut w = Writer(Vec::new());
    w.u8(req.kind.opcode());
    w.u64(req.initiator as u64);
    w.opt_slot(req.done);
    match &req.kind {
        RequestKind::ExecOn { fid, fast, arg } => {
            w.u64(*fid);
            w.u8(if *fast { 1 } else { 0 });
            w.bytes(arg);
        }
        RequestKind::ExecOnLrg { fid, arg_len, payload } => {
            w.u64(*fid);
            w.u64(*arg_len);
            w.slot(*payload);
        }
        RequestKind::Get { payload, target_local_addr, size } => {
            w.slot(*payload);
            w.u64(*target_local_addr);
            w.u64(*size);
        }
        RequestKind::Put { payload, target_local_addr, size } => {
            w.slot(*payload);
            w.u64(*target_local_addr);
            w.u64(*size);
        }
        RequestKind::Amo { op, ty, operand1, operand2, target_local_addr, result } => {
            w.atomic_op(*op);
            w.atomic_type(*ty);
            w.atomic_value(*operand1);
            w.atomic_value(*operand2);
            w.u64(*target_local_addr);
            w.opt_slot(*result);
        }
        RequestKind::Free { local_addr } => {
            w.u64(*local_addr);
        }
        RequestKind::Nop | RequestKind::Shutdown => {}
        RequestKind::BarrierArrive { tag } | RequestKind::BarrierRelease { tag } => {
            w.u64(*tag);
        }
    }
    w.0
}

pub fn decode(buf: &[u8]) -> Result<Request> {
    let mut r = Reader::new(buf);
    let opcode = r.u8()?;
    let initiator = r.u64()? as NodeId;
    let done = r.opt_slot()?;
    let kind = match opcode {
        0 => RequestKind::ExecOn { fid: r.u64()?, fast: r.u8()? != 0, arg: r.bytes()? },
        1 => RequestKind::ExecOnLrg {
            fid: r.u64()?,
            arg_len: r.u64()?,
            payload: r.slot()?,
        },
        2 => RequestKind::Get {
            payload: r.slot()?,
            target_local_addr: r.u64()?,
            size: r.u64()?,
        },
        3 => RequestKind::Put {
            payload: r.slot()?,
            target_local_addr: r.u64()?,
            size: r.u64()?,
        },
        4 => RequestKind::Amo {
            op: r.atomic_op()?,
            ty: r.atomic_type()?,
            operand1: r.atomic_value()?,
            operand2: r.atomic_value()?,
            target_local_addr: r.u64()?,
            result: r.opt_slot()?,
        },
        5 => RequestKind::Free { local_addr: r.u64()? },
        6 => RequestKind::Nop,
        7 => RequestKind::Shutdown,
        8 => RequestKind::BarrierArrive { tag: r.u64()? },
        9 => RequestKind::BarrierRelease { tag: r.u64()? },
        other => bail!("unknown AM opcode {other}"),
    };
    Ok(Request { initiator, done, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_on_roundtrips() {
        let req = Request {
            initiator: 3,
            done: Some(RemoteSlot { key: 9, offset: 128 }),
            kind: RequestKind::ExecOn { fid: 42, fast: false, arg: vec![1, 2, 3, 4, 5] },
        };
        let decoded = decode(&encode(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn exec_on_fast_flag_roundtrips_both_ways() {
        for fast in [true, false] {
            let req = Request { initiator: 1, done: None, kind: RequestKind::ExecOn { fid: 7, fast, arg: vec![] } };
            let decoded = decode(&encode(&req)).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn amo_with_no_result_roundtrips() {
        let req = Request {
            initiator: 0,
            done: None,
            kind: RequestKind::Amo {
                op: AtomicOp::Sum,
                ty: AtomicType::I64,
                operand1: AtomicValue::I64(7),
                operand2: AtomicValue::I64(0),
                target_local_addr: 256,
                result: None,
            },
        };
        let decoded = decode(&encode(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn nop_and_shutdown_have_empty_bodies() {
        for kind in [RequestKind::Nop, RequestKind::Shutdown] {
            let req = Request { initiator: 1, done: None, kind };
            let decoded = decode(&encode(&req)).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn barrier_arrive_and_release_roundtrip() {
        for kind in [RequestKind::BarrierArrive { tag: 5 }, RequestKind::BarrierRelease { tag: 5 }] {
            let req = Request { initiator: 2, done: None, kind };
            let decoded = decode(&encode(&req)).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn truncated_payload_is_rejected_not_panicked() {
        let req = Request { initiator: 0, done: None, kind: RequestKind::Nop };
        let mut bytes = encode(&req);
        bytes.truncate(2);
        assert!(decode(&bytes).is_err());
    }
}
