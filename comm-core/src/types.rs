//! Small shared vocabulary used across the engine: node identity and the
//! atomic-operation taxonomy from `spec.md` §4.4/§4.5.

use std::fmt;

/// A peer's index in `[0, N)`. `spec.md` §3: "`self` denotes the caller's
/// node" — callers compare against `CommSubstrate::self_rank()` for that.
pub type NodeId = usize;

/// The six element types an AMO can target (`spec.md` §4.4's atomic-validity
/// cache: "signed/unsigned 32/64-bit integers and 32/64-bit floats").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl AtomicType {
    /// Byte width, used to validate that a target address/offset obeys the
    /// "sequentially consistent at word granularity" rule in `spec.md` §4.5.
    pub const fn size(self) -> usize {
        match self {
            AtomicType::I32 | AtomicType::U32 | AtomicType::F32 => 4,
            AtomicType::I64 | AtomicType::U64 | AtomicType::F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, AtomicType::F32 | AtomicType::F64)
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AtomicType::I32 => "i32",
            AtomicType::U32 => "u32",
            AtomicType::I64 => "i64",
            AtomicType::U64 => "u64",
            AtomicType::F32 => "f32",
            AtomicType::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// The AMO operation kinds `spec.md` §4.4 lists as probed at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Sum,
    Band,
    Bor,
    Bxor,
    AtomicWrite,
    AtomicRead,
    Cswap,
}

impl AtomicOp {
    /// `spec.md` §4.6: "before a network AMO (non-read): all nodes" must
    /// have prior PUTs forced visible. `atomic_read` is the only op that
    /// never mutates the target.
    pub const fn is_mutating(self) -> bool {
        !matches!(self, AtomicOp::AtomicRead)
    }

    pub const fn is_float_supported(self) -> bool {
        // spec.md §4.4: "Float ops: sum, atomic_write/read, cswap."
        matches!(
            self,
            AtomicOp::Sum | AtomicOp::AtomicWrite | AtomicOp::AtomicRead | AtomicOp::Cswap
        )
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AtomicOp::Sum => "sum",
            AtomicOp::Band => "band",
            AtomicOp::Bor => "bor",
            AtomicOp::Bxor => "bxor",
            AtomicOp::AtomicWrite => "atomic_write",
            AtomicOp::AtomicRead => "atomic_read",
            AtomicOp::Cswap => "cswap",
        };
        f.write_str(s)
    }
}

/// A typed AMO operand or result. The reference implementation passes raw
/// operand buffers and a type/size pair; here the type tag and the value
/// travel together so `cpu_amo::apply` can't be called with a mismatched
/// type by accident.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AtomicValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl AtomicValue {
    pub const fn ty(self) -> AtomicType {
        match self {
            AtomicValue::I32(_) => AtomicType::I32,
            AtomicValue::U32(_) => AtomicType::U32,
            AtomicValue::I64(_) => AtomicType::I64,
            AtomicValue::U64(_) => AtomicType::U64,
            AtomicValue::F32(_) => AtomicType::F32,
            AtomicValue::F64(_) => AtomicType::F64,
        }
    }

    /// Zero value of the same type, used where the reference implementation
    /// needs a scratch operand for ops that don't semantically use one (the
    /// `atomic_read`-with-null-operand provider workaround in `spec.md`
    /// §4.4 — moot here since our API takes typed values, never nullable
    /// buffers; see `DESIGN.md`).
    pub const fn zero(ty: AtomicType) -> AtomicValue {
        match ty {
            AtomicType::I32 => AtomicValue::I32(0),
            AtomicType::U32 => AtomicValue::U32(0),
            AtomicType::I64 => AtomicValue::I64(0),
            AtomicType::U64 => AtomicValue::U64(0),
            AtomicType::F32 => AtomicValue::F32(0.0),
            AtomicType::F64 => AtomicValue::F64(0.0),
        }
    }

    pub fn to_le_bytes(self) -> Vec<u8> {
        match self {
            AtomicValue::I32(v) => v.to_le_bytes().to_vec(),
            AtomicValue::U32(v) => v.to_le_bytes().to_vec(),
            AtomicValue::I64(v) => v.to_le_bytes().to_vec(),
            AtomicValue::U64(v) => v.to_le_bytes().to_vec(),
            AtomicValue::F32(v) => v.to_le_bytes().to_vec(),
            AtomicValue::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_le_bytes(ty: AtomicType, bytes: &[u8]) -> AtomicValue {
        match ty {
            AtomicType::I32 => AtomicValue::I32(i32::from_le_bytes(bytes.try_into().unwrap())),
            AtomicType::U32 => AtomicValue::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
            AtomicType::I64 => AtomicValue::I64(i64::from_le_bytes(bytes.try_into().unwrap())),
            AtomicType::U64 => AtomicValue::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
            AtomicType::F32 => AtomicValue::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
            AtomicType::F64 => AtomicValue::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
        }
    }
}

/// Completion-context tag: what to do when a fabric operation we issued
/// completes. `spec.md` §3: "a pointer-width word encoding either `(Id,
/// u63)`... or `(Done, *AtomicBool)`". The reference implementation packs
/// this into an opaque pointer-sized context because the fabric API only
/// accepts `*void`; we have no such constraint; this is the sum type the
/// DESIGN NOTES ask for directly.
#[derive(Clone, Copy, Debug)]
pub enum CompletionTag {
    /// Opaque id, used only for log correlation.
    Id(u64),
    /// Address of a flag to set on completion (a done-flag byte).
    Done(*const std::sync::atomic::AtomicBool),
}

// SAFETY: the `Done` pointer always refers to either task-private storage
// pinned for the duration of the blocking call, or a `'static` bounce slot;
// never to stack memory that could be freed before completion.
unsafe impl Send for CompletionTag {}
