//! CPU-side AMO fallback. `spec.md` §4.5: "implements every `(op, type)`
//! pair directly on the target memory using standard C11-style atomic
//! intrinsics." Used both for `peer == self` (the engine never crosses the
//! fabric for a local target) and by the AM handler servicing a remote
//! `AMO` request (`spec.md` §4.7: "AMO: run CPU AMO in the handler
//! thread").

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::types::{AtomicOp, AtomicType, AtomicValue};

/// Applies `op` at `ptr`, which must be valid, exclusively addressable at
/// the word level (see [`crate::heap::HeapRegion`]'s safety contract), and
/// aligned to `ty.size()`. Returns the value observed *before* the
/// operation — `spec.md`'s table calls this "write old" for every mutating
/// op and "load into result" for `atomic_read`.
///
/// # Safety
/// `ptr` must point to a live, `ty.size()`-aligned allocation of at least
/// `ty.size()` bytes for the duration of the call.
pub unsafe fn apply(ptr: *mut u8, ty: AtomicType, op: AtomicOp, operand1: AtomicValue, operand2: AtomicValue) -> AtomicValue {
    match ty {
        AtomicType::I32 => AtomicValue::I32(apply_i32(ptr, op, operand1, operand2)),
        AtomicType::U32 => AtomicValue::U32(apply_u32(ptr, op, operand1, operand2)),
        AtomicType::I64 => AtomicValue::I64(apply_i64(ptr, op, operand1, operand2)),
        AtomicType::U64 => AtomicValue::U64(apply_u64(ptr, op, operand1, operand2)),
        AtomicType::F32 => AtomicValue::F32(apply_f32(ptr, op, operand1, operand2)),
        AtomicType::F64 => AtomicValue::F64(apply_f64(ptr, op, operand1, operand2)),
    }
}

macro_rules! int_apply {
    ($name:ident, $atomic:ty, $prim:ty, $variant:ident) => {
        unsafe fn $name(ptr: *mut u8, op: AtomicOp, operand1: AtomicValue, operand2: AtomicValue) -> $prim {
            let a = &*(ptr as *const $atomic);
            let op1 = match operand1 {
                AtomicValue::$variant(v) => v,
                _ => panic!("operand type mismatch for {op}"),
            };
            match op {
                AtomicOp::AtomicWrite => a.swap(op1, Ordering::SeqCst),
                AtomicOp::AtomicRead => a.load(Ordering::SeqCst),
                AtomicOp::Sum => a.fetch_add(op1, Ordering::SeqCst),
                AtomicOp::Band => a.fetch_and(op1, Ordering::SeqCst),
                AtomicOp::Bor => a.fetch_or(op1, Ordering::SeqCst),
                AtomicOp::Bxor => a.fetch_xor(op1, Ordering::SeqCst),
                AtomicOp::Cswap => {
                    let op2 = match operand2 {
                        AtomicValue::$variant(v) => v,
                        _ => panic!("operand2 type mismatch for cswap"),
                    };
                    // compare_exchange_strong(obj, &op1, op2); write old — spec.md §4.5.
                    match a.compare_exchange(op1, op2, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(old) => old,
                        Err(old) => old,
                    }
                }
            }
        }
    };
}

int_apply!(apply_i32, AtomicI32, i32, I32);
int_apply!(apply_u32, AtomicU32, u32, U32);
int_apply!(apply_i64, AtomicI64, i64, I64);
int_apply!(apply_u64, AtomicU64, u64, U64);

/// Floats have no hardware atomic RMW in `std`; `sum`/`cswap` go through a
/// compare-and-swap loop on the bit pattern, the standard technique (and
/// the one real fabric libraries use internally for float AMOs).
macro_rules! float_apply {
    ($name:ident, $atomic:ty, $prim:ty, $bits:ty, $variant:ident) => {
        unsafe fn $name(ptr: *mut u8, op: AtomicOp, operand1: AtomicValue, operand2: AtomicValue) -> $prim {
            let a = &*(ptr as *const $atomic);
            let op1 = match operand1 {
                AtomicValue::$variant(v) => v,
                _ => panic!("operand type mismatch for {op}"),
            };
            match op {
                AtomicOp::AtomicWrite => <$prim>::from_bits(a.swap(op1.to_bits(), Ordering::SeqCst)),
                AtomicOp::AtomicRead => <$prim>::from_bits(a.load(Ordering::SeqCst)),
                AtomicOp::Sum => {
                    let mut old_bits = a.load(Ordering::SeqCst);
                    loop {
                        let old = <$prim>::from_bits(old_bits);
                        let new = old + op1;
                        match a.compare_exchange_weak(old_bits, new.to_bits(), Ordering::SeqCst, Ordering::SeqCst) {
                            Ok(_) => return old,
                            Err(cur) => old_bits = cur,
                        }
                    }
                }
                AtomicOp::Cswap => {
                    let op2 = match operand2 {
                        AtomicValue::$variant(v) => v,
                        _ => panic!("operand2 type mismatch for cswap"),
                    };
                    match a.compare_exchange(op1.to_bits(), op2.to_bits(), Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(old) => <$prim>::from_bits(old),
                        Err(old) => <$prim>::from_bits(old),
                    }
                }
                _ => panic!("{op} is not supported for float AMOs (spec.md §4.4)"),
            }
        }
    };
}

float_apply!(apply_f32, AtomicU32, f32, u32, F32);
float_apply!(apply_f64, AtomicU64, f64, u64, F64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapRegion;

    #[test]
    fn sum_accumulates_concurrently() {
        let heap = HeapRegion::leaked(8);
        let ptr = heap.word_ptr(0, 8) as usize;
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(move || {
                    for _ in 0..1000 {
                        unsafe {
                            apply(ptr as *mut u8, AtomicType::I64, AtomicOp::Sum, AtomicValue::I64(1), AtomicValue::I64(0));
                        }
                    }
                });
            }
        });
        let got = unsafe { apply(ptr as *mut u8, AtomicType::I64, AtomicOp::AtomicRead, AtomicValue::I64(0), AtomicValue::I64(0)) };
        assert_eq!(got, AtomicValue::I64(8000));
    }

    #[test]
    fn cswap_only_replaces_on_match() {
        let heap = HeapRegion::leaked(4);
        let ptr = heap.word_ptr(0, 4);
        unsafe {
            apply(ptr, AtomicType::I32, AtomicOp::AtomicWrite, AtomicValue::I32(5), AtomicValue::I32(0));
            let old = apply(ptr, AtomicType::I32, AtomicOp::Cswap, AtomicValue::I32(5), AtomicValue::I32(9));
            assert_eq!(old, AtomicValue::I32(5));
            let now = apply(ptr, AtomicType::I32, AtomicOp::AtomicRead, AtomicValue::I32(0), AtomicValue::I32(0));
            assert_eq!(now, AtomicValue::I32(9));
            let old2 = apply(ptr, AtomicType::I32, AtomicOp::Cswap, AtomicValue::I32(5), AtomicValue::I32(42));
            assert_eq!(old2, AtomicValue::I32(9));
            let still = apply(ptr, AtomicType::I32, AtomicOp::AtomicRead, AtomicValue::I32(0), AtomicValue::I32(0));
            assert_eq!(still, AtomicValue::I32(9));
        }
    }

    #[test]
    fn float_sum_converges_under_contention() {
        let heap = HeapRegion::leaked(4);
        let ptr = heap.word_ptr(0, 4) as usize;
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(move || {
                    for _ in 0..250 {
                        unsafe {
                            apply(ptr as *mut u8, AtomicType::F32, AtomicOp::Sum, AtomicValue::F32(0.5), AtomicValue::F32(0.0));
                        }
                    }
                });
            }
        });
        let got = unsafe { apply(ptr as *mut u8, AtomicType::F32, AtomicOp::AtomicRead, AtomicValue::F32(0.0), AtomicValue::F32(0.0)) };
        assert_eq!(got, AtomicValue::F32(500.0));
    }

    #[test]
    fn band_bor_bxor_match_bitwise_semantics() {
        let heap = HeapRegion::leaked(4);
        let ptr = heap.word_ptr(0, 4);
        unsafe {
            apply(ptr, AtomicType::U32, AtomicOp::AtomicWrite, AtomicValue::U32(0b1010), AtomicValue::U32(0));
            apply(ptr, AtomicType::U32, AtomicOp::Band, AtomicValue::U32(0b1100), AtomicValue::U32(0));
            assert_eq!(
                apply(ptr, AtomicType::U32, AtomicOp::AtomicRead, AtomicValue::U32(0), AtomicValue::U32(0)),
                AtomicValue::U32(0b1000)
            );
            apply(ptr, AtomicType::U32, AtomicOp::Bor, AtomicValue::U32(0b0001), AtomicValue::U32(0));
            assert_eq!(
                apply(ptr, AtomicType::U32, AtomicOp::AtomicRead, AtomicValue::U32(0), AtomicValue::U32(0)),
                AtomicValue::U32(0b1001)
            );
            apply(ptr, AtomicType::U32, AtomicOp::Bxor, AtomicValue::U32(0b1111), AtomicValue::U32(0));
            assert_eq!(
                apply(ptr, AtomicType::U32, AtomicOp::AtomicRead, AtomicValue::U32(0), AtomicValue::U32(0)),
                AtomicValue::U32(0b0110)
            );
        }
    }
}
