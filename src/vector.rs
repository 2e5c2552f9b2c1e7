//! 128-bit vector instructions.
//!
//! Vectors travel as `u128` with lane 0 in the low bits. Lane views are
//! produced by shifting, so nothing here depends on host endianness.
//! Relaxed instructions are fixed to one deterministic behaviour each.

use std::array::from_fn;

use crate::numeric::{f32_max, f32_min, f64_max, f64_min};

macro_rules! simd_ops {
    ($( $name:ident = $code:literal, $arity:literal; )*) => {
        /// An immediate-free vector instruction, keyed by its `0xFD` sub-opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SimdOp {
            $( $name, )*
        }

        impl SimdOp {
            pub const fn code(self) -> u16 {
                match self {
                    $( SimdOp::$name => $code, )*
                }
            }

            pub const fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(SimdOp::$name), )*
                    _ => None,
                }
            }

            /// Operands popped; the first is deepest. Every op pushes one result.
            pub const fn arity(self) -> usize {
                match self {
                    $( SimdOp::$name => $arity, )*
                }
            }
        }
    };
}

simd_ops! {
    I8x16Swizzle = 0x0E, 2;
    I8x16Splat = 0x0F, 1; I16x8Splat = 0x10, 1; I32x4Splat = 0x11, 1; I64x2Splat = 0x12, 1;
    F32x4Splat = 0x13, 1; F64x2Splat = 0x14, 1;

    I8x16Eq = 0x23, 2; I8x16Ne = 0x24, 2; I8x16LtS = 0x25, 2; I8x16LtU = 0x26, 2;
    I8x16GtS = 0x27, 2; I8x16GtU = 0x28, 2; I8x16LeS = 0x29, 2; I8x16LeU = 0x2A, 2;
    I8x16GeS = 0x2B, 2; I8x16GeU = 0x2C, 2;
    I16x8Eq = 0x2D, 2; I16x8Ne = 0x2E, 2; I16x8LtS = 0x2F, 2; I16x8LtU = 0x30, 2;
    I16x8GtS = 0x31, 2; I16x8GtU = 0x32, 2; I16x8LeS = 0x33, 2; I16x8LeU = 0x34, 2;
    I16x8GeS = 0x35, 2; I16x8GeU = 0x36, 2;
    I32x4Eq = 0x37, 2; I32x4Ne = 0x38, 2; I32x4LtS = 0x39, 2; I32x4LtU = 0x3A, 2;
    I32x4GtS = 0x3B, 2; I32x4GtU = 0x3C, 2; I32x4LeS = 0x3D, 2; I32x4LeU = 0x3E, 2;
    I32x4GeS = 0x3F, 2; I32x4GeU = 0x40, 2;
    F32x4Eq = 0x41, 2; F32x4Ne = 0x42, 2; F32x4Lt = 0x43, 2; F32x4Gt = 0x44, 2;
    F32x4Le = 0x45, 2; F32x4Ge = 0x46, 2;
    F64x2Eq = 0x47, 2; F64x2Ne = 0x48, 2; F64x2Lt = 0x49, 2; F64x2Gt = 0x4A, 2;
    F64x2Le = 0x4B, 2; F64x2Ge = 0x4C, 2;

    V128Not = 0x4D, 1; V128And = 0x4E, 2; V128AndNot = 0x4F, 2; V128Or = 0x50, 2;
    V128Xor = 0x51, 2; V128Bitselect = 0x52, 3; V128AnyTrue = 0x53, 1;

    F32x4DemoteF64x2Zero = 0x5E, 1; F64x2PromoteLowF32x4 = 0x5F, 1;

    I8x16Abs = 0x60, 1; I8x16Neg = 0x61, 1; I8x16Popcnt = 0x62, 1; I8x16AllTrue = 0x63, 1;
    I8x16Bitmask = 0x64, 1; I8x16NarrowI16x8S = 0x65, 2; I8x16NarrowI16x8U = 0x66, 2;
    F32x4Ceil = 0x67, 1; F32x4Floor = 0x68, 1; F32x4Trunc = 0x69, 1; F32x4Nearest = 0x6A, 1;
    I8x16Shl = 0x6B, 2; I8x16ShrS = 0x6C, 2; I8x16ShrU = 0x6D, 2; I8x16Add = 0x6E, 2;
    I8x16AddSatS = 0x6F, 2; I8x16AddSatU = 0x70, 2; I8x16Sub = 0x71, 2; I8x16SubSatS = 0x72, 2;
    I8x16SubSatU = 0x73, 2;
    F64x2Ceil = 0x74, 1; F64x2Floor = 0x75, 1;
    I8x16MinS = 0x76, 2; I8x16MinU = 0x77, 2; I8x16MaxS = 0x78, 2; I8x16MaxU = 0x79, 2;
    F64x2Trunc = 0x7A, 1; I8x16AvgrU = 0x7B, 2;
    I16x8ExtaddPairwiseI8x16S = 0x7C, 1; I16x8ExtaddPairwiseI8x16U = 0x7D, 1;
    I32x4ExtaddPairwiseI16x8S = 0x7E, 1; I32x4ExtaddPairwiseI16x8U = 0x7F, 1;

    I16x8Abs = 0x80, 1; I16x8Neg = 0x81, 1; I16x8Q15MulrSatS = 0x82, 2; I16x8AllTrue = 0x83, 1;
    I16x8Bitmask = 0x84, 1; I16x8NarrowI32x4S = 0x85, 2; I16x8NarrowI32x4U = 0x86, 2;
    I16x8ExtendLowI8x16S = 0x87, 1; I16x8ExtendHighI8x16S = 0x88, 1;
    I16x8ExtendLowI8x16U = 0x89, 1; I16x8ExtendHighI8x16U = 0x8A, 1;
    I16x8Shl = 0x8B, 2; I16x8ShrS = 0x8C, 2; I16x8ShrU = 0x8D, 2; I16x8Add = 0x8E, 2;
    I16x8AddSatS = 0x8F, 2; I16x8AddSatU = 0x90, 2; I16x8Sub = 0x91, 2; I16x8SubSatS = 0x92, 2;
    I16x8SubSatU = 0x93, 2;
    F64x2Nearest = 0x94, 1;
    I16x8Mul = 0x95, 2; I16x8MinS = 0x96, 2; I16x8MinU = 0x97, 2; I16x8MaxS = 0x98, 2;
    I16x8MaxU = 0x99, 2; I16x8AvgrU = 0x9B, 2;
    I16x8ExtmulLowI8x16S = 0x9C, 2; I16x8ExtmulHighI8x16S = 0x9D, 2;
    I16x8ExtmulLowI8x16U = 0x9E, 2; I16x8ExtmulHighI8x16U = 0x9F, 2;

    I32x4Abs = 0xA0, 1; I32x4Neg = 0xA1, 1; I32x4AllTrue = 0xA3, 1; I32x4Bitmask = 0xA4, 1;
    I32x4ExtendLowI16x8S = 0xA7, 1; I32x4ExtendHighI16x8S = 0xA8, 1;
    I32x4ExtendLowI16x8U = 0xA9, 1; I32x4ExtendHighI16x8U = 0xAA, 1;
    I32x4Shl = 0xAB, 2; I32x4ShrS = 0xAC, 2; I32x4ShrU = 0xAD, 2; I32x4Add = 0xAE, 2;
    I32x4Sub = 0xB1, 2; I32x4Mul = 0xB5, 2; I32x4MinS = 0xB6, 2; I32x4MinU = 0xB7, 2;
    I32x4MaxS = 0xB8, 2; I32x4MaxU = 0xB9, 2; I32x4DotI16x8S = 0xBA, 2;
    I32x4ExtmulLowI16x8S = 0xBC, 2; I32x4ExtmulHighI16x8S = 0xBD, 2;
    I32x4ExtmulLowI16x8U = 0xBE, 2; I32x4ExtmulHighI16x8U = 0xBF, 2;

    I64x2Abs = 0xC0, 1; I64x2Neg = 0xC1, 1; I64x2AllTrue = 0xC3, 1; I64x2Bitmask = 0xC4, 1;
    I64x2ExtendLowI32x4S = 0xC7, 1; I64x2ExtendHighI32x4S = 0xC8, 1;
    I64x2ExtendLowI32x4U = 0xC9, 1; I64x2ExtendHighI32x4U = 0xCA, 1;
    I64x2Shl = 0xCB, 2; I64x2ShrS = 0xCC, 2; I64x2ShrU = 0xCD, 2; I64x2Add = 0xCE, 2;
    I64x2Sub = 0xD1, 2; I64x2Mul = 0xD5, 2;
    I64x2Eq = 0xD6, 2; I64x2Ne = 0xD7, 2; I64x2LtS = 0xD8, 2; I64x2GtS = 0xD9, 2;
    I64x2LeS = 0xDA, 2; I64x2GeS = 0xDB, 2;
    I64x2ExtmulLowI32x4S = 0xDC, 2; I64x2ExtmulHighI32x4S = 0xDD, 2;
    I64x2ExtmulLowI32x4U = 0xDE, 2; I64x2ExtmulHighI32x4U = 0xDF, 2;

    F32x4Abs = 0xE0, 1; F32x4Neg = 0xE1, 1; F32x4Sqrt = 0xE3, 1; F32x4Add = 0xE4, 2;
    F32x4Sub = 0xE5, 2; F32x4Mul = 0xE6, 2; F32x4Div = 0xE7, 2; F32x4Min = 0xE8, 2;
    F32x4Max = 0xE9, 2; F32x4Pmin = 0xEA, 2; F32x4Pmax = 0xEB, 2;
    F64x2Abs = 0xEC, 1; F64x2Neg = 0xED, 1; F64x2Sqrt = 0xEF, 1; F64x2Add = 0xF0, 2;
    F64x2Sub = 0xF1, 2; F64x2Mul = 0xF2, 2; F64x2Div = 0xF3, 2; F64x2Min = 0xF4, 2;
    F64x2Max = 0xF5, 2; F64x2Pmin = 0xF6, 2; F64x2Pmax = 0xF7, 2;

    I32x4TruncSatF32x4S = 0xF8, 1; I32x4TruncSatF32x4U = 0xF9, 1;
    F32x4ConvertI32x4S = 0xFA, 1; F32x4ConvertI32x4U = 0xFB, 1;
    I32x4TruncSatF64x2SZero = 0xFC, 1; I32x4TruncSatF64x2UZero = 0xFD, 1;
    F64x2ConvertLowI32x4S = 0xFE, 1; F64x2ConvertLowI32x4U = 0xFF, 1;

    I8x16RelaxedSwizzle = 0x100, 2;
    I32x4RelaxedTruncF32x4S = 0x101, 1; I32x4RelaxedTruncF32x4U = 0x102, 1;
    I32x4RelaxedTruncF64x2SZero = 0x103, 1; I32x4RelaxedTruncF64x2UZero = 0x104, 1;
    F32x4RelaxedMadd = 0x105, 3; F32x4RelaxedNmadd = 0x106, 3;
    F64x2RelaxedMadd = 0x107, 3; F64x2RelaxedNmadd = 0x108, 3;
    I8x16RelaxedLaneselect = 0x109, 3; I16x8RelaxedLaneselect = 0x10A, 3;
    I32x4RelaxedLaneselect = 0x10B, 3; I64x2RelaxedLaneselect = 0x10C, 3;
    F32x4RelaxedMin = 0x10D, 2; F32x4RelaxedMax = 0x10E, 2;
    F64x2RelaxedMin = 0x10F, 2; F64x2RelaxedMax = 0x110, 2;
    I16x8RelaxedQ15mulrS = 0x111, 2; I16x8RelaxedDotI8x16I7x16S = 0x112, 2;
    I32x4RelaxedDotI8x16I7x16AddS = 0x113, 3;
}

// ── Lane views ───────────────────────────────────────────────────────────────

macro_rules! lanes {
    ($get:ident, $put:ident, $t:ty, $u:ty, $n:literal) => {
        #[inline(always)]
        fn $get(v: u128) -> [$t; $n] {
            from_fn(|i| (v >> (i * (128 / $n))) as $u as $t)
        }

        #[inline(always)]
        fn $put(lanes: [$t; $n]) -> u128 {
            lanes
                .iter()
                .enumerate()
                .fold(0u128, |acc, (i, &x)| acc | ((x as $u as u128) << (i * (128 / $n))))
        }
    };
}

lanes!(i8x16, from_i8x16, i8, u8, 16);
lanes!(u8x16, from_u8x16, u8, u8, 16);
lanes!(i16x8, from_i16x8, i16, u16, 8);
lanes!(u16x8, from_u16x8, u16, u16, 8);
lanes!(i32x4, from_i32x4, i32, u32, 4);
lanes!(u32x4, from_u32x4, u32, u32, 4);
lanes!(i64x2, from_i64x2, i64, u64, 2);
lanes!(u64x2, from_u64x2, u64, u64, 2);

#[inline(always)]
fn f32x4(v: u128) -> [f32; 4] {
    u32x4(v).map(f32::from_bits)
}

#[inline(always)]
fn from_f32x4(l: [f32; 4]) -> u128 {
    from_u32x4(l.map(f32::to_bits))
}

#[inline(always)]
fn f64x2(v: u128) -> [f64; 2] {
    u64x2(v).map(f64::from_bits)
}

#[inline(always)]
fn from_f64x2(l: [f64; 2]) -> u128 {
    from_u64x2(l.map(f64::to_bits))
}

macro_rules! unop {
    ($v:expr, $get:ident, $put:ident, |$a:ident| $e:expr) => {
        $put($get($v).map(|$a| $e))
    };
}

macro_rules! binop {
    ($x:expr, $y:expr, $get:ident, $put:ident, |$a:ident, $b:ident| $e:expr) => {{
        let (xs, ys) = ($get($x), $get($y));
        $put(from_fn(|i| {
            let ($a, $b) = (xs[i], ys[i]);
            $e
        }))
    }};
}

/// Lane-wise comparison producing all-ones / all-zeros masks.
macro_rules! cmp {
    ($x:expr, $y:expr, $get:ident, $put:ident, |$a:ident, $b:ident| $e:expr) => {
        binop!($x, $y, $get, $put, |$a, $b| if $e { -1 } else { 0 })
    };
}

/// Shift with the count taken modulo the lane width.
macro_rules! shift {
    ($v:expr, $count:expr, $bits:literal, $get:ident, $put:ident, |$a:ident, $s:ident| $e:expr) => {{
        let $s = ($count as u32) % $bits;
        unop!($v, $get, $put, |$a| $e)
    }};
}

macro_rules! narrow {
    ($x:expr, $y:expr, $get:ident, $put:ident, $n:literal, $lo:expr, $hi:expr, $t:ty) => {{
        let (xs, ys) = ($get($x), $get($y));
        $put(from_fn(|i| {
            let v = if i < $n { xs[i] } else { ys[i - $n] };
            v.clamp($lo, $hi) as $t
        }))
    }};
}

macro_rules! extend {
    ($v:expr, $get:ident, $put:ident, $offset:expr, $t:ty) => {{
        let xs = $get($v);
        $put(from_fn(|i| xs[i + $offset] as $t))
    }};
}

macro_rules! extmul {
    ($x:expr, $y:expr, $get:ident, $put:ident, $offset:expr, $t:ty) => {{
        let (xs, ys) = ($get($x), $get($y));
        $put(from_fn(|i| (xs[i + $offset] as $t).wrapping_mul(ys[i + $offset] as $t)))
    }};
}

macro_rules! pairwise {
    ($v:expr, $get:ident, $put:ident, $t:ty) => {{
        let xs = $get($v);
        $put(from_fn(|i| (xs[2 * i] as $t) + (xs[2 * i + 1] as $t)))
    }};
}

macro_rules! bitmask {
    ($v:expr, $get:ident) => {
        $get($v)
            .iter()
            .enumerate()
            .fold(0u128, |acc, (i, &x)| acc | (((x < 0) as u128) << i))
    };
}

macro_rules! all_true {
    ($v:expr, $get:ident) => {
        $get($v).iter().all(|&x| x != 0) as u128
    };
}

fn bitselect(a: u128, b: u128, mask: u128) -> u128 {
    (a & mask) | (b & !mask)
}

fn swizzle(a: u128, s: u128) -> u128 {
    let (xs, idx) = (u8x16(a), u8x16(s));
    from_u8x16(from_fn(|i| xs.get(idx[i] as usize).copied().unwrap_or(0)))
}

fn q15mulr_sat(a: i16, b: i16) -> i16 {
    ((a as i32 * b as i32 + 0x4000) >> 15).clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn relaxed_dot_i16(a: u128, b: u128) -> [i16; 8] {
    let (xs, ys) = (i8x16(a), i8x16(b));
    from_fn(|i| {
        let lo = xs[2 * i] as i16 * ys[2 * i] as i16;
        let hi = xs[2 * i + 1] as i16 * ys[2 * i + 1] as i16;
        lo.wrapping_add(hi)
    })
}

fn f32_pmin(a: f32, b: f32) -> f32 {
    if b < a { b } else { a }
}

fn f32_pmax(a: f32, b: f32) -> f32 {
    if a < b { b } else { a }
}

fn f64_pmin(a: f64, b: f64) -> f64 {
    if b < a { b } else { a }
}

fn f64_pmax(a: f64, b: f64) -> f64 {
    if a < b { b } else { a }
}

/// Evaluates `op`. Operands beyond the op's arity are ignored.
pub fn eval(op: SimdOp, a: u128, b: u128, c: u128) -> u128 {
    use SimdOp::*;

    match op {
        I8x16Swizzle | I8x16RelaxedSwizzle => swizzle(a, b),
        I8x16Splat => from_u8x16([a as u8; 16]),
        I16x8Splat => from_u16x8([a as u16; 8]),
        I32x4Splat | F32x4Splat => from_u32x4([a as u32; 4]),
        I64x2Splat | F64x2Splat => from_u64x2([a as u64; 2]),

        // ── Comparisons ──────────────────────────────────────────────────────
        I8x16Eq => cmp!(a, b, i8x16, from_i8x16, |x, y| x == y),
        I8x16Ne => cmp!(a, b, i8x16, from_i8x16, |x, y| x != y),
        I8x16LtS => cmp!(a, b, i8x16, from_i8x16, |x, y| x < y),
        I8x16LtU => cmp!(a, b, u8x16, from_i8x16, |x, y| x < y),
        I8x16GtS => cmp!(a, b, i8x16, from_i8x16, |x, y| x > y),
        I8x16GtU => cmp!(a, b, u8x16, from_i8x16, |x, y| x > y),
        I8x16LeS => cmp!(a, b, i8x16, from_i8x16, |x, y| x <= y),
        I8x16LeU => cmp!(a, b, u8x16, from_i8x16, |x, y| x <= y),
        I8x16GeS => cmp!(a, b, i8x16, from_i8x16, |x, y| x >= y),
        I8x16GeU => cmp!(a, b, u8x16, from_i8x16, |x, y| x >= y),
        I16x8Eq => cmp!(a, b, i16x8, from_i16x8, |x, y| x == y),
        I16x8Ne => cmp!(a, b, i16x8, from_i16x8, |x, y| x != y),
        I16x8LtS => cmp!(a, b, i16x8, from_i16x8, |x, y| x < y),
        I16x8LtU => cmp!(a, b, u16x8, from_i16x8, |x, y| x < y),
        I16x8GtS => cmp!(a, b, i16x8, from_i16x8, |x, y| x > y),
        I16x8GtU => cmp!(a, b, u16x8, from_i16x8, |x, y| x > y),
        I16x8LeS => cmp!(a, b, i16x8, from_i16x8, |x, y| x <= y),
        I16x8LeU => cmp!(a, b, u16x8, from_i16x8, |x, y| x <= y),
        I16x8GeS => cmp!(a, b, i16x8, from_i16x8, |x, y| x >= y),
        I16x8GeU => cmp!(a, b, u16x8, from_i16x8, |x, y| x >= y),
        I32x4Eq => cmp!(a, b, i32x4, from_i32x4, |x, y| x == y),
        I32x4Ne => cmp!(a, b, i32x4, from_i32x4, |x, y| x != y),
        I32x4LtS => cmp!(a, b, i32x4, from_i32x4, |x, y| x < y),
        I32x4LtU => cmp!(a, b, u32x4, from_i32x4, |x, y| x < y),
        I32x4GtS => cmp!(a, b, i32x4, from_i32x4, |x, y| x > y),
        I32x4GtU => cmp!(a, b, u32x4, from_i32x4, |x, y| x > y),
        I32x4LeS => cmp!(a, b, i32x4, from_i32x4, |x, y| x <= y),
        I32x4LeU => cmp!(a, b, u32x4, from_i32x4, |x, y| x <= y),
        I32x4GeS => cmp!(a, b, i32x4, from_i32x4, |x, y| x >= y),
        I32x4GeU => cmp!(a, b, u32x4, from_i32x4, |x, y| x >= y),
        I64x2Eq => cmp!(a, b, i64x2, from_i64x2, |x, y| x == y),
        I64x2Ne => cmp!(a, b, i64x2, from_i64x2, |x, y| x != y),
        I64x2LtS => cmp!(a, b, i64x2, from_i64x2, |x, y| x < y),
        I64x2GtS => cmp!(a, b, i64x2, from_i64x2, |x, y| x > y),
        I64x2LeS => cmp!(a, b, i64x2, from_i64x2, |x, y| x <= y),
        I64x2GeS => cmp!(a, b, i64x2, from_i64x2, |x, y| x >= y),
        F32x4Eq => cmp!(a, b, f32x4, from_i32x4, |x, y| x == y),
        F32x4Ne => cmp!(a, b, f32x4, from_i32x4, |x, y| x != y),
        F32x4Lt => cmp!(a, b, f32x4, from_i32x4, |x, y| x < y),
        F32x4Gt => cmp!(a, b, f32x4, from_i32x4, |x, y| x > y),
        F32x4Le => cmp!(a, b, f32x4, from_i32x4, |x, y| x <= y),
        F32x4Ge => cmp!(a, b, f32x4, from_i32x4, |x, y| x >= y),
        F64x2Eq => cmp!(a, b, f64x2, from_i64x2, |x, y| x == y),
        F64x2Ne => cmp!(a, b, f64x2, from_i64x2, |x, y| x != y),
        F64x2Lt => cmp!(a, b, f64x2, from_i64x2, |x, y| x < y),
        F64x2Gt => cmp!(a, b, f64x2, from_i64x2, |x, y| x > y),
        F64x2Le => cmp!(a, b, f64x2, from_i64x2, |x, y| x <= y),
        F64x2Ge => cmp!(a, b, f64x2, from_i64x2, |x, y| x >= y),

        // ── Bitwise ──────────────────────────────────────────────────────────
        V128Not => !a,
        V128And => a & b,
        V128AndNot => a & !b,
        V128Or => a | b,
        V128Xor => a ^ b,
        V128Bitselect
        | I8x16RelaxedLaneselect
        | I16x8RelaxedLaneselect
        | I32x4RelaxedLaneselect
        | I64x2RelaxedLaneselect => bitselect(a, b, c),
        V128AnyTrue => (a != 0) as u128,

        // ── i8x16 ────────────────────────────────────────────────────────────
        I8x16Abs => unop!(a, i8x16, from_i8x16, |x| x.wrapping_abs()),
        I8x16Neg => unop!(a, i8x16, from_i8x16, |x| x.wrapping_neg()),
        I8x16Popcnt => unop!(a, u8x16, from_u8x16, |x| x.count_ones() as u8),
        I8x16AllTrue => all_true!(a, u8x16),
        I8x16Bitmask => bitmask!(a, i8x16),
        I8x16NarrowI16x8S => narrow!(a, b, i16x8, from_i8x16, 8, -128, 127, i8),
        I8x16NarrowI16x8U => narrow!(a, b, i16x8, from_u8x16, 8, 0, 255, u8),
        I8x16Shl => shift!(a, b, 8, u8x16, from_u8x16, |x, s| x << s),
        I8x16ShrS => shift!(a, b, 8, i8x16, from_i8x16, |x, s| x >> s),
        I8x16ShrU => shift!(a, b, 8, u8x16, from_u8x16, |x, s| x >> s),
        I8x16Add => binop!(a, b, u8x16, from_u8x16, |x, y| x.wrapping_add(y)),
        I8x16AddSatS => binop!(a, b, i8x16, from_i8x16, |x, y| x.saturating_add(y)),
        I8x16AddSatU => binop!(a, b, u8x16, from_u8x16, |x, y| x.saturating_add(y)),
        I8x16Sub => binop!(a, b, u8x16, from_u8x16, |x, y| x.wrapping_sub(y)),
        I8x16SubSatS => binop!(a, b, i8x16, from_i8x16, |x, y| x.saturating_sub(y)),
        I8x16SubSatU => binop!(a, b, u8x16, from_u8x16, |x, y| x.saturating_sub(y)),
        I8x16MinS => binop!(a, b, i8x16, from_i8x16, |x, y| x.min(y)),
        I8x16MinU => binop!(a, b, u8x16, from_u8x16, |x, y| x.min(y)),
        I8x16MaxS => binop!(a, b, i8x16, from_i8x16, |x, y| x.max(y)),
        I8x16MaxU => binop!(a, b, u8x16, from_u8x16, |x, y| x.max(y)),
        I8x16AvgrU => binop!(a, b, u8x16, from_u8x16, |x, y| ((x as u16 + y as u16 + 1) >> 1) as u8),

        // ── i16x8 ────────────────────────────────────────────────────────────
        I16x8ExtaddPairwiseI8x16S => pairwise!(a, i8x16, from_i16x8, i16),
        I16x8ExtaddPairwiseI8x16U => pairwise!(a, u8x16, from_u16x8, u16),
        I16x8Abs => unop!(a, i16x8, from_i16x8, |x| x.wrapping_abs()),
        I16x8Neg => unop!(a, i16x8, from_i16x8, |x| x.wrapping_neg()),
        I16x8Q15MulrSatS | I16x8RelaxedQ15mulrS => binop!(a, b, i16x8, from_i16x8, |x, y| q15mulr_sat(x, y)),
        I16x8AllTrue => all_true!(a, u16x8),
        I16x8Bitmask => bitmask!(a, i16x8),
        I16x8NarrowI32x4S => narrow!(a, b, i32x4, from_i16x8, 4, -32768, 32767, i16),
        I16x8NarrowI32x4U => narrow!(a, b, i32x4, from_u16x8, 4, 0, 65535, u16),
        I16x8ExtendLowI8x16S => extend!(a, i8x16, from_i16x8, 0, i16),
        I16x8ExtendHighI8x16S => extend!(a, i8x16, from_i16x8, 8, i16),
        I16x8ExtendLowI8x16U => extend!(a, u8x16, from_u16x8, 0, u16),
        I16x8ExtendHighI8x16U => extend!(a, u8x16, from_u16x8, 8, u16),
        I16x8Shl => shift!(a, b, 16, u16x8, from_u16x8, |x, s| x << s),
        I16x8ShrS => shift!(a, b, 16, i16x8, from_i16x8, |x, s| x >> s),
        I16x8ShrU => shift!(a, b, 16, u16x8, from_u16x8, |x, s| x >> s),
        I16x8Add => binop!(a, b, u16x8, from_u16x8, |x, y| x.wrapping_add(y)),
        I16x8AddSatS => binop!(a, b, i16x8, from_i16x8, |x, y| x.saturating_add(y)),
        I16x8AddSatU => binop!(a, b, u16x8, from_u16x8, |x, y| x.saturating_add(y)),
        I16x8Sub => binop!(a, b, u16x8, from_u16x8, |x, y| x.wrapping_sub(y)),
        I16x8SubSatS => binop!(a, b, i16x8, from_i16x8, |x, y| x.saturating_sub(y)),
        I16x8SubSatU => binop!(a, b, u16x8, from_u16x8, |x, y| x.saturating_sub(y)),
        I16x8Mul => binop!(a, b, u16x8, from_u16x8, |x, y| x.wrapping_mul(y)),
        I16x8MinS => binop!(a, b, i16x8, from_i16x8, |x, y| x.min(y)),
        I16x8MinU => binop!(a, b, u16x8, from_u16x8, |x, y| x.min(y)),
        I16x8MaxS => binop!(a, b, i16x8, from_i16x8, |x, y| x.max(y)),
        I16x8MaxU => binop!(a, b, u16x8, from_u16x8, |x, y| x.max(y)),
        I16x8AvgrU => binop!(a, b, u16x8, from_u16x8, |x, y| ((x as u32 + y as u32 + 1) >> 1) as u16),
        I16x8ExtmulLowI8x16S => extmul!(a, b, i8x16, from_i16x8, 0, i16),
        I16x8ExtmulHighI8x16S => extmul!(a, b, i8x16, from_i16x8, 8, i16),
        I16x8ExtmulLowI8x16U => extmul!(a, b, u8x16, from_u16x8, 0, u16),
        I16x8ExtmulHighI8x16U => extmul!(a, b, u8x16, from_u16x8, 8, u16),
        I16x8RelaxedDotI8x16I7x16S => from_i16x8(relaxed_dot_i16(a, b)),

        // ── i32x4 ────────────────────────────────────────────────────────────
        I32x4ExtaddPairwiseI16x8S => pairwise!(a, i16x8, from_i32x4, i32),
        I32x4ExtaddPairwiseI16x8U => pairwise!(a, u16x8, from_u32x4, u32),
        I32x4Abs => unop!(a, i32x4, from_i32x4, |x| x.wrapping_abs()),
        I32x4Neg => unop!(a, i32x4, from_i32x4, |x| x.wrapping_neg()),
        I32x4AllTrue => all_true!(a, u32x4),
        I32x4Bitmask => bitmask!(a, i32x4),
        I32x4ExtendLowI16x8S => extend!(a, i16x8, from_i32x4, 0, i32),
        I32x4ExtendHighI16x8S => extend!(a, i16x8, from_i32x4, 4, i32),
        I32x4ExtendLowI16x8U => extend!(a, u16x8, from_u32x4, 0, u32),
        I32x4ExtendHighI16x8U => extend!(a, u16x8, from_u32x4, 4, u32),
        I32x4Shl => shift!(a, b, 32, u32x4, from_u32x4, |x, s| x << s),
        I32x4ShrS => shift!(a, b, 32, i32x4, from_i32x4, |x, s| x >> s),
        I32x4ShrU => shift!(a, b, 32, u32x4, from_u32x4, |x, s| x >> s),
        I32x4Add => binop!(a, b, u32x4, from_u32x4, |x, y| x.wrapping_add(y)),
        I32x4Sub => binop!(a, b, u32x4, from_u32x4, |x, y| x.wrapping_sub(y)),
        I32x4Mul => binop!(a, b, u32x4, from_u32x4, |x, y| x.wrapping_mul(y)),
        I32x4MinS => binop!(a, b, i32x4, from_i32x4, |x, y| x.min(y)),
        I32x4MinU => binop!(a, b, u32x4, from_u32x4, |x, y| x.min(y)),
        I32x4MaxS => binop!(a, b, i32x4, from_i32x4, |x, y| x.max(y)),
        I32x4MaxU => binop!(a, b, u32x4, from_u32x4, |x, y| x.max(y)),
        I32x4DotI16x8S => {
            let (xs, ys) = (i16x8(a), i16x8(b));
            from_i32x4(from_fn(|i| {
                let lo = xs[2 * i] as i32 * ys[2 * i] as i32;
                let hi = xs[2 * i + 1] as i32 * ys[2 * i + 1] as i32;
                lo.wrapping_add(hi)
            }))
        }
        I32x4ExtmulLowI16x8S => extmul!(a, b, i16x8, from_i32x4, 0, i32),
        I32x4ExtmulHighI16x8S => extmul!(a, b, i16x8, from_i32x4, 4, i32),
        I32x4ExtmulLowI16x8U => extmul!(a, b, u16x8, from_u32x4, 0, u32),
        I32x4ExtmulHighI16x8U => extmul!(a, b, u16x8, from_u32x4, 4, u32),
        I32x4RelaxedDotI8x16I7x16AddS => {
            let dot = relaxed_dot_i16(a, b);
            let acc = i32x4(c);
            from_i32x4(from_fn(|i| (dot[2 * i] as i32 + dot[2 * i + 1] as i32).wrapping_add(acc[i])))
        }

        // ── i64x2 ────────────────────────────────────────────────────────────
        I64x2Abs => unop!(a, i64x2, from_i64x2, |x| x.wrapping_abs()),
        I64x2Neg => unop!(a, i64x2, from_i64x2, |x| x.wrapping_neg()),
        I64x2AllTrue => all_true!(a, u64x2),
        I64x2Bitmask => bitmask!(a, i64x2),
        I64x2ExtendLowI32x4S => extend!(a, i32x4, from_i64x2, 0, i64),
        I64x2ExtendHighI32x4S => extend!(a, i32x4, from_i64x2, 2, i64),
        I64x2ExtendLowI32x4U => extend!(a, u32x4, from_u64x2, 0, u64),
        I64x2ExtendHighI32x4U => extend!(a, u32x4, from_u64x2, 2, u64),
        I64x2Shl => shift!(a, b, 64, u64x2, from_u64x2, |x, s| x << s),
        I64x2ShrS => shift!(a, b, 64, i64x2, from_i64x2, |x, s| x >> s),
        I64x2ShrU => shift!(a, b, 64, u64x2, from_u64x2, |x, s| x >> s),
        I64x2Add => binop!(a, b, u64x2, from_u64x2, |x, y| x.wrapping_add(y)),
        I64x2Sub => binop!(a, b, u64x2, from_u64x2, |x, y| x.wrapping_sub(y)),
        I64x2Mul => binop!(a, b, u64x2, from_u64x2, |x, y| x.wrapping_mul(y)),
        I64x2ExtmulLowI32x4S => extmul!(a, b, i32x4, from_i64x2, 0, i64),
        I64x2ExtmulHighI32x4S => extmul!(a, b, i32x4, from_i64x2, 2, i64),
        I64x2ExtmulLowI32x4U => extmul!(a, b, u32x4, from_u64x2, 0, u64),
        I64x2ExtmulHighI32x4U => extmul!(a, b, u32x4, from_u64x2, 2, u64),

        // ── f32x4 ────────────────────────────────────────────────────────────
        F32x4Abs => unop!(a, u32x4, from_u32x4, |x| x & 0x7FFF_FFFF),
        F32x4Neg => unop!(a, u32x4, from_u32x4, |x| x ^ 0x8000_0000),
        F32x4Sqrt => unop!(a, f32x4, from_f32x4, |x| x.sqrt()),
        F32x4Ceil => unop!(a, f32x4, from_f32x4, |x| x.ceil()),
        F32x4Floor => unop!(a, f32x4, from_f32x4, |x| x.floor()),
        F32x4Trunc => unop!(a, f32x4, from_f32x4, |x| x.trunc()),
        F32x4Nearest => unop!(a, f32x4, from_f32x4, |x| x.round_ties_even()),
        F32x4Add => binop!(a, b, f32x4, from_f32x4, |x, y| x + y),
        F32x4Sub => binop!(a, b, f32x4, from_f32x4, |x, y| x - y),
        F32x4Mul => binop!(a, b, f32x4, from_f32x4, |x, y| x * y),
        F32x4Div => binop!(a, b, f32x4, from_f32x4, |x, y| x / y),
        F32x4Min | F32x4RelaxedMin => binop!(a, b, f32x4, from_f32x4, |x, y| f32_min(x, y)),
        F32x4Max | F32x4RelaxedMax => binop!(a, b, f32x4, from_f32x4, |x, y| f32_max(x, y)),
        F32x4Pmin => binop!(a, b, f32x4, from_f32x4, |x, y| f32_pmin(x, y)),
        F32x4Pmax => binop!(a, b, f32x4, from_f32x4, |x, y| f32_pmax(x, y)),
        F32x4RelaxedMadd | F32x4RelaxedNmadd => {
            let (xs, ys, zs) = (f32x4(a), f32x4(b), f32x4(c));
            let negate = op == F32x4RelaxedNmadd;
            from_f32x4(from_fn(|i| {
                let x = if negate { -xs[i] } else { xs[i] };
                x.mul_add(ys[i], zs[i])
            }))
        }

        // ── f64x2 ────────────────────────────────────────────────────────────
        F64x2Abs => unop!(a, u64x2, from_u64x2, |x| x & 0x7FFF_FFFF_FFFF_FFFF),
        F64x2Neg => unop!(a, u64x2, from_u64x2, |x| x ^ 0x8000_0000_0000_0000),
        F64x2Sqrt => unop!(a, f64x2, from_f64x2, |x| x.sqrt()),
        F64x2Ceil => unop!(a, f64x2, from_f64x2, |x| x.ceil()),
        F64x2Floor => unop!(a, f64x2, from_f64x2, |x| x.floor()),
        F64x2Trunc => unop!(a, f64x2, from_f64x2, |x| x.trunc()),
        F64x2Nearest => unop!(a, f64x2, from_f64x2, |x| x.round_ties_even()),
        F64x2Add => binop!(a, b, f64x2, from_f64x2, |x, y| x + y),
        F64x2Sub => binop!(a, b, f64x2, from_f64x2, |x, y| x - y),
        F64x2Mul => binop!(a, b, f64x2, from_f64x2, |x, y| x * y),
        F64x2Div => binop!(a, b, f64x2, from_f64x2, |x, y| x / y),
        F64x2Min | F64x2RelaxedMin => binop!(a, b, f64x2, from_f64x2, |x, y| f64_min(x, y)),
        F64x2Max | F64x2RelaxedMax => binop!(a, b, f64x2, from_f64x2, |x, y| f64_max(x, y)),
        F64x2Pmin => binop!(a, b, f64x2, from_f64x2, |x, y| f64_pmin(x, y)),
        F64x2Pmax => binop!(a, b, f64x2, from_f64x2, |x, y| f64_pmax(x, y)),
        F64x2RelaxedMadd | F64x2RelaxedNmadd => {
            let (xs, ys, zs) = (f64x2(a), f64x2(b), f64x2(c));
            let negate = op == F64x2RelaxedNmadd;
            from_f64x2(from_fn(|i| {
                let x = if negate { -xs[i] } else { xs[i] };
                x.mul_add(ys[i], zs[i])
            }))
        }

        // ── Conversions ──────────────────────────────────────────────────────
        F32x4DemoteF64x2Zero => {
            let xs = f64x2(a);
            from_f32x4([xs[0] as f32, xs[1] as f32, 0.0, 0.0])
        }
        F64x2PromoteLowF32x4 => {
            let xs = f32x4(a);
            from_f64x2([xs[0] as f64, xs[1] as f64])
        }
        I32x4TruncSatF32x4S | I32x4RelaxedTruncF32x4S => unop!(a, f32x4, from_i32x4, |x| x as i32),
        I32x4TruncSatF32x4U | I32x4RelaxedTruncF32x4U => unop!(a, f32x4, from_u32x4, |x| x as u32),
        F32x4ConvertI32x4S => unop!(a, i32x4, from_f32x4, |x| x as f32),
        F32x4ConvertI32x4U => unop!(a, u32x4, from_f32x4, |x| x as f32),
        I32x4TruncSatF64x2SZero | I32x4RelaxedTruncF64x2SZero => {
            let xs = f64x2(a);
            from_i32x4([xs[0] as i32, xs[1] as i32, 0, 0])
        }
        I32x4TruncSatF64x2UZero | I32x4RelaxedTruncF64x2UZero => {
            let xs = f64x2(a);
            from_u32x4([xs[0] as u32, xs[1] as u32, 0, 0])
        }
        F64x2ConvertLowI32x4S => {
            let xs = i32x4(a);
            from_f64x2([xs[0] as f64, xs[1] as f64])
        }
        F64x2ConvertLowI32x4U => {
            let xs = u32x4(a);
            from_f64x2([xs[0] as f64, xs[1] as f64])
        }
    }
}

/// `i8x16.shuffle`: lane `i` of the result is lane `lanes[i]` of `a ++ b`.
pub fn shuffle(a: u128, b: u128, lanes: &[u8; 16]) -> u128 {
    let (xs, ys) = (u8x16(a), u8x16(b));
    from_u8x16(from_fn(|i| {
        let l = (lanes[i] & 31) as usize;
        if l < 16 { xs[l] } else { ys[l - 16] }
    }))
}

// ── Lane access ──────────────────────────────────────────────────────────────

/// `extract_lane` / `replace_lane`, keyed by `0xFD` sub-opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneOp {
    I8x16ExtractLaneS = 0x15,
    I8x16ExtractLaneU = 0x16,
    I8x16ReplaceLane = 0x17,
    I16x8ExtractLaneS = 0x18,
    I16x8ExtractLaneU = 0x19,
    I16x8ReplaceLane = 0x1A,
    I32x4ExtractLane = 0x1B,
    I32x4ReplaceLane = 0x1C,
    I64x2ExtractLane = 0x1D,
    I64x2ReplaceLane = 0x1E,
    F32x4ExtractLane = 0x1F,
    F32x4ReplaceLane = 0x20,
    F64x2ExtractLane = 0x21,
    F64x2ReplaceLane = 0x22,
}

const LANE_OPS: [LaneOp; 14] = [
    LaneOp::I8x16ExtractLaneS,
    LaneOp::I8x16ExtractLaneU,
    LaneOp::I8x16ReplaceLane,
    LaneOp::I16x8ExtractLaneS,
    LaneOp::I16x8ExtractLaneU,
    LaneOp::I16x8ReplaceLane,
    LaneOp::I32x4ExtractLane,
    LaneOp::I32x4ReplaceLane,
    LaneOp::I64x2ExtractLane,
    LaneOp::I64x2ReplaceLane,
    LaneOp::F32x4ExtractLane,
    LaneOp::F32x4ReplaceLane,
    LaneOp::F64x2ExtractLane,
    LaneOp::F64x2ReplaceLane,
];

impl LaneOp {
    pub fn from_code(code: u16) -> Option<Self> {
        LANE_OPS.get(code.checked_sub(0x15)? as usize).copied()
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_replace(self) -> bool {
        matches!(
            self,
            LaneOp::I8x16ReplaceLane
                | LaneOp::I16x8ReplaceLane
                | LaneOp::I32x4ReplaceLane
                | LaneOp::I64x2ReplaceLane
                | LaneOp::F32x4ReplaceLane
                | LaneOp::F64x2ReplaceLane
        )
    }

    pub fn lane_bits(self) -> u32 {
        match self {
            LaneOp::I8x16ExtractLaneS | LaneOp::I8x16ExtractLaneU | LaneOp::I8x16ReplaceLane => 8,
            LaneOp::I16x8ExtractLaneS | LaneOp::I16x8ExtractLaneU | LaneOp::I16x8ReplaceLane => 16,
            LaneOp::I32x4ExtractLane
            | LaneOp::I32x4ReplaceLane
            | LaneOp::F32x4ExtractLane
            | LaneOp::F32x4ReplaceLane => 32,
            LaneOp::I64x2ExtractLane
            | LaneOp::I64x2ReplaceLane
            | LaneOp::F64x2ExtractLane
            | LaneOp::F64x2ReplaceLane => 64,
        }
    }
}

#[inline]
fn lane_mask(bits: u32) -> u128 {
    (1u128 << bits) - 1
}

/// Scalar bits of lane `lane`, zero-extended as a stack slot expects.
pub fn extract_lane(op: LaneOp, v: u128, lane: u8) -> u128 {
    let bits = op.lane_bits();
    let raw = (v >> (lane as u32 * bits)) & lane_mask(bits);
    match op {
        LaneOp::I8x16ExtractLaneS => raw as u8 as i8 as i32 as u32 as u128,
        LaneOp::I16x8ExtractLaneS => raw as u16 as i16 as i32 as u32 as u128,
        _ => raw,
    }
}

pub fn replace_lane(op: LaneOp, v: u128, scalar: u128, lane: u8) -> u128 {
    let bits = op.lane_bits();
    let shift = lane as u32 * bits;
    let mask = lane_mask(bits) << shift;
    (v & !mask) | ((scalar << shift) & mask)
}

/// Lane width of `v128.load*_lane` / `v128.store*_lane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneWidth {
    B8,
    B16,
    B32,
    B64,
}

impl LaneWidth {
    pub fn bytes(self) -> u32 {
        match self {
            LaneWidth::B8 => 1,
            LaneWidth::B16 => 2,
            LaneWidth::B32 => 4,
            LaneWidth::B64 => 8,
        }
    }

    /// Decodes `0x54..=0x5B` into a width and whether it is a store.
    pub fn from_code(code: u16) -> Option<(Self, bool)> {
        const W: [LaneWidth; 4] = [LaneWidth::B8, LaneWidth::B16, LaneWidth::B32, LaneWidth::B64];
        let i = code.checked_sub(0x54)? as usize;
        (i < 8).then(|| (W[i % 4], i >= 4))
    }

    pub fn code(self, store: bool) -> u16 {
        let base = if store { 0x58 } else { 0x54 };
        base + self.bytes().trailing_zeros() as u16
    }

    /// Replaces lane `lane` of `v` with the low bits of `raw`.
    pub fn insert(self, v: u128, raw: u64, lane: u8) -> u128 {
        let bits = self.bytes() * 8;
        let shift = lane as u32 * bits;
        let mask = lane_mask(bits) << shift;
        (v & !mask) | (((raw as u128) << shift) & mask)
    }

    pub fn extract(self, v: u128, lane: u8) -> u64 {
        let bits = self.bytes() * 8;
        ((v >> (lane as u32 * bits)) & lane_mask(bits)) as u64
    }
}

/// Vector loads other than plain `v128.load`, keyed by sub-opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimdLoadOp {
    Load = 0x00,
    Load8x8S = 0x01,
    Load8x8U = 0x02,
    Load16x4S = 0x03,
    Load16x4U = 0x04,
    Load32x2S = 0x05,
    Load32x2U = 0x06,
    Load8Splat = 0x07,
    Load16Splat = 0x08,
    Load32Splat = 0x09,
    Load64Splat = 0x0A,
    Load32Zero = 0x5C,
    Load64Zero = 0x5D,
}

impl SimdLoadOp {
    pub fn from_code(code: u16) -> Option<Self> {
        use SimdLoadOp::*;
        Some(match code {
            0x00 => Load,
            0x01 => Load8x8S,
            0x02 => Load8x8U,
            0x03 => Load16x4S,
            0x04 => Load16x4U,
            0x05 => Load32x2S,
            0x06 => Load32x2U,
            0x07 => Load8Splat,
            0x08 => Load16Splat,
            0x09 => Load32Splat,
            0x0A => Load64Splat,
            0x5C => Load32Zero,
            0x5D => Load64Zero,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Bytes read from memory.
    pub fn bytes(self) -> u32 {
        use SimdLoadOp::*;
        match self {
            Load => 16,
            Load8x8S | Load8x8U | Load16x4S | Load16x4U | Load32x2S | Load32x2U => 8,
            Load8Splat => 1,
            Load16Splat => 2,
            Load32Splat | Load32Zero => 4,
            Load64Splat | Load64Zero => 8,
        }
    }

    /// Builds the vector from the (at most 8) little-endian bytes read.
    /// `Load` is handled by the caller since it reads 16 bytes.
    pub fn expand(self, raw: u64) -> u128 {
        use SimdLoadOp::*;
        match self {
            Load8x8S => from_i16x8(from_fn(|i| (raw >> (i * 8)) as u8 as i8 as i16)),
            Load8x8U => from_u16x8(from_fn(|i| (raw >> (i * 8)) as u8 as u16)),
            Load16x4S => from_i32x4(from_fn(|i| (raw >> (i * 16)) as u16 as i16 as i32)),
            Load16x4U => from_u32x4(from_fn(|i| (raw >> (i * 16)) as u16 as u32)),
            Load32x2S => from_i64x2(from_fn(|i| (raw >> (i * 32)) as u32 as i32 as i64)),
            Load32x2U => from_u64x2(from_fn(|i| (raw >> (i * 32)) as u32 as u64)),
            Load8Splat => from_u8x16([raw as u8; 16]),
            Load16Splat => from_u16x8([raw as u16; 8]),
            Load32Splat => from_u32x4([raw as u32; 4]),
            Load64Splat => from_u64x2([raw; 2]),
            Load32Zero => raw as u32 as u128,
            Load64Zero | Load => raw as u128,
        }
    }
}
