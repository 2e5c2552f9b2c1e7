//! Scalar numeric instructions.
//!
//! Operands and results travel as raw stack-slot bits (`u128`, narrow values
//! zero-extended), so the interpreter never needs to know the types here.
//! Float results come straight from IEEE arithmetic; sign operations and
//! reinterpretations are bit operations and never touch NaN payloads.

use crate::trap::{Failure, Result, Trap};

macro_rules! numeric_ops {
    ($( $name:ident = $code:literal, $arity:literal; )*) => {
        /// An immediate-free scalar instruction. `code` is the WebAssembly
        /// opcode; `0xFCxx` codes live behind the misc prefix.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NumOp {
            $( $name, )*
        }

        impl NumOp {
            pub const fn code(self) -> u16 {
                match self {
                    $( NumOp::$name => $code, )*
                }
            }

            pub const fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(NumOp::$name), )*
                    _ => None,
                }
            }

            /// Number of operands popped. Every numeric op pushes one result.
            pub const fn arity(self) -> usize {
                match self {
                    $( NumOp::$name => $arity, )*
                }
            }
        }
    };
}

numeric_ops! {
    I32Eqz = 0x45, 1; I32Eq = 0x46, 2; I32Ne = 0x47, 2; I32LtS = 0x48, 2; I32LtU = 0x49, 2;
    I32GtS = 0x4A, 2; I32GtU = 0x4B, 2; I32LeS = 0x4C, 2; I32LeU = 0x4D, 2; I32GeS = 0x4E, 2;
    I32GeU = 0x4F, 2;
    I64Eqz = 0x50, 1; I64Eq = 0x51, 2; I64Ne = 0x52, 2; I64LtS = 0x53, 2; I64LtU = 0x54, 2;
    I64GtS = 0x55, 2; I64GtU = 0x56, 2; I64LeS = 0x57, 2; I64LeU = 0x58, 2; I64GeS = 0x59, 2;
    I64GeU = 0x5A, 2;
    F32Eq = 0x5B, 2; F32Ne = 0x5C, 2; F32Lt = 0x5D, 2; F32Gt = 0x5E, 2; F32Le = 0x5F, 2;
    F32Ge = 0x60, 2;
    F64Eq = 0x61, 2; F64Ne = 0x62, 2; F64Lt = 0x63, 2; F64Gt = 0x64, 2; F64Le = 0x65, 2;
    F64Ge = 0x66, 2;
    I32Clz = 0x67, 1; I32Ctz = 0x68, 1; I32Popcnt = 0x69, 1; I32Add = 0x6A, 2; I32Sub = 0x6B, 2;
    I32Mul = 0x6C, 2; I32DivS = 0x6D, 2; I32DivU = 0x6E, 2; I32RemS = 0x6F, 2; I32RemU = 0x70, 2;
    I32And = 0x71, 2; I32Or = 0x72, 2; I32Xor = 0x73, 2; I32Shl = 0x74, 2; I32ShrS = 0x75, 2;
    I32ShrU = 0x76, 2; I32Rotl = 0x77, 2; I32Rotr = 0x78, 2;
    I64Clz = 0x79, 1; I64Ctz = 0x7A, 1; I64Popcnt = 0x7B, 1; I64Add = 0x7C, 2; I64Sub = 0x7D, 2;
    I64Mul = 0x7E, 2; I64DivS = 0x7F, 2; I64DivU = 0x80, 2; I64RemS = 0x81, 2; I64RemU = 0x82, 2;
    I64And = 0x83, 2; I64Or = 0x84, 2; I64Xor = 0x85, 2; I64Shl = 0x86, 2; I64ShrS = 0x87, 2;
    I64ShrU = 0x88, 2; I64Rotl = 0x89, 2; I64Rotr = 0x8A, 2;
    F32Abs = 0x8B, 1; F32Neg = 0x8C, 1; F32Ceil = 0x8D, 1; F32Floor = 0x8E, 1; F32Trunc = 0x8F, 1;
    F32Nearest = 0x90, 1; F32Sqrt = 0x91, 1; F32Add = 0x92, 2; F32Sub = 0x93, 2; F32Mul = 0x94, 2;
    F32Div = 0x95, 2; F32Min = 0x96, 2; F32Max = 0x97, 2; F32Copysign = 0x98, 2;
    F64Abs = 0x99, 1; F64Neg = 0x9A, 1; F64Ceil = 0x9B, 1; F64Floor = 0x9C, 1; F64Trunc = 0x9D, 1;
    F64Nearest = 0x9E, 1; F64Sqrt = 0x9F, 1; F64Add = 0xA0, 2; F64Sub = 0xA1, 2; F64Mul = 0xA2, 2;
    F64Div = 0xA3, 2; F64Min = 0xA4, 2; F64Max = 0xA5, 2; F64Copysign = 0xA6, 2;
    I32WrapI64 = 0xA7, 1; I32TruncF32S = 0xA8, 1; I32TruncF32U = 0xA9, 1; I32TruncF64S = 0xAA, 1;
    I32TruncF64U = 0xAB, 1; I64ExtendI32S = 0xAC, 1; I64ExtendI32U = 0xAD, 1;
    I64TruncF32S = 0xAE, 1; I64TruncF32U = 0xAF, 1; I64TruncF64S = 0xB0, 1; I64TruncF64U = 0xB1, 1;
    F32ConvertI32S = 0xB2, 1; F32ConvertI32U = 0xB3, 1; F32ConvertI64S = 0xB4, 1;
    F32ConvertI64U = 0xB5, 1; F32DemoteF64 = 0xB6, 1; F64ConvertI32S = 0xB7, 1;
    F64ConvertI32U = 0xB8, 1; F64ConvertI64S = 0xB9, 1; F64ConvertI64U = 0xBA, 1;
    F64PromoteF32 = 0xBB, 1; I32ReinterpretF32 = 0xBC, 1; I64ReinterpretF64 = 0xBD, 1;
    F32ReinterpretI32 = 0xBE, 1; F64ReinterpretI64 = 0xBF, 1;
    I32Extend8S = 0xC0, 1; I32Extend16S = 0xC1, 1; I64Extend8S = 0xC2, 1; I64Extend16S = 0xC3, 1;
    I64Extend32S = 0xC4, 1;
    I32TruncSatF32S = 0xFC00, 1; I32TruncSatF32U = 0xFC01, 1; I32TruncSatF64S = 0xFC02, 1;
    I32TruncSatF64U = 0xFC03, 1; I64TruncSatF32S = 0xFC04, 1; I64TruncSatF32U = 0xFC05, 1;
    I64TruncSatF64S = 0xFC06, 1; I64TruncSatF64U = 0xFC07, 1;
}

impl NumOp {
    /// Sub-opcode behind the misc prefix, for the saturating truncations.
    pub const fn misc_code(self) -> Option<u8> {
        let code = self.code();
        if code >= 0xFC00 { Some((code & 0xFF) as u8) } else { None }
    }
}

// ── Truncation boundaries ────────────────────────────────────────────────────
//
// Inclusive bounds on the source value for each float → int pairing. Values
// outside trap with IntOverflow; `as` casts are only used inside the bounds.

const MIN_F32_TO_I32: f32 = -2147483648.0;
const MAX_F32_TO_I32: f32 = 2147483520.0;
const MIN_F32_TO_U32: f32 = -0.99999994;
const MAX_F32_TO_U32: f32 = 4294967040.0;
const MIN_F64_TO_I32: f64 = -2147483648.9999998;
const MAX_F64_TO_I32: f64 = 2147483647.9999998;
const MIN_F64_TO_U32: f64 = -0.9999999999999999;
const MAX_F64_TO_U32: f64 = 4294967295.9999995;
const MIN_F32_TO_I64: f32 = -9223372036854775808.0;
const MAX_F32_TO_I64: f32 = 9223371487098961920.0;
const MIN_F32_TO_U64: f32 = -0.99999994;
const MAX_F32_TO_U64: f32 = 18446742974197923840.0;
const MIN_F64_TO_I64: f64 = -9223372036854775808.0;
const MAX_F64_TO_I64: f64 = 9223372036854774784.0;
const MIN_F64_TO_U64: f64 = -0.9999999999999999;
const MAX_F64_TO_U64: f64 = 18446744073709549568.0;

macro_rules! trunc_fn {
    ($name:ident, $from:ty, $to:ty, $min:expr, $max:expr) => {
        pub fn $name(x: $from) -> Result<$to> {
            if x.is_nan() {
                return Err(Failure::InvalidConversionToInt.into());
            }
            if x < $min || x > $max {
                return Err(Failure::IntOverflow.into());
            }
            Ok(x as $to)
        }
    };
}

trunc_fn!(i32_trunc_f32_s, f32, i32, MIN_F32_TO_I32, MAX_F32_TO_I32);
trunc_fn!(i32_trunc_f32_u, f32, u32, MIN_F32_TO_U32, MAX_F32_TO_U32);
trunc_fn!(i32_trunc_f64_s, f64, i32, MIN_F64_TO_I32, MAX_F64_TO_I32);
trunc_fn!(i32_trunc_f64_u, f64, u32, MIN_F64_TO_U32, MAX_F64_TO_U32);
trunc_fn!(i64_trunc_f32_s, f32, i64, MIN_F32_TO_I64, MAX_F32_TO_I64);
trunc_fn!(i64_trunc_f32_u, f32, u64, MIN_F32_TO_U64, MAX_F32_TO_U64);
trunc_fn!(i64_trunc_f64_s, f64, i64, MIN_F64_TO_I64, MAX_F64_TO_I64);
trunc_fn!(i64_trunc_f64_u, f64, u64, MIN_F64_TO_U64, MAX_F64_TO_U64);

// ── Integer division ─────────────────────────────────────────────────────────

macro_rules! div_fns {
    ($div_s:ident, $div_u:ident, $rem_s:ident, $rem_u:ident, $s:ty, $u:ty) => {
        pub fn $div_s(a: $s, b: $s) -> Result<$s> {
            if b == 0 {
                return Err(Failure::IntDivideByZero.into());
            }
            if a == <$s>::MIN && b == -1 {
                return Err(Failure::IntOverflow.into());
            }
            Ok(a / b)
        }

        pub fn $div_u(a: $u, b: $u) -> Result<$u> {
            if b == 0 {
                return Err(Failure::IntDivideByZero.into());
            }
            Ok(a / b)
        }

        pub fn $rem_s(a: $s, b: $s) -> Result<$s> {
            if b == 0 {
                return Err(Failure::IntDivideByZero.into());
            }
            Ok(a.wrapping_rem(b))
        }

        pub fn $rem_u(a: $u, b: $u) -> Result<$u> {
            if b == 0 {
                return Err(Failure::IntDivideByZero.into());
            }
            Ok(a % b)
        }
    };
}

div_fns!(i32_div_s, i32_div_u, i32_rem_s, i32_rem_u, i32, u32);
div_fns!(i64_div_s, i64_div_u, i64_rem_s, i64_rem_u, i64, u64);

// ── Float helpers ────────────────────────────────────────────────────────────

macro_rules! float_fns {
    ($min:ident, $max:ident, $copysign:ident, $abs:ident, $neg:ident, $f:ty, $sign:expr) => {
        /// NaN-propagating minimum where `-0.0 < +0.0`.
        pub fn $min(a: $f, b: $f) -> $f {
            if a.is_nan() || b.is_nan() {
                return a + b;
            }
            if a == b {
                return <$f>::from_bits(a.to_bits() | b.to_bits());
            }
            if a < b { a } else { b }
        }

        /// NaN-propagating maximum where `+0.0 > -0.0`.
        pub fn $max(a: $f, b: $f) -> $f {
            if a.is_nan() || b.is_nan() {
                return a + b;
            }
            if a == b {
                return <$f>::from_bits(a.to_bits() & b.to_bits());
            }
            if a > b { a } else { b }
        }

        pub fn $copysign(a: $f, b: $f) -> $f {
            <$f>::from_bits((a.to_bits() & !$sign) | (b.to_bits() & $sign))
        }

        pub fn $abs(a: $f) -> $f {
            <$f>::from_bits(a.to_bits() & !$sign)
        }

        pub fn $neg(a: $f) -> $f {
            <$f>::from_bits(a.to_bits() ^ $sign)
        }
    };
}

float_fns!(f32_min, f32_max, f32_copysign, f32_abs, f32_neg, f32, 0x8000_0000u32);
float_fns!(f64_min, f64_max, f64_copysign, f64_abs, f64_neg, f64, 0x8000_0000_0000_0000u64);

#[inline]
fn i32v(v: i32) -> u128 {
    v as u32 as u128
}

#[inline]
fn u32v(v: u32) -> u128 {
    v as u128
}

#[inline]
fn i64v(v: i64) -> u128 {
    v as u64 as u128
}

#[inline]
fn u64v(v: u64) -> u128 {
    v as u128
}

#[inline]
fn f32v(v: f32) -> u128 {
    v.to_bits() as u128
}

#[inline]
fn f64v(v: f64) -> u128 {
    v.to_bits() as u128
}

#[inline]
fn bool(v: bool) -> u128 {
    v as u128
}

/// Evaluates `op` on slot bits. Unary ops ignore `b`.
pub fn eval(op: NumOp, a: u128, b: u128) -> Result<u128> {
    use NumOp::*;

    let (ia, ib) = (a as u32 as i32, b as u32 as i32);
    let (ua, ub) = (a as u32, b as u32);
    let (la, lb) = (a as u64 as i64, b as u64 as i64);
    let (qa, qb) = (a as u64, b as u64);
    let (fa, fb) = (f32::from_bits(ua), f32::from_bits(ub));
    let (da, db) = (f64::from_bits(qa), f64::from_bits(qb));

    Ok(match op {
        // ── i32 ──────────────────────────────────────────────────────────────
        I32Eqz => bool(ia == 0),
        I32Eq => bool(ia == ib),
        I32Ne => bool(ia != ib),
        I32LtS => bool(ia < ib),
        I32LtU => bool(ua < ub),
        I32GtS => bool(ia > ib),
        I32GtU => bool(ua > ub),
        I32LeS => bool(ia <= ib),
        I32LeU => bool(ua <= ub),
        I32GeS => bool(ia >= ib),
        I32GeU => bool(ua >= ub),
        I32Clz => u32v(ua.leading_zeros()),
        I32Ctz => u32v(ua.trailing_zeros()),
        I32Popcnt => u32v(ua.count_ones()),
        I32Add => i32v(ia.wrapping_add(ib)),
        I32Sub => i32v(ia.wrapping_sub(ib)),
        I32Mul => i32v(ia.wrapping_mul(ib)),
        I32DivS => i32v(i32_div_s(ia, ib)?),
        I32DivU => u32v(i32_div_u(ua, ub)?),
        I32RemS => i32v(i32_rem_s(ia, ib)?),
        I32RemU => u32v(i32_rem_u(ua, ub)?),
        I32And => u32v(ua & ub),
        I32Or => u32v(ua | ub),
        I32Xor => u32v(ua ^ ub),
        I32Shl => u32v(ua.wrapping_shl(ub)),
        I32ShrS => i32v(ia.wrapping_shr(ub)),
        I32ShrU => u32v(ua.wrapping_shr(ub)),
        I32Rotl => u32v(ua.rotate_left(ub % 32)),
        I32Rotr => u32v(ua.rotate_right(ub % 32)),

        // ── i64 ──────────────────────────────────────────────────────────────
        I64Eqz => bool(la == 0),
        I64Eq => bool(la == lb),
        I64Ne => bool(la != lb),
        I64LtS => bool(la < lb),
        I64LtU => bool(qa < qb),
        I64GtS => bool(la > lb),
        I64GtU => bool(qa > qb),
        I64LeS => bool(la <= lb),
        I64LeU => bool(qa <= qb),
        I64GeS => bool(la >= lb),
        I64GeU => bool(qa >= qb),
        I64Clz => u64v(qa.leading_zeros() as u64),
        I64Ctz => u64v(qa.trailing_zeros() as u64),
        I64Popcnt => u64v(qa.count_ones() as u64),
        I64Add => i64v(la.wrapping_add(lb)),
        I64Sub => i64v(la.wrapping_sub(lb)),
        I64Mul => i64v(la.wrapping_mul(lb)),
        I64DivS => i64v(i64_div_s(la, lb)?),
        I64DivU => u64v(i64_div_u(qa, qb)?),
        I64RemS => i64v(i64_rem_s(la, lb)?),
        I64RemU => u64v(i64_rem_u(qa, qb)?),
        I64And => u64v(qa & qb),
        I64Or => u64v(qa | qb),
        I64Xor => u64v(qa ^ qb),
        I64Shl => u64v(qa.wrapping_shl(qb as u32)),
        I64ShrS => i64v(la.wrapping_shr(qb as u32)),
        I64ShrU => u64v(qa.wrapping_shr(qb as u32)),
        I64Rotl => u64v(qa.rotate_left((qb % 64) as u32)),
        I64Rotr => u64v(qa.rotate_right((qb % 64) as u32)),

        // ── f32 ──────────────────────────────────────────────────────────────
        F32Eq => bool(fa == fb),
        F32Ne => bool(fa != fb),
        F32Lt => bool(fa < fb),
        F32Gt => bool(fa > fb),
        F32Le => bool(fa <= fb),
        F32Ge => bool(fa >= fb),
        F32Abs => f32v(f32_abs(fa)),
        F32Neg => f32v(f32_neg(fa)),
        F32Ceil => f32v(fa.ceil()),
        F32Floor => f32v(fa.floor()),
        F32Trunc => f32v(fa.trunc()),
        F32Nearest => f32v(fa.round_ties_even()),
        F32Sqrt => f32v(fa.sqrt()),
        F32Add => f32v(fa + fb),
        F32Sub => f32v(fa - fb),
        F32Mul => f32v(fa * fb),
        F32Div => f32v(fa / fb),
        F32Min => f32v(f32_min(fa, fb)),
        F32Max => f32v(f32_max(fa, fb)),
        F32Copysign => f32v(f32_copysign(fa, fb)),

        // ── f64 ──────────────────────────────────────────────────────────────
        F64Eq => bool(da == db),
        F64Ne => bool(da != db),
        F64Lt => bool(da < db),
        F64Gt => bool(da > db),
        F64Le => bool(da <= db),
        F64Ge => bool(da >= db),
        F64Abs => f64v(f64_abs(da)),
        F64Neg => f64v(f64_neg(da)),
        F64Ceil => f64v(da.ceil()),
        F64Floor => f64v(da.floor()),
        F64Trunc => f64v(da.trunc()),
        F64Nearest => f64v(da.round_ties_even()),
        F64Sqrt => f64v(da.sqrt()),
        F64Add => f64v(da + db),
        F64Sub => f64v(da - db),
        F64Mul => f64v(da * db),
        F64Div => f64v(da / db),
        F64Min => f64v(f64_min(da, db)),
        F64Max => f64v(f64_max(da, db)),
        F64Copysign => f64v(f64_copysign(da, db)),

        // ── Conversions ──────────────────────────────────────────────────────
        I32WrapI64 => u32v(qa as u32),
        I32TruncF32S => i32v(i32_trunc_f32_s(fa)?),
        I32TruncF32U => u32v(i32_trunc_f32_u(fa)?),
        I32TruncF64S => i32v(i32_trunc_f64_s(da)?),
        I32TruncF64U => u32v(i32_trunc_f64_u(da)?),
        I64ExtendI32S => i64v(ia as i64),
        I64ExtendI32U => u64v(ua as u64),
        I64TruncF32S => i64v(i64_trunc_f32_s(fa)?),
        I64TruncF32U => u64v(i64_trunc_f32_u(fa)?),
        I64TruncF64S => i64v(i64_trunc_f64_s(da)?),
        I64TruncF64U => u64v(i64_trunc_f64_u(da)?),
        F32ConvertI32S => f32v(ia as f32),
        F32ConvertI32U => f32v(ua as f32),
        F32ConvertI64S => f32v(la as f32),
        F32ConvertI64U => f32v(qa as f32),
        F32DemoteF64 => f32v(da as f32),
        F64ConvertI32S => f64v(ia as f64),
        F64ConvertI32U => f64v(ua as f64),
        F64ConvertI64S => f64v(la as f64),
        F64ConvertI64U => f64v(qa as f64),
        F64PromoteF32 => f64v(fa as f64),
        I32ReinterpretF32 | F32ReinterpretI32 => u32v(ua),
        I64ReinterpretF64 | F64ReinterpretI64 => u64v(qa),

        // ── Sign extension ───────────────────────────────────────────────────
        I32Extend8S => i32v(ia as i8 as i32),
        I32Extend16S => i32v(ia as i16 as i32),
        I64Extend8S => i64v(la as i8 as i64),
        I64Extend16S => i64v(la as i16 as i64),
        I64Extend32S => i64v(la as i32 as i64),

        // ── Saturating truncation ────────────────────────────────────────────
        I32TruncSatF32S => i32v(fa as i32),
        I32TruncSatF32U => u32v(fa as u32),
        I32TruncSatF64S => i32v(da as i32),
        I32TruncSatF64U => u32v(da as u32),
        I64TruncSatF32S => i64v(fa as i64),
        I64TruncSatF32U => u64v(fa as u64),
        I64TruncSatF64S => i64v(da as i64),
        I64TruncSatF64U => u64v(da as u64),
    })
}

/// Helper for tests and embedders evaluating a single op on typed values.
pub fn eval_i32(op: NumOp, a: i32, b: i32) -> std::result::Result<i32, Trap> {
    eval(op, i32v(a), i32v(b)).map(|r| r as u32 as i32)
}
