//! Flat instruction stream executed by the interpreter.
//!
//! Each instruction is one opcode byte followed by its immediates. Opcodes
//! that exist in WebAssembly keep their WebAssembly numbering; interpreter-only
//! forms (labels, compact encodings, reference-local accessors) occupy byte
//! values WebAssembly leaves unused.
//!
//! Layout of the interpreter-only forms:
//!
//! ```text
//!   LABEL_U8         [u8 packed]         bits 0-5 height, bit 6 arity, bit 7 ref result
//!   LABEL_U16        [u8 arity|kind<<6] [u8 height]
//!   LABEL_I32        [u8 kind] [u32 arity] [u32 height]
//!   LOOP             -                   counts back edges, polls interrupts
//!   IF / ELSE        [i32 disp]          relative to the opcode byte
//!   BR_U8 / BR_IF_U8 [u8 dist]           backward: target = pc - dist
//!   BR_I32 / BR_IF_I32 [i32 disp]        target = pc + disp
//!   BR_TABLE_U8      [u8 n]  n x [i32 disp]   last entry is the default
//!   BR_TABLE_I32     [u32 n] n x [i32 disp]
//!   CALL_U8 [u8 f] / CALL_I32 [u32 f]
//!   CALL_INDIRECT_U8 [u8 type] [u8 table] / CALL_INDIRECT_I32 [u32 type] [u32 table]
//!   *_U8 local/global accessors [u8 index], *_I32 forms [u32 index]
//!   I32_CONST_I8 / I64_CONST_I8 [i8]
//!   compact load/store (general + 0xB8) [u8 offset]   memory 0
//! ```
//!
//! A general memory immediate is a flags byte followed by an optional `u32`
//! memory index and an 8/32/64-bit offset; see [`MEMARG_OFFSET_MASK`].

pub mod reader;
pub mod writer;

pub use reader::{Decoder, Instr};
pub use writer::Emitter;

// ── Control ──────────────────────────────────────────────────────────────────

pub const UNREACHABLE: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const LABEL_U8: u8 = 0x02;
pub const LABEL_U16: u8 = 0x03;
pub const LABEL_I32: u8 = 0x04;
pub const LOOP: u8 = 0x05;
pub const IF: u8 = 0x06;
pub const ELSE: u8 = 0x07;
pub const BR_U8: u8 = 0x08;
pub const BR_I32: u8 = 0x09;
pub const BR_IF_U8: u8 = 0x0A;
pub const BR_IF_I32: u8 = 0x0B;
pub const BR_TABLE_U8: u8 = 0x0C;
pub const BR_TABLE_I32: u8 = 0x0D;
pub const RETURN: u8 = 0x0F;
pub const CALL_I32: u8 = 0x10;
pub const CALL_INDIRECT_I32: u8 = 0x11;
pub const CALL_U8: u8 = 0x12;
pub const CALL_INDIRECT_U8: u8 = 0x13;

// ── Variables ────────────────────────────────────────────────────────────────

pub const LOCAL_GET_U8: u8 = 0x14;
pub const LOCAL_SET_U8: u8 = 0x15;
pub const LOCAL_TEE_U8: u8 = 0x16;
pub const GLOBAL_GET_U8: u8 = 0x17;
pub const GLOBAL_SET_U8: u8 = 0x18;
pub const I32_CONST_I8: u8 = 0x19;
pub const DROP: u8 = 0x1A;
pub const SELECT: u8 = 0x1B;
pub const LOCAL_GET_REF_U8: u8 = 0x1C;
pub const LOCAL_SET_REF_U8: u8 = 0x1D;
pub const LOCAL_TEE_REF_U8: u8 = 0x1E;
pub const I64_CONST_I8: u8 = 0x1F;
pub const LOCAL_GET_I32: u8 = 0x20;
pub const LOCAL_SET_I32: u8 = 0x21;
pub const LOCAL_TEE_I32: u8 = 0x22;
pub const GLOBAL_GET_I32: u8 = 0x23;
pub const GLOBAL_SET_I32: u8 = 0x24;
pub const TABLE_GET: u8 = 0x25;
pub const TABLE_SET: u8 = 0x26;

// ── Memory ───────────────────────────────────────────────────────────────────

pub const I32_LOAD: u8 = 0x28;
pub const I64_LOAD: u8 = 0x29;
pub const F32_LOAD: u8 = 0x2A;
pub const F64_LOAD: u8 = 0x2B;
pub const I32_LOAD8_S: u8 = 0x2C;
pub const I32_LOAD8_U: u8 = 0x2D;
pub const I32_LOAD16_S: u8 = 0x2E;
pub const I32_LOAD16_U: u8 = 0x2F;
pub const I64_LOAD8_S: u8 = 0x30;
pub const I64_LOAD8_U: u8 = 0x31;
pub const I64_LOAD16_S: u8 = 0x32;
pub const I64_LOAD16_U: u8 = 0x33;
pub const I64_LOAD32_S: u8 = 0x34;
pub const I64_LOAD32_U: u8 = 0x35;
pub const I32_STORE: u8 = 0x36;
pub const I64_STORE: u8 = 0x37;
pub const F32_STORE: u8 = 0x38;
pub const F64_STORE: u8 = 0x39;
pub const I32_STORE8: u8 = 0x3A;
pub const I32_STORE16: u8 = 0x3B;
pub const I64_STORE8: u8 = 0x3C;
pub const I64_STORE16: u8 = 0x3D;
pub const I64_STORE32: u8 = 0x3E;
pub const MEMORY_SIZE: u8 = 0x3F;
pub const MEMORY_GROW: u8 = 0x40;

/// Distance from a general load/store opcode to its compact form.
pub const COMPACT_MEMORY_DELTA: u8 = 0xB8;
pub const COMPACT_LOAD_FIRST: u8 = I32_LOAD + COMPACT_MEMORY_DELTA;
pub const COMPACT_STORE_LAST: u8 = I64_STORE32 + COMPACT_MEMORY_DELTA;

// ── Constants ────────────────────────────────────────────────────────────────

pub const I32_CONST_I32: u8 = 0x41;
pub const I64_CONST_I64: u8 = 0x42;
pub const F32_CONST: u8 = 0x43;
pub const F64_CONST: u8 = 0x44;

/// Numeric instructions occupy `0x45..=0xC4` with their WebAssembly codes.
pub const NUMERIC_FIRST: u8 = 0x45;
pub const NUMERIC_LAST: u8 = 0xC4;

// ── References ───────────────────────────────────────────────────────────────

pub const REF_NULL: u8 = 0xD0;
pub const REF_IS_NULL: u8 = 0xD1;
pub const REF_FUNC: u8 = 0xD2;
pub const LOCAL_GET_REF_I32: u8 = 0xD3;
pub const LOCAL_SET_REF_I32: u8 = 0xD4;
pub const LOCAL_TEE_REF_I32: u8 = 0xD5;

// ── Prefixes ─────────────────────────────────────────────────────────────────

/// `[u8 sub]`, WebAssembly `0xFC` numbering, `u32` immediates.
pub const MISC: u8 = 0xFC;
/// `[u16 sub]`, WebAssembly `0xFD` numbering.
pub const VECTOR: u8 = 0xFD;
/// `[u8 sub]` then a general memory immediate (none for the fence).
pub const ATOMIC: u8 = 0xFE;

pub mod misc {
    pub const MEMORY_INIT: u8 = 0x08;
    pub const DATA_DROP: u8 = 0x09;
    pub const MEMORY_COPY: u8 = 0x0A;
    pub const MEMORY_FILL: u8 = 0x0B;
    pub const TABLE_INIT: u8 = 0x0C;
    pub const ELEM_DROP: u8 = 0x0D;
    pub const TABLE_COPY: u8 = 0x0E;
    pub const TABLE_GROW: u8 = 0x0F;
    pub const TABLE_SIZE: u8 = 0x10;
    pub const TABLE_FILL: u8 = 0x11;
}

pub mod vector {
    pub const V128_LOAD: u16 = 0x00;
    pub const V128_STORE: u16 = 0x0B;
    pub const V128_CONST: u16 = 0x0C;
    pub const SHUFFLE: u16 = 0x0D;
    pub const LANE_FIRST: u16 = 0x15;
    pub const LANE_LAST: u16 = 0x22;
    pub const LOAD_LANE_FIRST: u16 = 0x54;
    pub const STORE_LANE_LAST: u16 = 0x5B;
    pub const LOAD32_ZERO: u16 = 0x5C;
    pub const LOAD64_ZERO: u16 = 0x5D;
}

pub mod atomic {
    pub const NOTIFY: u8 = 0x00;
    pub const WAIT32: u8 = 0x01;
    pub const WAIT64: u8 = 0x02;
    pub const FENCE: u8 = 0x03;
}

// ── Labels ───────────────────────────────────────────────────────────────────

/// Label result kinds: which halves of the result slots must be moved.
pub const LABEL_PRIMITIVE: u8 = 0;
pub const LABEL_REFERENCE: u8 = 1;
pub const LABEL_MIXED: u8 = 2;

pub const LABEL_U8_HEIGHT_MASK: u8 = 0x3F;
pub const LABEL_U8_ARITY_BIT: u8 = 0x40;
pub const LABEL_U8_REF_BIT: u8 = 0x80;

// ── Memory immediates ────────────────────────────────────────────────────────

/// Offset width selector in a memarg flags byte: 0 = u8, 1 = u32, 2 = u64.
pub const MEMARG_OFFSET_MASK: u8 = 0x03;
pub const MEMARG_OFFSET_U8: u8 = 0;
pub const MEMARG_OFFSET_U32: u8 = 1;
pub const MEMARG_OFFSET_U64: u8 = 2;
/// Set when a `u32` memory index follows the flags byte.
pub const MEMARG_HAS_MEMORY: u8 = 0x04;

/// Static description of a control label as stored in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    /// Continuation height relative to the start of the operand area.
    pub height: u32,
    pub arity: u32,
    pub kind: u8,
}
