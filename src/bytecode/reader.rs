//! Immediate decoding.
//!
//! The stream is produced by [`Emitter`](super::Emitter) from validated input,
//! so the hot-path readers index the buffer directly and never check widths.

use super::*;
use crate::trap::{Result, Trap};

#[inline(always)]
fn arr<const N: usize>(code: &[u8], pc: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&code[pc..pc + N]);
    out
}

#[inline(always)]
pub fn read_u8(code: &[u8], pc: usize) -> u8 {
    code[pc]
}

#[inline(always)]
pub fn read_i8(code: &[u8], pc: usize) -> i8 {
    code[pc] as i8
}

#[inline(always)]
pub fn read_u16(code: &[u8], pc: usize) -> u16 {
    u16::from_le_bytes(arr(code, pc))
}

#[inline(always)]
pub fn read_u32(code: &[u8], pc: usize) -> u32 {
    u32::from_le_bytes(arr(code, pc))
}

#[inline(always)]
pub fn read_i32(code: &[u8], pc: usize) -> i32 {
    i32::from_le_bytes(arr(code, pc))
}

#[inline(always)]
pub fn read_u64(code: &[u8], pc: usize) -> u64 {
    u64::from_le_bytes(arr(code, pc))
}

#[inline(always)]
pub fn read_u128(code: &[u8], pc: usize) -> u128 {
    u128::from_le_bytes(arr(code, pc))
}

#[inline(always)]
pub fn read_bytes16(code: &[u8], pc: usize) -> [u8; 16] {
    arr(code, pc)
}

/// Decodes a general memory immediate at `pc`.
/// Returns `(memory, offset, next_pc)`.
#[inline(always)]
pub fn read_memarg(code: &[u8], pc: usize) -> (u32, u64, usize) {
    let flags = code[pc];
    let mut at = pc + 1;
    let memory = if flags & MEMARG_HAS_MEMORY != 0 {
        let m = read_u32(code, at);
        at += 4;
        m
    } else {
        0
    };
    let offset = match flags & MEMARG_OFFSET_MASK {
        MEMARG_OFFSET_U8 => {
            at += 1;
            code[at - 1] as u64
        }
        MEMARG_OFFSET_U32 => {
            at += 4;
            read_u32(code, at - 4) as u64
        }
        _ => {
            at += 8;
            read_u64(code, at - 8)
        }
    };
    (memory, offset, at)
}

/// Decodes the label whose opcode byte sits at `pc`. Returns the label and
/// the offset of the next instruction.
#[inline(always)]
pub fn read_label(code: &[u8], pc: usize) -> (Label, usize) {
    match code[pc] {
        LABEL_U8 => {
            let b = code[pc + 1];
            let arity = (b & LABEL_U8_ARITY_BIT != 0) as u32;
            let kind = if b & LABEL_U8_REF_BIT != 0 { LABEL_REFERENCE } else { LABEL_PRIMITIVE };
            let height = (b & LABEL_U8_HEIGHT_MASK) as u32;
            (Label { height, arity, kind }, pc + 2)
        }
        LABEL_U16 => {
            let b = code[pc + 1];
            let label = Label {
                arity: (b & 0x3F) as u32,
                kind: b >> 6,
                height: code[pc + 2] as u32,
            };
            (label, pc + 3)
        }
        _ => {
            let label = Label {
                kind: code[pc + 1],
                arity: read_u32(code, pc + 2),
                height: read_u32(code, pc + 6),
            };
            (label, pc + 10)
        }
    }
}

fn memarg_len(code: &[u8], at: usize) -> Option<usize> {
    let flags = *code.get(at)?;
    let mem = if flags & MEMARG_HAS_MEMORY != 0 { 4 } else { 0 };
    let off = match flags & MEMARG_OFFSET_MASK {
        MEMARG_OFFSET_U8 => 1,
        MEMARG_OFFSET_U32 => 4,
        MEMARG_OFFSET_U64 => 8,
        _ => return None,
    };
    Some(1 + mem + off)
}

/// Byte length of the instruction at `pc`, or `None` for an unknown opcode
/// or a truncated stream.
pub fn instruction_length(code: &[u8], pc: usize) -> Option<usize> {
    let op = *code.get(pc)?;
    let len = match op {
        UNREACHABLE | NOP | LOOP | RETURN | DROP | SELECT | REF_IS_NULL => 1,
        NUMERIC_FIRST..=NUMERIC_LAST => 1,
        LABEL_U8 => 2,
        LABEL_U16 => 3,
        LABEL_I32 => 10,
        IF | ELSE | BR_I32 | BR_IF_I32 => 5,
        BR_U8 | BR_IF_U8 => 2,
        BR_TABLE_U8 => 2 + 4 * *code.get(pc + 1)? as usize,
        BR_TABLE_I32 => {
            code.get(pc + 4)?;
            5 + 4 * read_u32(code, pc + 1) as usize
        }
        CALL_I32 => 5,
        CALL_U8 => 2,
        CALL_INDIRECT_I32 => 9,
        CALL_INDIRECT_U8 => 3,
        LOCAL_GET_U8 | LOCAL_SET_U8 | LOCAL_TEE_U8 | GLOBAL_GET_U8 | GLOBAL_SET_U8
        | LOCAL_GET_REF_U8 | LOCAL_SET_REF_U8 | LOCAL_TEE_REF_U8 | I32_CONST_I8 | I64_CONST_I8
        | REF_NULL => 2,
        LOCAL_GET_I32 | LOCAL_SET_I32 | LOCAL_TEE_I32 | GLOBAL_GET_I32 | GLOBAL_SET_I32
        | LOCAL_GET_REF_I32 | LOCAL_SET_REF_I32 | LOCAL_TEE_REF_I32 | TABLE_GET | TABLE_SET
        | MEMORY_SIZE | MEMORY_GROW | REF_FUNC | I32_CONST_I32 | F32_CONST => 5,
        I64_CONST_I64 | F64_CONST => 9,
        I32_LOAD..=I64_STORE32 => 1 + memarg_len(code, pc + 1)?,
        COMPACT_LOAD_FIRST..=COMPACT_STORE_LAST => 2,
        MISC => {
            2 + match *code.get(pc + 1)? {
                0x00..=0x07 => 0,
                misc::MEMORY_INIT | misc::MEMORY_COPY | misc::TABLE_INIT | misc::TABLE_COPY => 8,
                misc::DATA_DROP | misc::MEMORY_FILL | misc::ELEM_DROP | misc::TABLE_GROW
                | misc::TABLE_SIZE | misc::TABLE_FILL => 4,
                _ => return None,
            }
        }
        VECTOR => {
            code.get(pc + 2)?;
            let sub = read_u16(code, pc + 1);
            let at = pc + 3;
            3 + match sub {
                vector::V128_LOAD..=vector::V128_STORE
                | vector::LOAD32_ZERO
                | vector::LOAD64_ZERO => memarg_len(code, at)?,
                vector::V128_CONST | vector::SHUFFLE => 16,
                vector::LANE_FIRST..=vector::LANE_LAST => 1,
                vector::LOAD_LANE_FIRST..=vector::STORE_LANE_LAST => memarg_len(code, at)? + 1,
                _ if crate::vector::SimdOp::from_code(sub).is_some() => 0,
                _ => return None,
            }
        }
        ATOMIC => match *code.get(pc + 1)? {
            atomic::FENCE => 2,
            sub if crate::memory::AtomicOp::from_code(sub).is_some() => {
                2 + memarg_len(code, pc + 2)?
            }
            _ => return None,
        },
        _ => return None,
    };
    if pc + len > code.len() {
        return None;
    }
    Some(len)
}

/// One decoded instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub offset: usize,
    pub opcode: u8,
    pub len: usize,
}

/// Walks a stream instruction by instruction.
pub struct Decoder<'a> {
    code: &'a [u8],
    pc: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Decoder { code, pc: 0 }
    }
}

impl<'a> Iterator for Decoder<'a> {
    type Item = Result<Instr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.code.len() {
            return None;
        }
        let offset = self.pc;
        match instruction_length(self.code, offset) {
            Some(len) => {
                self.pc += len;
                Some(Ok(Instr { offset, opcode: self.code[offset], len }))
            }
            None => {
                self.pc = self.code.len();
                Some(Err(Trap::internal(format!(
                    "undecodable opcode {:#04x} at offset {offset}",
                    self.code[offset]
                ))))
            }
        }
    }
}
