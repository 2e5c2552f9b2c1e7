//! Stream encoder used by the fix-up pass.

use super::*;

/// Appends instructions to a growing buffer. Forward jumps are written as
/// placeholders and patched once the target offset is known.
#[derive(Debug, Default)]
pub struct Emitter {
    code: Vec<u8>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter { code: Vec::with_capacity(64) }
    }

    /// Offset the next byte will be written at.
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: u8) {
        self.code.push(op);
    }

    pub fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    pub fn i8(&mut self, v: i8) {
        self.code.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u128(&mut self, v: u128) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.code.extend_from_slice(b);
    }

    /// Reserves a 4-byte displacement; returns its position for [`patch_i32`](Self::patch_i32).
    pub fn placeholder_i32(&mut self) -> usize {
        let at = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        at
    }

    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.code[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes `label` in its smallest encoding.
    pub fn label(&mut self, label: Label) {
        let Label { height, arity, kind } = label;
        if arity <= 1 && height <= LABEL_U8_HEIGHT_MASK as u32 && kind != LABEL_MIXED {
            let mut b = height as u8;
            if arity == 1 {
                b |= LABEL_U8_ARITY_BIT;
                if kind == LABEL_REFERENCE {
                    b |= LABEL_U8_REF_BIT;
                }
            }
            self.op(LABEL_U8);
            self.u8(b);
        } else if arity < 64 && height < 256 {
            self.op(LABEL_U16);
            self.u8(arity as u8 | (kind << 6));
            self.u8(height as u8);
        } else {
            self.op(LABEL_I32);
            self.u8(kind);
            self.u32(arity);
            self.u32(height);
        }
    }

    /// Writes a general memory immediate with the narrowest offset width.
    pub fn memarg(&mut self, memory: u32, offset: u64) {
        let mut flags = if offset <= u8::MAX as u64 {
            MEMARG_OFFSET_U8
        } else if offset <= u32::MAX as u64 {
            MEMARG_OFFSET_U32
        } else {
            MEMARG_OFFSET_U64
        };
        if memory != 0 {
            flags |= MEMARG_HAS_MEMORY;
        }
        self.u8(flags);
        if memory != 0 {
            self.u32(memory);
        }
        match flags & MEMARG_OFFSET_MASK {
            MEMARG_OFFSET_U8 => self.u8(offset as u8),
            MEMARG_OFFSET_U32 => self.u32(offset as u32),
            _ => self.u64(offset),
        }
    }

    pub fn finish(self) -> Box<[u8]> {
        self.code.into_boxed_slice()
    }
}
