//! Label resolution.
//!
//! Structured control is flattened into branches that jump to `LABEL`
//! instructions. Backward targets (loop heads) are known when the branch is
//! emitted; forward targets are left as `i32` placeholders on the enclosing
//! frame and patched when its `end` is reached.

use super::Compiler;
use crate::bytecode::{self, Label, LABEL_MIXED, LABEL_PRIMITIVE, LABEL_REFERENCE};
use crate::trap::{Result, Trap};
use crate::types::ValType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CtrlKind {
    Function,
    Block,
    Loop,
    If,
}

/// A forward displacement awaiting its target: the `i32` at `at` becomes
/// `target - base`, where `base` is the offset of the branching opcode.
#[derive(Debug, Clone, Copy)]
pub(super) struct Fixup {
    pub at: usize,
    pub base: usize,
}

#[derive(Debug)]
pub(super) struct Ctrl {
    pub kind: CtrlKind,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Operand height below the frame's parameters.
    pub base: u32,
    /// Offset of the loop head label.
    pub head: usize,
    pub fixups: Vec<Fixup>,
    /// The `IF` displacement, until an `else` or the `end` resolves it.
    pub if_fixup: Option<Fixup>,
    /// The jump over the else arm.
    pub else_fixup: Option<Fixup>,
    pub unreachable: bool,
}

impl Ctrl {
    pub fn new(kind: CtrlKind, params: Vec<ValType>, results: Vec<ValType>, base: u32) -> Self {
        Ctrl {
            kind,
            params,
            results,
            base,
            head: 0,
            fixups: Vec::new(),
            if_fixup: None,
            else_fixup: None,
            unreachable: false,
        }
    }

    /// Values a branch to this frame carries.
    pub fn branch_types(&self) -> &[ValType] {
        if self.kind == CtrlKind::Loop { &self.params } else { &self.results }
    }
}

/// Which slot halves a label moves.
pub(super) fn label_kind(types: &[ValType]) -> u8 {
    let refs = types.iter().filter(|t| t.is_ref()).count();
    if refs == 0 {
        LABEL_PRIMITIVE
    } else if refs == types.len() {
        LABEL_REFERENCE
    } else {
        LABEL_MIXED
    }
}

fn displacement(from: usize, to: usize) -> Result<i32> {
    i32::try_from(to as i64 - from as i64)
        .map_err(|_| Trap::InvalidModule("branch displacement exceeds 2 GiB".into()))
}

impl<'a> Compiler<'a> {
    /// Index into the control stack of the frame `depth` levels out.
    pub(super) fn target(&self, depth: u32) -> Result<usize> {
        (self.ctrl.len() as u64)
            .checked_sub(1 + depth as u64)
            .map(|i| i as usize)
            .ok_or_else(|| Trap::InvalidModule(format!("branch depth {depth} out of range")))
    }

    pub(super) fn emit_label(&mut self, height: u32, types: &[ValType]) {
        self.out.label(Label { height, arity: types.len() as u32, kind: label_kind(types) });
    }

    pub(super) fn patch(&mut self, fixup: Fixup, target: usize) -> Result<()> {
        let disp = displacement(fixup.base, target)?;
        self.out.patch_i32(fixup.at, disp);
        Ok(())
    }

    /// Emits `br` (or `br_if` when `conditional`) to the frame `depth` out.
    pub(super) fn branch(&mut self, depth: u32, conditional: bool) -> Result<()> {
        let target = self.target(depth)?;
        let at = self.out.pos();
        match self.ctrl[target].kind {
            CtrlKind::Loop => {
                let dist = at - self.ctrl[target].head;
                if dist <= u8::MAX as usize {
                    self.out.op(if conditional { bytecode::BR_IF_U8 } else { bytecode::BR_U8 });
                    self.out.u8(dist as u8);
                } else {
                    self.out.op(if conditional { bytecode::BR_IF_I32 } else { bytecode::BR_I32 });
                    self.out.i32(displacement(at, self.ctrl[target].head)?);
                }
            }
            // Leaving the function unconditionally is a plain return.
            CtrlKind::Function if !conditional => self.out.op(bytecode::RETURN),
            _ => {
                self.out.op(if conditional { bytecode::BR_IF_I32 } else { bytecode::BR_I32 });
                let slot = self.out.placeholder_i32();
                self.ctrl[target].fixups.push(Fixup { at: slot, base: at });
            }
        }
        Ok(())
    }

    /// Emits `br_table`. Entries are displacements from the opcode; the
    /// default is stored last.
    pub(super) fn branch_table(&mut self, depths: &[u32], default: u32) -> Result<()> {
        let at = self.out.pos();
        let n = depths.len() + 1;
        if n <= u8::MAX as usize {
            self.out.op(bytecode::BR_TABLE_U8);
            self.out.u8(n as u8);
        } else {
            self.out.op(bytecode::BR_TABLE_I32);
            self.out.u32(n as u32);
        }
        for &depth in depths.iter().chain(std::iter::once(&default)) {
            let target = self.target(depth)?;
            if self.ctrl[target].kind == CtrlKind::Loop {
                self.out.i32(displacement(at, self.ctrl[target].head)?);
            } else {
                let slot = self.out.placeholder_i32();
                self.ctrl[target].fixups.push(Fixup { at: slot, base: at });
            }
        }
        Ok(())
    }

    /// Closes the innermost frame: places its label when something branches
    /// to it and resolves every pending displacement.
    pub(super) fn close_frame(&mut self, frame: Ctrl) -> Result<()> {
        let end = self.out.pos();
        if frame.kind != CtrlKind::Loop && !frame.fixups.is_empty() {
            self.emit_label(frame.base, &frame.results);
        }
        for fixup in frame.fixups.iter().chain(&frame.if_fixup).chain(&frame.else_fixup) {
            self.patch(*fixup, end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_kinds() {
        assert_eq!(label_kind(&[]), LABEL_PRIMITIVE);
        assert_eq!(label_kind(&[ValType::I32, ValType::V128]), LABEL_PRIMITIVE);
        assert_eq!(label_kind(&[ValType::ExternRef]), LABEL_REFERENCE);
        assert_eq!(label_kind(&[ValType::FuncRef, ValType::I64]), LABEL_MIXED);
    }

    #[test]
    fn displacement_is_signed() {
        assert_eq!(displacement(10, 4).unwrap(), -6);
        assert_eq!(displacement(4, 10).unwrap(), 6);
    }
}
