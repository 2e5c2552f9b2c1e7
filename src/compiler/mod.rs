//! Bytecode fix-up pass.
//!
//! Lowers a structured [`Function`] into the flat stream described in
//! [`bytecode`]. Along the way it tracks the operand height, so every label
//! carries its continuation height and the function records the deepest
//! operand area it can need. Code after an unconditional transfer is dead
//! and is not emitted.

mod control;

use tracing::trace;

use crate::bytecode::{self, misc, vector, Emitter, COMPACT_MEMORY_DELTA};
use crate::ir::{BlockType, Function, MemArg, Op};
use crate::memory::AtomicOp;
use crate::trap::{Result, Trap};
use crate::types::{FuncType, ValType};
use control::{Ctrl, CtrlKind};

/// A function body ready for the interpreter. Shared by `Arc`; never mutated.
#[derive(Debug)]
pub struct CompiledFunc {
    pub index: u32,
    pub name: String,
    pub ty: FuncType,
    pub num_params: usize,
    /// Parameters plus declared locals.
    pub num_locals: usize,
    /// Deepest operand height, locals excluded.
    pub max_stack: usize,
    /// Whether any slot of the frame can hold a reference.
    pub uses_refs: bool,
    pub code: Box<[u8]>,
}

/// Module-level facts the lowering needs.
pub(crate) struct CompileEnv<'a> {
    pub types: &'a [FuncType],
    /// Signatures of the whole function index space, imports first.
    pub funcs: &'a [FuncType],
    pub globals: &'a [ValType],
}

pub(crate) struct Compiler<'a> {
    env: &'a CompileEnv<'a>,
    func: &'a Function,
    out: Emitter,
    ctrl: Vec<Ctrl>,
    height: u32,
    max_height: u32,
    uses_refs: bool,
    /// Blocks opened inside dead code.
    dead_depth: u32,
}

fn invalid(msg: impl Into<String>) -> Trap {
    Trap::InvalidModule(msg.into())
}

/// Lowers function `index` of the module.
pub(crate) fn compile(func: &Function, index: u32, env: &CompileEnv<'_>) -> Result<CompiledFunc> {
    let mut c = Compiler {
        env,
        func,
        out: Emitter::new(),
        ctrl: vec![Ctrl::new(CtrlKind::Function, Vec::new(), func.ty.results.clone(), 0)],
        height: 0,
        max_height: 0,
        uses_refs: func.ty.params.iter().chain(&func.ty.results).chain(&func.locals).any(|t| t.is_ref()),
        dead_depth: 0,
    };
    for (i, op) in func.body.iter().enumerate() {
        if c.ctrl.is_empty() {
            return Err(invalid(format!("{}: instruction {i} follows the function end", func.name)));
        }
        c.lower(op).map_err(|e| match e {
            Trap::InvalidModule(msg) => invalid(format!("{} @{i}: {msg}", func.name)),
            other => other,
        })?;
    }
    if !c.ctrl.is_empty() {
        c.end()?;
    }
    if !c.ctrl.is_empty() {
        return Err(invalid(format!("{}: unterminated block", func.name)));
    }

    let code = c.out.finish();
    trace!(
        func = index,
        name = %func.name,
        code_bytes = code.len(),
        max_stack = c.max_height,
        "function compiled"
    );
    Ok(CompiledFunc {
        index,
        name: func.name.clone(),
        ty: func.ty.clone(),
        num_params: func.ty.params.len(),
        num_locals: func.local_count(),
        max_stack: c.max_height as usize,
        uses_refs: c.uses_refs,
        code,
    })
}

impl<'a> Compiler<'a> {
    // ── Operand height ───────────────────────────────────────────────────────

    fn push(&mut self, n: usize) {
        self.height += n as u32;
        self.max_height = self.max_height.max(self.height);
    }

    fn pop(&mut self, n: usize) -> Result<()> {
        self.height = self
            .height
            .checked_sub(n as u32)
            .ok_or_else(|| invalid("operand stack underflow"))?;
        Ok(())
    }

    fn effect(&mut self, pops: usize, pushes: usize) -> Result<()> {
        self.pop(pops)?;
        self.push(pushes);
        Ok(())
    }

    fn frame(&mut self) -> Result<&mut Ctrl> {
        self.ctrl.last_mut().ok_or_else(|| invalid("no open block"))
    }

    fn set_unreachable(&mut self) -> Result<()> {
        self.frame()?.unreachable = true;
        Ok(())
    }

    fn note_refs(&mut self, types: &[ValType]) {
        if types.iter().any(|t| t.is_ref()) {
            self.uses_refs = true;
        }
    }

    fn block_sig(&self, bt: BlockType) -> Result<(Vec<ValType>, Vec<ValType>)> {
        Ok(match bt {
            BlockType::Empty => (Vec::new(), Vec::new()),
            BlockType::Value(t) => (Vec::new(), vec![t]),
            BlockType::Func(i) => {
                let ty = self.env.types.get(i as usize).ok_or_else(|| invalid(format!("unknown type {i}")))?;
                (ty.params.clone(), ty.results.clone())
            }
        })
    }

    fn open(&mut self, kind: CtrlKind, bt: BlockType) -> Result<()> {
        let (params, results) = self.block_sig(bt)?;
        self.note_refs(&params);
        self.note_refs(&results);
        self.pop(params.len())?;
        let base = self.height;
        let n = params.len();
        self.ctrl.push(Ctrl::new(kind, params, results, base));
        self.push(n);
        Ok(())
    }

    // ── Immediates ───────────────────────────────────────────────────────────

    /// `short` with a `u8` index when it fits, else `wide` with a `u32`.
    fn indexed(&mut self, short: u8, wide: u8, index: u32) {
        if index <= u8::MAX as u32 {
            self.out.op(short);
            self.out.u8(index as u8);
        } else {
            self.out.op(wide);
            self.out.u32(index);
        }
    }

    fn misc(&mut self, sub: u8, immediates: &[u32]) {
        self.out.op(bytecode::MISC);
        self.out.u8(sub);
        for &imm in immediates {
            self.out.u32(imm);
        }
    }

    fn vector(&mut self, sub: u16) {
        self.out.op(bytecode::VECTOR);
        self.out.u16(sub);
    }

    fn memarg(&mut self, m: MemArg) {
        self.out.memarg(m.memory, m.offset);
    }

    /// Scalar load or store: compact form for small offsets on memory 0.
    fn memory_access(&mut self, opcode: u8, m: MemArg) {
        if m.memory == 0 && m.offset <= u8::MAX as u64 {
            self.out.op(opcode + COMPACT_MEMORY_DELTA);
            self.out.u8(m.offset as u8);
        } else {
            self.out.op(opcode);
            self.memarg(m);
        }
    }

    fn func_type(&self, index: u32) -> Result<&'a FuncType> {
        self.env.funcs.get(index as usize).ok_or_else(|| invalid(format!("unknown function {index}")))
    }

    fn local_type(&self, index: u32) -> Result<ValType> {
        self.func.local_type(index).ok_or_else(|| invalid(format!("unknown local {index}")))
    }

    // ── Lowering ─────────────────────────────────────────────────────────────

    fn lower(&mut self, op: &Op) -> Result<()> {
        if self.frame()?.unreachable {
            match op {
                Op::Block(_) | Op::Loop(_) | Op::If(_) => {
                    self.dead_depth += 1;
                    return Ok(());
                }
                Op::End | Op::Else if self.dead_depth > 0 => {
                    if matches!(op, Op::End) {
                        self.dead_depth -= 1;
                    }
                    return Ok(());
                }
                Op::End | Op::Else => {}
                _ => return Ok(()),
            }
        }

        match op {
            // ── Control ──────────────────────────────────────────────────────
            Op::Unreachable => {
                self.out.op(bytecode::UNREACHABLE);
                self.set_unreachable()?;
            }
            Op::Nop => {}
            Op::Block(bt) => self.open(CtrlKind::Block, *bt)?,
            Op::Loop(bt) => {
                self.open(CtrlKind::Loop, *bt)?;
                let head = self.out.pos();
                let frame = self.frame()?;
                frame.head = head;
                let (base, params) = (frame.base, frame.params.clone());
                self.emit_label(base, &params);
                self.out.op(bytecode::LOOP);
            }
            Op::If(bt) => {
                self.pop(1)?;
                self.open(CtrlKind::If, *bt)?;
                let at = self.out.pos();
                self.out.op(bytecode::IF);
                let slot = self.out.placeholder_i32();
                self.frame()?.if_fixup = Some(control::Fixup { at: slot, base: at });
            }
            Op::Else => {
                let reachable = !self.frame()?.unreachable;
                if self.frame()?.kind != CtrlKind::If {
                    return Err(invalid("else outside if"));
                }
                if reachable {
                    let at = self.out.pos();
                    self.out.op(bytecode::ELSE);
                    let slot = self.out.placeholder_i32();
                    self.frame()?.else_fixup = Some(control::Fixup { at: slot, base: at });
                }
                let start = self.out.pos();
                let frame = self.frame()?;
                let if_fixup = frame.if_fixup.take();
                frame.unreachable = false;
                let height = frame.base + frame.params.len() as u32;
                if let Some(f) = if_fixup {
                    self.patch(f, start)?;
                }
                self.height = height;
            }
            Op::End => self.end()?,
            Op::Br(depth) => {
                self.branch(*depth, false)?;
                self.set_unreachable()?;
            }
            Op::BrIf(depth) => {
                self.pop(1)?;
                self.branch(*depth, true)?;
            }
            Op::BrTable(depths, default) => {
                self.pop(1)?;
                self.branch_table(depths, *default)?;
                self.set_unreachable()?;
            }
            Op::Return => {
                self.out.op(bytecode::RETURN);
                self.set_unreachable()?;
            }
            Op::Call(f) => {
                let ty = self.func_type(*f)?;
                self.note_refs(&ty.params);
                self.note_refs(&ty.results);
                self.effect(ty.params.len(), ty.results.len())?;
                self.indexed(bytecode::CALL_U8, bytecode::CALL_I32, *f);
            }
            Op::CallIndirect { ty, table } => {
                let sig = self.env.types.get(*ty as usize).ok_or_else(|| invalid(format!("unknown type {ty}")))?;
                self.note_refs(&sig.params);
                self.note_refs(&sig.results);
                self.effect(sig.params.len() + 1, sig.results.len())?;
                if *ty <= u8::MAX as u32 && *table <= u8::MAX as u32 {
                    self.out.op(bytecode::CALL_INDIRECT_U8);
                    self.out.u8(*ty as u8);
                    self.out.u8(*table as u8);
                } else {
                    self.out.op(bytecode::CALL_INDIRECT_I32);
                    self.out.u32(*ty);
                    self.out.u32(*table);
                }
            }

            // ── Parametric ───────────────────────────────────────────────────
            Op::Drop => {
                self.pop(1)?;
                self.out.op(bytecode::DROP);
            }
            Op::Select | Op::SelectTyped(_) => {
                if let Op::SelectTyped(t) = op {
                    self.note_refs(&[*t]);
                }
                self.effect(3, 1)?;
                self.out.op(bytecode::SELECT);
            }

            // ── Variables ────────────────────────────────────────────────────
            Op::LocalGet(i) => {
                if self.local_type(*i)?.is_ref() {
                    self.indexed(bytecode::LOCAL_GET_REF_U8, bytecode::LOCAL_GET_REF_I32, *i);
                } else {
                    self.indexed(bytecode::LOCAL_GET_U8, bytecode::LOCAL_GET_I32, *i);
                }
                self.push(1);
            }
            Op::LocalSet(i) => {
                if self.local_type(*i)?.is_ref() {
                    self.indexed(bytecode::LOCAL_SET_REF_U8, bytecode::LOCAL_SET_REF_I32, *i);
                } else {
                    self.indexed(bytecode::LOCAL_SET_U8, bytecode::LOCAL_SET_I32, *i);
                }
                self.pop(1)?;
            }
            Op::LocalTee(i) => {
                if self.local_type(*i)?.is_ref() {
                    self.indexed(bytecode::LOCAL_TEE_REF_U8, bytecode::LOCAL_TEE_REF_I32, *i);
                } else {
                    self.indexed(bytecode::LOCAL_TEE_U8, bytecode::LOCAL_TEE_I32, *i);
                }
            }
            Op::GlobalGet(i) | Op::GlobalSet(i) => {
                let ty = *self.env.globals.get(*i as usize).ok_or_else(|| invalid(format!("unknown global {i}")))?;
                self.note_refs(&[ty]);
                if matches!(op, Op::GlobalGet(_)) {
                    self.indexed(bytecode::GLOBAL_GET_U8, bytecode::GLOBAL_GET_I32, *i);
                    self.push(1);
                } else {
                    self.indexed(bytecode::GLOBAL_SET_U8, bytecode::GLOBAL_SET_I32, *i);
                    self.pop(1)?;
                }
            }

            // ── References ───────────────────────────────────────────────────
            Op::RefNull(t) => {
                self.uses_refs = true;
                self.out.op(bytecode::REF_NULL);
                self.out.u8(ValType::from(*t) as u8);
                self.push(1);
            }
            Op::RefIsNull => {
                self.uses_refs = true;
                self.out.op(bytecode::REF_IS_NULL);
            }
            Op::RefFunc(f) => {
                self.func_type(*f)?;
                self.uses_refs = true;
                self.out.op(bytecode::REF_FUNC);
                self.out.u32(*f);
                self.push(1);
            }

            // ── Tables ───────────────────────────────────────────────────────
            Op::TableGet(t) => {
                self.uses_refs = true;
                self.out.op(bytecode::TABLE_GET);
                self.out.u32(*t);
            }
            Op::TableSet(t) => {
                self.uses_refs = true;
                self.out.op(bytecode::TABLE_SET);
                self.out.u32(*t);
                self.pop(2)?;
            }
            Op::TableSize(t) => {
                self.misc(misc::TABLE_SIZE, &[*t]);
                self.push(1);
            }
            Op::TableGrow(t) => {
                self.uses_refs = true;
                self.misc(misc::TABLE_GROW, &[*t]);
                self.effect(2, 1)?;
            }
            Op::TableFill(t) => {
                self.uses_refs = true;
                self.misc(misc::TABLE_FILL, &[*t]);
                self.pop(3)?;
            }
            Op::TableCopy { dst, src } => {
                self.misc(misc::TABLE_COPY, &[*dst, *src]);
                self.pop(3)?;
            }
            Op::TableInit { elem, table } => {
                self.misc(misc::TABLE_INIT, &[*elem, *table]);
                self.pop(3)?;
            }
            Op::ElemDrop(e) => self.misc(misc::ELEM_DROP, &[*e]),

            // ── Memory ───────────────────────────────────────────────────────
            Op::Load(kind, m) => {
                self.memory_access(*kind as u8, *m);
                self.effect(1, 1)?;
            }
            Op::Store(kind, m) => {
                self.memory_access(*kind as u8, *m);
                self.pop(2)?;
            }
            Op::MemorySize(mem) => {
                self.out.op(bytecode::MEMORY_SIZE);
                self.out.u32(*mem);
                self.push(1);
            }
            Op::MemoryGrow(mem) => {
                self.out.op(bytecode::MEMORY_GROW);
                self.out.u32(*mem);
            }
            Op::MemoryFill(mem) => {
                self.misc(misc::MEMORY_FILL, &[*mem]);
                self.pop(3)?;
            }
            Op::MemoryCopy { dst, src } => {
                self.misc(misc::MEMORY_COPY, &[*dst, *src]);
                self.pop(3)?;
            }
            Op::MemoryInit { data, memory } => {
                self.misc(misc::MEMORY_INIT, &[*data, *memory]);
                self.pop(3)?;
            }
            Op::DataDrop(d) => self.misc(misc::DATA_DROP, &[*d]),

            // ── Constants and numerics ───────────────────────────────────────
            Op::I32Const(v) => {
                match i8::try_from(*v) {
                    Ok(small) => {
                        self.out.op(bytecode::I32_CONST_I8);
                        self.out.i8(small);
                    }
                    Err(_) => {
                        self.out.op(bytecode::I32_CONST_I32);
                        self.out.i32(*v);
                    }
                }
                self.push(1);
            }
            Op::I64Const(v) => {
                match i8::try_from(*v) {
                    Ok(small) => {
                        self.out.op(bytecode::I64_CONST_I8);
                        self.out.i8(small);
                    }
                    Err(_) => {
                        self.out.op(bytecode::I64_CONST_I64);
                        self.out.u64(*v as u64);
                    }
                }
                self.push(1);
            }
            Op::F32Const(v) => {
                self.out.op(bytecode::F32_CONST);
                self.out.u32(v.to_bits());
                self.push(1);
            }
            Op::F64Const(v) => {
                self.out.op(bytecode::F64_CONST);
                self.out.u64(v.to_bits());
                self.push(1);
            }
            Op::V128Const(v) => {
                self.vector(vector::V128_CONST);
                self.out.u128(v.to_bits());
                self.push(1);
            }
            Op::Num(n) => {
                match n.misc_code() {
                    Some(sub) => self.misc(sub, &[]),
                    None => self.out.op(n.code() as u8),
                }
                self.effect(n.arity(), 1)?;
            }

            // ── Vector ───────────────────────────────────────────────────────
            Op::Simd(s) => {
                self.vector(s.code());
                self.effect(s.arity(), 1)?;
            }
            Op::SimdLoad(kind, m) => {
                self.vector(kind.code());
                self.memarg(*m);
                self.effect(1, 1)?;
            }
            Op::V128Store(m) => {
                self.vector(vector::V128_STORE);
                self.memarg(*m);
                self.pop(2)?;
            }
            Op::Lane(lane_op, lane) => {
                self.vector(lane_op.code());
                self.out.u8(*lane);
                self.effect(if lane_op.is_replace() { 2 } else { 1 }, 1)?;
            }
            Op::Shuffle(lanes) => {
                self.vector(vector::SHUFFLE);
                self.out.bytes(lanes);
                self.effect(2, 1)?;
            }
            Op::LoadLane(width, m, lane) | Op::StoreLane(width, m, lane) => {
                let store = matches!(op, Op::StoreLane(..));
                self.vector(width.code(store));
                self.memarg(*m);
                self.out.u8(*lane);
                if store {
                    self.pop(2)?;
                } else {
                    self.effect(2, 1)?;
                }
            }

            // ── Atomics ──────────────────────────────────────────────────────
            Op::AtomicFence | Op::Atomic(AtomicOp::Fence, _) => {
                self.out.op(bytecode::ATOMIC);
                self.out.u8(bytecode::atomic::FENCE);
            }
            Op::Atomic(a, m) => {
                self.out.op(bytecode::ATOMIC);
                self.out.u8(a.code());
                self.memarg(*m);
                let (pops, pushes) = match a {
                    AtomicOp::Load(_) => (1, 1),
                    AtomicOp::Store(_) => (2, 0),
                    AtomicOp::Rmw(..) | AtomicOp::Notify => (2, 1),
                    AtomicOp::Cmpxchg(_) | AtomicOp::Wait32 | AtomicOp::Wait64 => (3, 1),
                    AtomicOp::Fence => (0, 0),
                };
                self.effect(pops, pushes)?;
            }
        }
        Ok(())
    }

    /// `end` of the innermost frame. The function frame ends with `RETURN`.
    fn end(&mut self) -> Result<()> {
        let frame = self.ctrl.pop().ok_or_else(|| invalid("unbalanced end"))?;
        let kind = frame.kind;
        let height = frame.base + frame.results.len() as u32;
        self.close_frame(frame)?;
        if kind == CtrlKind::Function {
            self.out.op(bytecode::RETURN);
        }
        self.height = height;
        self.max_height = self.max_height.max(height);
        Ok(())
    }
}
