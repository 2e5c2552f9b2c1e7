//! Structured instruction input.
//!
//! Function bodies arrive as validated WebAssembly instruction lists, one
//! `Vec<Op>` per function, and are lowered by [`compiler`](crate::compiler)
//! into the flat stream the interpreter runs. A body may end with the `End`
//! that closes the function or omit it.

use std::sync::Arc;

use crate::memory::AtomicOp;
use crate::numeric::NumOp;
use crate::types::{FuncType, RefType, ValType, F32, F64, V128};
use crate::vector::{LaneOp, LaneWidth, SimdLoadOp, SimdOp};

/// Signature of a block, loop or if.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    /// Index into the module's type section; allows params and multiple results.
    Func(u32),
}

/// Memory immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    /// log2 of the alignment hint. Not used by execution.
    pub align: u32,
    pub offset: u64,
    pub memory: u32,
}

impl MemArg {
    pub fn new(offset: u64) -> Self {
        MemArg { align: 0, offset, memory: 0 }
    }

    pub fn memory(mut self, memory: u32) -> Self {
        self.memory = memory;
        self
    }
}

/// Scalar loads, with their WebAssembly opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadOp {
    I32Load = 0x28,
    I64Load = 0x29,
    F32Load = 0x2A,
    F64Load = 0x2B,
    I32Load8S = 0x2C,
    I32Load8U = 0x2D,
    I32Load16S = 0x2E,
    I32Load16U = 0x2F,
    I64Load8S = 0x30,
    I64Load8U = 0x31,
    I64Load16S = 0x32,
    I64Load16U = 0x33,
    I64Load32S = 0x34,
    I64Load32U = 0x35,
}

/// Scalar stores, with their WebAssembly opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StoreOp {
    I32Store = 0x36,
    I64Store = 0x37,
    F32Store = 0x38,
    F64Store = 0x39,
    I32Store8 = 0x3A,
    I32Store16 = 0x3B,
    I64Store8 = 0x3C,
    I64Store16 = 0x3D,
    I64Store32 = 0x3E,
}

/// One structured instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ── Control ──────────────────────────────────────────────────────────────
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    /// Depth table and default depth.
    BrTable(Vec<u32>, u32),
    Return,
    Call(u32),
    CallIndirect { ty: u32, table: u32 },

    // ── Parametric ───────────────────────────────────────────────────────────
    Drop,
    Select,
    SelectTyped(ValType),

    // ── Variables ────────────────────────────────────────────────────────────
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    // ── References ───────────────────────────────────────────────────────────
    RefNull(RefType),
    RefIsNull,
    RefFunc(u32),

    // ── Tables ───────────────────────────────────────────────────────────────
    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),
    TableFill(u32),
    TableCopy { dst: u32, src: u32 },
    TableInit { elem: u32, table: u32 },
    ElemDrop(u32),

    // ── Memory ───────────────────────────────────────────────────────────────
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize(u32),
    MemoryGrow(u32),
    MemoryFill(u32),
    MemoryCopy { dst: u32, src: u32 },
    MemoryInit { data: u32, memory: u32 },
    DataDrop(u32),

    // ── Constants and numerics ───────────────────────────────────────────────
    I32Const(i32),
    I64Const(i64),
    F32Const(F32),
    F64Const(F64),
    V128Const(V128),
    Num(NumOp),

    // ── Vector ───────────────────────────────────────────────────────────────
    Simd(SimdOp),
    SimdLoad(SimdLoadOp, MemArg),
    V128Store(MemArg),
    Lane(LaneOp, u8),
    Shuffle([u8; 16]),
    LoadLane(LaneWidth, MemArg, u8),
    StoreLane(LaneWidth, MemArg, u8),

    // ── Atomics ──────────────────────────────────────────────────────────────
    Atomic(AtomicOp, MemArg),
    AtomicFence,
}

impl From<NumOp> for Op {
    fn from(op: NumOp) -> Self {
        Op::Num(op)
    }
}

impl From<SimdOp> for Op {
    fn from(op: SimdOp) -> Self {
        Op::Simd(op)
    }
}

impl Op {
    pub fn f32_const(v: f32) -> Op {
        Op::F32Const(v.into())
    }

    pub fn f64_const(v: f64) -> Op {
        Op::F64Const(v.into())
    }
}

/// A module-defined function.
///
/// `body` is shared behind an `Arc`, so cloning a `Function` (or a `Module`
/// definition holding it) never copies the instruction list.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ty: FuncType,
    /// Declared locals beyond the parameters.
    pub locals: Vec<ValType>,
    pub body: Arc<Vec<Op>>,
}

impl Function {
    pub fn new(name: impl Into<String>, ty: FuncType, locals: Vec<ValType>, body: Vec<Op>) -> Self {
        Function { name: name.into(), ty, locals, body: Arc::new(body) }
    }

    /// Type of local `index`, parameters first.
    pub fn local_type(&self, index: u32) -> Option<ValType> {
        let i = index as usize;
        let params = &self.ty.params;
        if i < params.len() {
            Some(params[i])
        } else {
            self.locals.get(i - params.len()).copied()
        }
    }

    pub fn local_count(&self) -> usize {
        self.ty.params.len() + self.locals.len()
    }
}
