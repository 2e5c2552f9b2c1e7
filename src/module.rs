//! Module definition.
//!
//! A [`Module`] is the validated, structured form of a WebAssembly module:
//! types, host imports, function bodies as [`ir::Op`](crate::ir::Op) lists,
//! memories, tables, globals, segments and exports. It is plain data; the
//! builder helpers below only append and hand back the new index.

use crate::global::GlobalType;
use crate::ir::Function;
use crate::memory::{MemoryType, SharedMemory};
use crate::table::TableType;
use crate::trap::Result;
use crate::types::{FuncType, HostFunc, RefType, Val};

use std::sync::Arc;

// ── Host function registry ───────────────────────────────────────────────────

/// A host-provided function import.
pub struct HostFuncDef {
    pub name: String,
    pub ty: FuncType,
    pub func: HostFunc,
}

// ── Definitions ──────────────────────────────────────────────────────────────

/// Constant initialiser of a global, segment offset or element item.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    Val(Val),
    RefFunc(u32),
    /// Value of an already initialised global.
    GlobalGet(u32),
}

impl From<Val> for ConstExpr {
    fn from(v: Val) -> Self {
        ConstExpr::Val(v)
    }
}

impl ConstExpr {
    pub fn i32(v: i32) -> Self {
        ConstExpr::Val(Val::I32(v))
    }

    pub fn i64(v: i64) -> Self {
        ConstExpr::Val(Val::I64(v))
    }
}

pub enum MemoryDef {
    Define(MemoryType),
    /// A shared memory created by the embedder, possibly used by other instances.
    Import(SharedMemory),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDef {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementMode {
    Active { table: u32, offset: ConstExpr },
    Passive,
    Declarative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementSegment {
    pub ty: RefType,
    pub mode: ElementMode,
    pub items: Vec<ConstExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Active { memory: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub mode: DataMode,
    pub bytes: Vec<u8>,
}

// ── Module ───────────────────────────────────────────────────────────────────

/// A validated module, ready to be instantiated.
///
/// The function index space is `imports` followed by `functions`.
#[derive(Default)]
pub struct Module {
    /// Type section, referenced by block types and `call_indirect`.
    pub types: Vec<FuncType>,
    pub imports: Vec<HostFuncDef>,
    pub functions: Vec<Function>,
    pub memories: Vec<MemoryDef>,
    pub tables: Vec<TableType>,
    pub globals: Vec<GlobalDef>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    /// Exported function names → function index.
    pub exports: Vec<(String, u32)>,
    pub start: Option<u32>,
}

impl Module {
    /// Create an empty module (used by the builder API).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: FuncType) -> u32 {
        if let Some(i) = self.types.iter().position(|t| *t == ty) {
            return i as u32;
        }
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    /// Register a host function import. Imports precede every defined
    /// function in the index space, so register them before adding bodies.
    pub fn register_host<F>(&mut self, name: impl Into<String>, ty: FuncType, func: F) -> u32
    where
        F: Fn(&[Val], &mut Vec<Val>) -> Result<()> + Send + Sync + 'static,
    {
        self.imports.push(HostFuncDef { name: name.into(), ty, func: Arc::new(func) });
        (self.imports.len() - 1) as u32
    }

    /// Appends a function body and returns its index in the function space.
    pub fn add_function(&mut self, func: Function) -> u32 {
        self.functions.push(func);
        self.func_count() - 1
    }

    pub fn add_memory(&mut self, ty: MemoryType) -> u32 {
        self.memories.push(MemoryDef::Define(ty));
        (self.memories.len() - 1) as u32
    }

    pub fn import_memory(&mut self, memory: SharedMemory) -> u32 {
        self.memories.push(MemoryDef::Import(memory));
        (self.memories.len() - 1) as u32
    }

    pub fn add_table(&mut self, ty: TableType) -> u32 {
        self.tables.push(ty);
        (self.tables.len() - 1) as u32
    }

    pub fn add_global(&mut self, ty: GlobalType, init: impl Into<ConstExpr>) -> u32 {
        self.globals.push(GlobalDef { ty, init: init.into() });
        (self.globals.len() - 1) as u32
    }

    /// Active data segment copied into `memory` at `offset` on instantiation.
    pub fn add_data(&mut self, memory: u32, offset: impl Into<ConstExpr>, bytes: impl Into<Vec<u8>>) -> u32 {
        self.data.push(DataSegment {
            mode: DataMode::Active { memory, offset: offset.into() },
            bytes: bytes.into(),
        });
        (self.data.len() - 1) as u32
    }

    /// Passive data segment for `memory.init`.
    pub fn add_passive_data(&mut self, bytes: impl Into<Vec<u8>>) -> u32 {
        self.data.push(DataSegment { mode: DataMode::Passive, bytes: bytes.into() });
        (self.data.len() - 1) as u32
    }

    pub fn add_elements(&mut self, segment: ElementSegment) -> u32 {
        self.elements.push(segment);
        (self.elements.len() - 1) as u32
    }

    /// Active funcref segment placing `funcs` into `table` at `offset`.
    pub fn add_func_elements(&mut self, table: u32, offset: u32, funcs: &[u32]) -> u32 {
        self.add_elements(ElementSegment {
            ty: RefType::Func,
            mode: ElementMode::Active { table, offset: ConstExpr::i32(offset as i32) },
            items: funcs.iter().map(|&f| ConstExpr::RefFunc(f)).collect(),
        })
    }

    pub fn export(&mut self, name: impl Into<String>, func: u32) {
        self.exports.push((name.into(), func));
    }

    /// Find an export by name. Returns function index.
    pub fn find_export(&self, name: &str) -> Option<u32> {
        self.exports.iter().find(|(n, _)| n == name).map(|(_, idx)| *idx)
    }

    /// Size of the function index space.
    pub fn func_count(&self) -> u32 {
        (self.imports.len() + self.functions.len()) as u32
    }

    /// Signature of function `index`, imports first.
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let i = index as usize;
        match self.imports.get(i) {
            Some(import) => Some(&import.ty),
            None => self.functions.get(i - self.imports.len()).map(|f| &f.ty),
        }
    }
}
