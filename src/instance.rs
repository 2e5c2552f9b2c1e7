//! Instances: instantiation and the embedding call boundary.
//!
//! Everything the hot loop needs is resolved here once: function bodies are
//! compiled, signatures are mapped to type classes, segments are evaluated,
//! and every memory, table and global is addressed by plain index. Execution
//! itself lives in [`interpreter`](crate::interpreter).

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::compiler::{self, CompileEnv, CompiledFunc};
use crate::config::Config;
use crate::global::Global;
use crate::interpreter::Frame;
use crate::memory::Memory;
use crate::module::{ConstExpr, DataMode, ElementMode, MemoryDef, Module};
use crate::profile::BranchProfile;
use crate::runtime::TypeRegistry;
use crate::stack::ValueStack;
use crate::table::Table;
use crate::trap::{Failure, Result, Trap};
use crate::types::{FuncInst, FuncKind, FuncRef, FuncType, Ref, TypeClass, Val, ValType};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// A live instantiation of a module.
///
/// The handle owns the instance state behind a lock held for the duration of
/// each call. Function references handed out by [`func_ref`](Self::func_ref)
/// point back at that state, so other instances can call them through their
/// own tables. Guards returned by the accessors hold the same lock; drop them
/// before calling into the instance.
pub struct Instance {
    id: u64,
    inner: Arc<Mutex<InstanceData>>,
}

/// Everything one instance owns.
pub(crate) struct InstanceData {
    pub(crate) id: u64,
    /// Compiled body per function index; `None` for host imports.
    pub(crate) code: Vec<Option<Arc<CompiledFunc>>>,
    pub(crate) functions: Vec<FuncRef>,
    pub(crate) types: Vec<FuncType>,
    pub(crate) type_classes: Vec<TypeClass>,
    pub(crate) memories: Vec<Memory>,
    pub(crate) tables: Vec<Table>,
    pub(crate) globals: Vec<Global>,
    /// Passive data segments; dropped and active ones are empty.
    pub(crate) data: Vec<Arc<[u8]>>,
    /// Passive element segments; dropped, active and declarative ones are empty.
    pub(crate) elements: Vec<Vec<Option<Ref>>>,
    exports: Vec<(String, u32)>,
    pub(crate) stack: ValueStack,
    pub(crate) frames: Vec<Frame>,
    /// Reusable marshalling buffers for host and cross-instance calls.
    pub(crate) host_args: Vec<Val>,
    pub(crate) host_results: Vec<Val>,
    /// Instances suspended in a call into this one, outermost first. Empty
    /// unless the current activation was entered from another instance.
    pub(crate) callers: Vec<u64>,
    pub(crate) config: Config,
    pub(crate) interrupt: Arc<AtomicBool>,
    pub(crate) profile: Option<BranchProfile>,
}

fn offset_of(v: &Val) -> Result<u64> {
    match v {
        Val::I32(i) => Ok(*i as u32 as u64),
        Val::I64(i) => Ok(*i as u64),
        other => Err(Trap::InvalidModule(format!("segment offset of type {:?}", other.ty()))),
    }
}

impl Instance {
    pub(crate) fn new(
        module: &Module,
        config: Config,
        registry: Arc<TypeRegistry>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

        // ── Functions ────────────────────────────────────────────────────────
        let type_classes = module.types.iter().map(|t| registry.class_of(t)).collect();
        let func_types: Vec<FuncType> = module
            .imports
            .iter()
            .map(|i| i.ty.clone())
            .chain(module.functions.iter().map(|f| f.ty.clone()))
            .collect();

        let global_types: Vec<ValType> = module.globals.iter().map(|g| g.ty.content).collect();
        let env = CompileEnv { types: &module.types, funcs: &func_types, globals: &global_types };
        let mut code: Vec<Option<Arc<CompiledFunc>>> = vec![None; module.imports.len()];
        for (i, func) in module.functions.iter().enumerate() {
            let index = (module.imports.len() + i) as u32;
            code.push(Some(Arc::new(compiler::compile(func, index, &env)?)));
        }

        // ── Memories and tables ──────────────────────────────────────────────
        let mut memories = Vec::with_capacity(module.memories.len());
        for def in &module.memories {
            memories.push(match def {
                MemoryDef::Define(ty) => {
                    if ty.min > config.max_memory_pages {
                        return Err(Trap::InvalidModule(format!(
                            "memory of {} pages exceeds the configured limit of {}",
                            ty.min, config.max_memory_pages
                        )));
                    }
                    Memory::new(*ty)?
                }
                MemoryDef::Import(shared) => Memory::from_shared(shared.clone()),
            });
        }
        let mut tables = Vec::with_capacity(module.tables.len());
        for ty in &module.tables {
            if ty.min > config.max_table_elements {
                return Err(Trap::InvalidModule(format!(
                    "table of {} elements exceeds the configured limit of {}",
                    ty.min, config.max_table_elements
                )));
            }
            tables.push(Table::new(*ty, None));
        }

        let profile = config.branch_profiling.then(BranchProfile::new);
        let inner = Arc::new_cyclic(|owner: &Weak<Mutex<InstanceData>>| {
            let functions = func_types
                .iter()
                .enumerate()
                .map(|(index, ty)| {
                    let kind = match module.imports.get(index) {
                        Some(import) => FuncKind::Host(import.func.clone()),
                        None => FuncKind::Wasm { instance: id, index: index as u32, owner: owner.clone() },
                    };
                    FuncRef(Arc::new(FuncInst { ty: ty.clone(), class: registry.class_of(ty), kind }))
                })
                .collect();
            Mutex::new(InstanceData {
                id,
                code,
                functions,
                types: module.types.clone(),
                type_classes,
                memories,
                tables,
                globals: Vec::with_capacity(module.globals.len()),
                data: Vec::with_capacity(module.data.len()),
                elements: Vec::with_capacity(module.elements.len()),
                exports: module.exports.clone(),
                stack: ValueStack::new(),
                frames: Vec::new(),
                host_args: Vec::new(),
                host_results: Vec::new(),
                callers: Vec::new(),
                config,
                interrupt,
                profile,
            })
        });
        inner.lock().initialise(module)?;
        Ok(Instance { id, inner })
    }

    /// Call an exported function by name.
    pub fn call(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        self.inner.lock().call(name, args)
    }

    /// Call function `index` of the function index space.
    pub fn call_index(&mut self, index: u32, args: &[Val]) -> Result<Vec<Val>> {
        self.inner.lock().call_index(index, args)
    }

    // ── Embedder access ──────────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory(&self, index: u32) -> Option<MappedMutexGuard<'_, Memory>> {
        MutexGuard::try_map(self.inner.lock(), |d| d.memories.get_mut(index as usize)).ok()
    }

    pub fn memory_mut(&mut self, index: u32) -> Option<MappedMutexGuard<'_, Memory>> {
        self.memory(index)
    }

    pub fn table(&self, index: u32) -> Option<MappedMutexGuard<'_, Table>> {
        MutexGuard::try_map(self.inner.lock(), |d| d.tables.get_mut(index as usize)).ok()
    }

    pub fn table_mut(&mut self, index: u32) -> Option<MappedMutexGuard<'_, Table>> {
        self.table(index)
    }

    pub fn global(&self, index: u32) -> Option<Val> {
        self.inner.lock().globals.get(index as usize).map(Global::get)
    }

    /// Assigns a mutable global. Immutable globals are rejected here; the
    /// interpreter never writes them.
    pub fn set_global(&mut self, index: u32, val: Val) -> Result<()> {
        let mut data = self.inner.lock();
        let global = data
            .globals
            .get_mut(index as usize)
            .ok_or_else(|| Trap::TypeMismatch(format!("unknown global {index}")))?;
        if !global.ty().mutable {
            return Err(Trap::ImmutableGlobal(index));
        }
        global.set(val)
    }

    /// Reference to function `index`, e.g. to place into a table.
    pub fn func_ref(&self, index: u32) -> Option<FuncRef> {
        self.inner.lock().functions.get(index as usize).cloned()
    }

    pub fn export_func(&self, name: &str) -> Option<FuncRef> {
        let data = self.inner.lock();
        let idx = data.export_index(name)?;
        data.functions.get(idx as usize).cloned()
    }

    /// Branch counters, when [`Config::branch_profiling`] is on.
    pub fn branch_profile(&self) -> Option<MappedMutexGuard<'_, BranchProfile>> {
        MutexGuard::try_map(self.inner.lock(), |d| d.profile.as_mut()).ok()
    }

    /// Takes the collected branch counters, leaving an empty profile behind.
    pub fn take_branch_profile(&mut self) -> Option<BranchProfile> {
        self.inner.lock().profile.as_mut().map(mem::take)
    }
}

impl InstanceData {
    /// Globals, then segments, then the start function.
    fn initialise(&mut self, module: &Module) -> Result<()> {
        for def in &module.globals {
            let init = self.eval_const(&def.init)?;
            self.globals.push(Global::new(def.ty, init)?);
        }

        for seg in &module.elements {
            let mut items = Vec::with_capacity(seg.items.len());
            for item in &seg.items {
                let r = self
                    .eval_const(item)?
                    .into_ref()
                    .ok_or_else(|| Trap::InvalidModule("element item is not a reference".into()))?;
                items.push(r);
            }
            match &seg.mode {
                ElementMode::Active { table, offset } => {
                    let dst = offset_of(&self.eval_const(offset)?)?;
                    let table = self
                        .tables
                        .get_mut(*table as usize)
                        .ok_or_else(|| Trap::InvalidModule(format!("unknown table {table}")))?;
                    let dst = u32::try_from(dst).map_err(|_| Failure::OutOfBoundsTableAccess)?;
                    table.init(dst, &items, 0, items.len() as u32)?;
                    self.elements.push(Vec::new());
                }
                ElementMode::Passive => self.elements.push(items),
                ElementMode::Declarative => self.elements.push(Vec::new()),
            }
        }

        for seg in &module.data {
            match &seg.mode {
                DataMode::Active { memory, offset } => {
                    let dst = offset_of(&self.eval_const(offset)?)?;
                    let mem = self
                        .memories
                        .get_mut(*memory as usize)
                        .ok_or_else(|| Trap::InvalidModule(format!("unknown memory {memory}")))?;
                    mem.init(dst, &seg.bytes, 0, seg.bytes.len() as u64)?;
                    self.data.push(Arc::from(Vec::new()));
                }
                DataMode::Passive => self.data.push(Arc::from(seg.bytes.as_slice())),
            }
        }

        debug!(
            instance = self.id,
            functions = self.functions.len(),
            memories = self.memories.len(),
            tables = self.tables.len(),
            globals = self.globals.len(),
            "module instantiated"
        );

        if let Some(start) = module.start {
            self.call_index(start, &[])?;
        }
        Ok(())
    }

    fn eval_const(&self, expr: &ConstExpr) -> Result<Val> {
        match expr {
            ConstExpr::Val(v) => Ok(v.clone()),
            ConstExpr::RefFunc(f) => self
                .functions
                .get(*f as usize)
                .map(|f| Val::FuncRef(Some(f.clone())))
                .ok_or_else(|| Trap::InvalidModule(format!("ref.func of unknown function {f}"))),
            ConstExpr::GlobalGet(g) => self
                .globals
                .get(*g as usize)
                .map(Global::get)
                .ok_or_else(|| Trap::InvalidModule(format!("initialiser reads unknown global {g}"))),
        }
    }

    fn export_index(&self, name: &str) -> Option<u32> {
        self.exports.iter().find(|(n, _)| n == name).map(|(_, idx)| *idx)
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn call(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        let idx = self.export_index(name).ok_or_else(|| Trap::UndefinedExport(name.into()))?;
        self.call_index(idx, args)
    }

    fn call_index(&mut self, index: u32, args: &[Val]) -> Result<Vec<Val>> {
        let func = self
            .functions
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Trap::UndefinedExport(format!("function {index}")))?;
        let ty = func.ty();
        if args.len() != ty.params.len() {
            return Err(Trap::TypeMismatch(format!(
                "function {index} takes {} arguments, got {}",
                ty.params.len(),
                args.len()
            )));
        }
        if let Some((i, (arg, want))) = args.iter().zip(&ty.params).enumerate().find(|(_, (a, t))| a.ty() != **t) {
            return Err(Trap::TypeMismatch(format!(
                "argument {i} of function {index} is {:?}, expected {want:?}",
                arg.ty()
            )));
        }
        trace!(instance = self.id, func = index, args = args.len(), "call");

        let outcome = match &func.inst().kind {
            FuncKind::Host(host) => {
                let mut results = Vec::with_capacity(ty.results.len());
                host(args, &mut results).and_then(|()| check_host_results(ty, &results).map(|()| results))
            }
            FuncKind::Wasm { .. } => match self.code.get(index as usize).cloned().flatten() {
                Some(body) => self.invoke(body, args),
                None => Err(Trap::internal(format!("function {index} has no body"))),
            },
        };
        if let Err(trap) = &outcome {
            debug!(instance = self.id, func = index, %trap, "call trapped");
        }
        outcome
    }
}

/// Host results must match the signature exactly.
pub(crate) fn check_host_results(ty: &FuncType, results: &[Val]) -> Result<()> {
    if results.len() != ty.results.len() {
        return Err(Trap::with_detail(
            Failure::InvalidMultiValueArity,
            format!("host function returned {} values, expected {}", results.len(), ty.results.len()),
        ));
    }
    if let Some((i, (got, want))) = results.iter().zip(&ty.results).enumerate().find(|(_, (v, t))| v.ty() != **t) {
        return Err(Trap::with_detail(
            Failure::InvalidTypeInMultiValue,
            format!("host result {i} is {:?}, expected {want:?}", got.ty()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalType;
    use crate::ir::{Function, Op};
    use crate::memory::MemoryType;
    use crate::table::TableType;
    use crate::types::RefType;
    use crate::Runtime;

    #[test]
    fn segments_are_applied_and_dropped() {
        let mut m = Module::new();
        let f = m.add_function(Function::new("f", FuncType::default(), vec![], vec![]));
        m.add_memory(MemoryType::new(1, None));
        m.add_table(TableType::new(RefType::Func, 4, None));
        m.add_data(0, ConstExpr::i32(8), b"hi".to_vec());
        m.add_passive_data(b"later".to_vec());
        m.add_func_elements(0, 2, &[f]);
        let inst = Runtime::new().instantiate(&m).unwrap();

        let mut buf = [0u8; 2];
        inst.memory(0).unwrap().read(8, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        assert!(inst.table(0).unwrap().get(2).unwrap().is_some());
        let data = inst.inner.lock();
        assert!(data.data[0].is_empty());
        assert_eq!(&*data.data[1], b"later");
        assert!(data.elements[0].is_empty());
    }

    #[test]
    fn globals_can_read_earlier_globals() {
        let mut m = Module::new();
        m.add_global(GlobalType::new(ValType::I64, false), Val::I64(41));
        m.add_global(GlobalType::new(ValType::I64, true), ConstExpr::GlobalGet(0));
        let mut inst = Runtime::new().instantiate(&m).unwrap();
        assert_eq!(inst.global(1), Some(Val::I64(41)));
        inst.set_global(1, Val::I64(7)).unwrap();
        assert_eq!(inst.global(1), Some(Val::I64(7)));
        assert_eq!(inst.set_global(0, Val::I64(7)), Err(Trap::ImmutableGlobal(0)));
    }

    #[test]
    fn out_of_bounds_active_segment_fails_instantiation() {
        let mut m = Module::new();
        m.add_memory(MemoryType::new(1, None));
        m.add_data(0, ConstExpr::i32(65_535), b"ab".to_vec());
        let err = Runtime::new().instantiate(&m).err().unwrap();
        assert_eq!(err.failure(), Some(Failure::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn host_results_are_checked() {
        let ty = FuncType::new([], [ValType::I32, ValType::I64]);
        let err = check_host_results(&ty, &[Val::I32(1)]).unwrap_err();
        assert_eq!(err.failure(), Some(Failure::InvalidMultiValueArity));
        let err = check_host_results(&ty, &[Val::I32(1), Val::I32(2)]).unwrap_err();
        assert_eq!(err.failure(), Some(Failure::InvalidTypeInMultiValue));
        check_host_results(&ty, &[Val::I32(1), Val::I64(2)]).unwrap();
    }

    #[test]
    fn start_function_runs() {
        let mut m = Module::new();
        m.add_global(GlobalType::new(ValType::I32, true), Val::I32(0));
        let start = m.add_function(Function::new(
            "start",
            FuncType::default(),
            vec![],
            vec![Op::I32Const(5), Op::GlobalSet(0)],
        ));
        m.start = Some(start);
        let inst = Runtime::new().instantiate(&m).unwrap();
        assert_eq!(inst.global(0), Some(Val::I32(5)));
    }
}
