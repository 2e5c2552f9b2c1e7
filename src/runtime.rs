//! Runtime: shared configuration, the type registry and the interrupt flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::instance::Instance;
use crate::module::Module;
use crate::trap::Result;
use crate::types::{FuncInst, FuncKind, FuncRef, FuncType, TypeClass, Val};

static NEXT_UNIVERSE: AtomicU64 = AtomicU64::new(1);

/// Maps structurally equal signatures to one class id. Every function created
/// through the same runtime shares the registry, so `call_indirect` compares
/// integers instead of signatures.
pub(crate) struct TypeRegistry {
    universe: u64,
    classes: Mutex<HashMap<FuncType, u32>>,
}

impl TypeRegistry {
    fn new() -> Self {
        TypeRegistry {
            universe: NEXT_UNIVERSE.fetch_add(1, Ordering::Relaxed),
            classes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn class_of(&self, ty: &FuncType) -> TypeClass {
        let mut classes = self.classes.lock();
        let next = classes.len() as u32;
        let id = *classes.entry(ty.clone()).or_insert(next);
        TypeClass { universe: self.universe, id }
    }
}

/// Cancels running activations from another thread.
///
/// The flag is shared by every instance of the runtime. While raised, those
/// instances trap `Cancelled` at function entry, at loop back edges, inside
/// `memory.atomic.wait` and while waiting to call into another instance.
#[derive(Clone, Debug)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Raises the flag for the whole runtime. It is not lowered when a trap
    /// is delivered: every instance of the runtime, including ones that were
    /// idle, keeps trapping `Cancelled` until [`clear`](Self::clear) is
    /// called.
    pub fn interrupt(&self) {
        debug!("interrupt requested");
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Top-level runtime context. Instances created by one runtime share its
/// configuration, type universe and interrupt flag.
pub struct Runtime {
    config: Config,
    types: Arc<TypeRegistry>,
    interrupt: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub fn with_config(config: Config) -> Self {
        Runtime {
            config,
            types: Arc::new(TypeRegistry::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Instantiate a module: allocate memories, tables and globals, apply
    /// active segments, compile bodies and run the start function.
    pub fn instantiate(&self, module: &Module) -> Result<Instance> {
        Instance::new(module, self.config.clone(), self.types.clone(), self.interrupt.clone())
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.interrupt.clone())
    }

    /// A host function reference in this runtime's type universe, e.g. to
    /// store into a table from the embedding side.
    pub fn host_func<F>(&self, ty: FuncType, func: F) -> FuncRef
    where
        F: Fn(&[Val], &mut Vec<Val>) -> Result<()> + Send + Sync + 'static,
    {
        let class = self.types.class_of(&ty);
        FuncRef(Arc::new(FuncInst { ty, class, kind: FuncKind::Host(Arc::new(func)) }))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
