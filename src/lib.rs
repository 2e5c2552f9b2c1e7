//! Riptide: the core loop of a WebAssembly interpreter.
//!
//! Validated function bodies are lowered once, at instantiation, into a flat
//! byte stream with resolved branch targets and label heights, then executed
//! by a single dispatch loop over a split primitive/reference value stack.
//!
//! # Quick start
//!
//! ```rust
//! use riptide::{Module, Runtime, FuncType, Val, ValType};
//! use riptide::ir::{Function, Op};
//! use riptide::numeric::NumOp;
//!
//! let mut module = Module::new();
//! let add = module.add_function(Function::new(
//!     "add",
//!     FuncType::new([ValType::I32, ValType::I32], [ValType::I32]),
//!     vec![],
//!     vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(NumOp::I32Add)],
//! ));
//! module.export("add", add);
//!
//! let rt = Runtime::new();
//! let mut inst = rt.instantiate(&module).unwrap();
//! let result = inst.call("add", &[Val::I32(3), Val::I32(4)]).unwrap();
//! assert_eq!(result, vec![Val::I32(7)]);
//! ```

pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod global;
pub mod instance;
mod interpreter;
pub mod ir;
pub mod memory;
pub mod module;
pub mod numeric;
pub mod profile;
pub mod runtime;
pub mod stack;
pub mod table;
pub mod trap;
pub mod types;
pub mod vector;

pub use config::{Config, LoopReport};
pub use instance::Instance;
pub use module::Module;
pub use runtime::{InterruptHandle, Runtime};
pub use trap::{Failure, Result, Trap};
pub use types::{FuncType, Val, ValType};
