//! Traps and embedding errors.
//!
//! Every failure leaving the interpreter is a [`Trap`]. Traps raised by guest
//! code carry a [`Failure`] kind plus an optional formatted detail; the other
//! variants are produced at the embedding boundary.

use thiserror::Error;

/// The kind of a guest-visible trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Failure {
    #[error("unreachable executed")]
    Unreachable,
    #[error("integer divide by zero")]
    IntDivideByZero,
    #[error("integer overflow")]
    IntOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInt,
    #[error("out of bounds memory access")]
    OutOfBoundsMemoryAccess,
    #[error("out of bounds table access")]
    OutOfBoundsTableAccess,
    #[error("undefined element")]
    UndefinedElement,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("unaligned atomic")]
    UnalignedAtomic,
    #[error("expected shared memory")]
    ExpectedSharedMemory,
    #[error("invalid multi-value arity")]
    InvalidMultiValueArity,
    #[error("invalid type in multi-value")]
    InvalidTypeInMultiValue,
    #[error("execution cancelled")]
    Cancelled,
    #[error("internal interpreter error")]
    Internal,
}

/// All ways execution can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("{kind}{}", detail_suffix(.detail))]
    Wasm { kind: Failure, detail: Option<String> },
    #[error("argument type mismatch: {0}")]
    TypeMismatch(String),
    #[error("undefined export: {0}")]
    UndefinedExport(String),
    #[error("invalid module: {0}")]
    InvalidModule(String),
    #[error("cannot set immutable global {0}")]
    ImmutableGlobal(u32),
    #[error("host error: {0}")]
    HostError(String),
    /// A function reference outlived the instance that defines it.
    #[error("instance {0} has been dropped")]
    InstanceDropped(u64),
    /// A cross-instance call re-entered an instance that is already running
    /// further up the same call chain.
    #[error("instance {0} is already executing")]
    InstanceBusy(u64),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

impl Trap {
    /// A guest trap with a formatted diagnostic.
    pub fn with_detail(kind: Failure, detail: impl Into<String>) -> Self {
        Trap::Wasm { kind, detail: Some(detail.into()) }
    }

    /// The failure kind, if this trap was raised by guest execution.
    pub fn failure(&self) -> Option<Failure> {
        match self {
            Trap::Wasm { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn internal(detail: impl Into<String>) -> Self {
        Trap::with_detail(Failure::Internal, detail)
    }
}

impl From<Failure> for Trap {
    fn from(kind: Failure) -> Self {
        Trap::Wasm { kind, detail: None }
    }
}

pub type Result<T> = std::result::Result<T, Trap>;
