use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::instance::InstanceData;
use crate::trap::Result;

/// Value types supported by riptide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValType {
    I32 = 0x7F,
    I64 = 0x7E,
    F32 = 0x7D,
    F64 = 0x7C,
    V128 = 0x7B,
    FuncRef = 0x70,
    ExternRef = 0x6F,
}

impl ValType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x7F => Some(ValType::I32),
            0x7E => Some(ValType::I64),
            0x7D => Some(ValType::F32),
            0x7C => Some(ValType::F64),
            0x7B => Some(ValType::V128),
            0x70 => Some(ValType::FuncRef),
            0x6F => Some(ValType::ExternRef),
            _ => None,
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::FuncRef | ValType::ExternRef)
    }
}

/// Reference types, as used by tables and `ref.null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Func,
    Extern,
}

impl From<RefType> for ValType {
    fn from(r: RefType) -> Self {
        match r {
            RefType::Func => ValType::FuncRef,
            RefType::Extern => ValType::ExternRef,
        }
    }
}

/// Function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        FuncType { params: params.into(), results: results.into() }
    }
}

// ── Scalar bit containers ────────────────────────────────────────────────────

/// An `f32` kept as its raw bit pattern so NaN payloads survive every copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct F32(u32);

impl F32 {
    pub const fn from_bits(bits: u32) -> Self {
        F32(bits)
    }
    pub const fn to_bits(self) -> u32 {
        self.0
    }
    pub fn to_float(self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl From<f32> for F32 {
    fn from(v: f32) -> Self {
        F32(v.to_bits())
    }
}

impl fmt::Debug for F32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#010x})", self.to_float(), self.0)
    }
}

/// An `f64` kept as its raw bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct F64(u64);

impl F64 {
    pub const fn from_bits(bits: u64) -> Self {
        F64(bits)
    }
    pub const fn to_bits(self) -> u64 {
        self.0
    }
    pub fn to_float(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl From<f64> for F64 {
    fn from(v: f64) -> Self {
        F64(v.to_bits())
    }
}

impl fmt::Debug for F64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#018x})", self.to_float(), self.0)
    }
}

/// A 128-bit vector value. Lane 0 occupies the least significant bits, which
/// matches the little-endian byte order of linear memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct V128(u128);

impl V128 {
    pub const fn from_bits(bits: u128) -> Self {
        V128(bits)
    }
    pub const fn to_bits(self) -> u128 {
        self.0
    }
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        V128(u128::from_le_bytes(bytes))
    }
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
    pub fn from_i32x4(lanes: [i32; 4]) -> Self {
        let mut b = [0u8; 16];
        for (chunk, l) in b.chunks_exact_mut(4).zip(lanes) {
            chunk.copy_from_slice(&l.to_le_bytes());
        }
        V128::from_bytes(b)
    }
    pub fn to_i32x4(self) -> [i32; 4] {
        let b = self.to_bytes();
        let mut out = [0i32; 4];
        for (o, chunk) in out.iter_mut().zip(b.chunks_exact(4)) {
            *o = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }
}

impl fmt::Debug for V128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V128({:#034x})", self.0)
    }
}

// ── References ───────────────────────────────────────────────────────────────

/// Host callback signature. The callback pushes its results onto the
/// (cleared) vector; count and types are checked against the signature.
pub type HostFunc = Arc<dyn Fn(&[Val], &mut Vec<Val>) -> Result<()> + Send + Sync>;

/// Identifies a type-equivalence class inside one type universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeClass {
    pub universe: u64,
    pub id: u32,
}

/// What a function reference points at.
#[derive(Clone)]
pub(crate) enum FuncKind {
    /// Function `index` of the instance with id `instance`. The owner
    /// handle is weak: an instance's own tables hold its functions.
    Wasm { instance: u64, index: u32, owner: Weak<Mutex<InstanceData>> },
    Host(HostFunc),
}

/// A function instance: signature, equivalence class and body.
pub struct FuncInst {
    pub(crate) ty: FuncType,
    pub(crate) class: TypeClass,
    pub(crate) kind: FuncKind,
}

impl FuncInst {
    pub fn ty(&self) -> &FuncType {
        &self.ty
    }
    pub fn class(&self) -> TypeClass {
        self.class
    }
}

/// A non-null function reference. Equality is identity.
#[derive(Clone)]
pub struct FuncRef(pub(crate) Arc<FuncInst>);

impl FuncRef {
    pub fn ty(&self) -> &FuncType {
        &self.0.ty
    }
    pub(crate) fn inst(&self) -> &FuncInst {
        &self.0
    }
}

impl PartialEq for FuncRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            FuncKind::Wasm { instance, index, .. } => write!(f, "FuncRef(wasm {instance}:{index})"),
            FuncKind::Host(_) => write!(f, "FuncRef(host {:?})", self.0.ty),
        }
    }
}

/// An opaque host reference. Equality is identity.
#[derive(Clone)]
pub struct ExternRef(Arc<dyn Any + Send + Sync>);

impl ExternRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ExternRef(Arc::new(value))
    }
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl PartialEq for ExternRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExternRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternRef({:p})", Arc::as_ptr(&self.0))
    }
}

/// A reference held in a table or a reference stack slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Ref {
    Func(FuncRef),
    Extern(ExternRef),
}

// ── Values ───────────────────────────────────────────────────────────────────

/// A runtime value crossing the embedding boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(F32),
    F64(F64),
    V128(V128),
    FuncRef(Option<FuncRef>),
    ExternRef(Option<ExternRef>),
}

impl Val {
    pub fn f32(v: f32) -> Val {
        Val::F32(v.into())
    }

    pub fn f64(v: f64) -> Val {
        Val::F64(v.into())
    }

    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
            Val::FuncRef(_) => ValType::FuncRef,
            Val::ExternRef(_) => ValType::ExternRef,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        if let Val::I32(v) = self { Some(*v) } else { None }
    }
    pub fn as_i64(&self) -> Option<i64> {
        if let Val::I64(v) = self { Some(*v) } else { None }
    }
    pub fn as_f32(&self) -> Option<f32> {
        if let Val::F32(v) = self { Some(v.to_float()) } else { None }
    }
    pub fn as_f64(&self) -> Option<f64> {
        if let Val::F64(v) = self { Some(v.to_float()) } else { None }
    }
    pub fn as_v128(&self) -> Option<V128> {
        if let Val::V128(v) = self { Some(*v) } else { None }
    }

    pub fn default_for(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(F32::default()),
            ValType::F64 => Val::F64(F64::default()),
            ValType::V128 => Val::V128(V128::default()),
            ValType::FuncRef => Val::FuncRef(None),
            ValType::ExternRef => Val::ExternRef(None),
        }
    }

    /// Splits a value into its primitive bits and reference part, the two
    /// halves of a stack slot.
    pub(crate) fn into_slot(self) -> (u128, Option<Ref>) {
        match self {
            Val::I32(v) => (v as u32 as u128, None),
            Val::I64(v) => (v as u64 as u128, None),
            Val::F32(v) => (v.to_bits() as u128, None),
            Val::F64(v) => (v.to_bits() as u128, None),
            Val::V128(v) => (v.to_bits(), None),
            Val::FuncRef(r) => (0, r.map(Ref::Func)),
            Val::ExternRef(r) => (0, r.map(Ref::Extern)),
        }
    }

    /// Rebuilds a value of type `ty` from slot contents.
    pub(crate) fn from_slot(ty: ValType, bits: u128, r: Option<Ref>) -> Val {
        match ty {
            ValType::I32 => Val::I32(bits as u32 as i32),
            ValType::I64 => Val::I64(bits as u64 as i64),
            ValType::F32 => Val::F32(F32::from_bits(bits as u32)),
            ValType::F64 => Val::F64(F64::from_bits(bits as u64)),
            ValType::V128 => Val::V128(V128::from_bits(bits)),
            ValType::FuncRef => Val::FuncRef(match r {
                Some(Ref::Func(f)) => Some(f),
                _ => None,
            }),
            ValType::ExternRef => Val::ExternRef(match r {
                Some(Ref::Extern(e)) => Some(e),
                _ => None,
            }),
        }
    }

    /// The value as a table element, if it is a reference.
    pub fn into_ref(self) -> Option<Option<Ref>> {
        match self {
            Val::FuncRef(r) => Some(r.map(Ref::Func)),
            Val::ExternRef(r) => Some(r.map(Ref::Extern)),
            _ => None,
        }
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::I32(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::I64(v)
    }
}
