//! Global variables.

use crate::trap::{Result, Trap};
use crate::types::{Ref, Val, ValType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

impl GlobalType {
    pub fn new(content: ValType, mutable: bool) -> Self {
        GlobalType { content, mutable }
    }
}

/// A global holds its value split the same way a stack slot is, so
/// `global.get`/`global.set` are plain copies.
pub struct Global {
    ty: GlobalType,
    bits: u128,
    reference: Option<Ref>,
}

impl Global {
    pub fn new(ty: GlobalType, init: Val) -> Result<Self> {
        if init.ty() != ty.content {
            return Err(Trap::TypeMismatch(format!(
                "global of type {:?} initialised with {:?}",
                ty.content,
                init.ty()
            )));
        }
        let (bits, reference) = init.into_slot();
        Ok(Global { ty, bits, reference })
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub fn get(&self) -> Val {
        Val::from_slot(self.ty.content, self.bits, self.reference.clone())
    }

    /// Replaces the value after a type check. Mutability is the caller's concern.
    pub(crate) fn set(&mut self, val: Val) -> Result<()> {
        if val.ty() != self.ty.content {
            return Err(Trap::TypeMismatch(format!(
                "global of type {:?} assigned {:?}",
                self.ty.content,
                val.ty()
            )));
        }
        let (bits, reference) = val.into_slot();
        self.bits = bits;
        self.reference = reference;
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn bits(&self) -> u128 {
        self.bits
    }

    #[inline(always)]
    pub(crate) fn reference(&self) -> Option<Ref> {
        self.reference.clone()
    }

    #[inline(always)]
    pub(crate) fn store(&mut self, bits: u128, reference: Option<Ref>) {
        self.bits = bits;
        self.reference = reference;
    }
}
