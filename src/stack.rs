//! Value stack and locals storage.
//!
//! Every activation owns a window of slots: its locals first, then its operand
//! area. A slot has two halves kept in parallel arrays, the raw bits of a
//! numeric or vector value and an optional reference. The interpreter knows
//! each slot's type from the instruction it executes, so there are no tags.

use crate::trap::{Failure, Result, Trap};
use crate::types::Ref;

pub struct ValueStack {
    prims: Vec<u128>,
    refs: Vec<Option<Ref>>,
}

impl ValueStack {
    pub fn new() -> Self {
        ValueStack { prims: Vec::new(), refs: Vec::new() }
    }

    /// Number of slots currently backed by storage.
    pub fn capacity(&self) -> usize {
        self.prims.len()
    }

    /// Makes slots `0..height` addressable. Fails with `CallStackExhausted`
    /// when `height` exceeds `limit`.
    pub fn ensure(&mut self, height: usize, limit: usize) -> Result<()> {
        if height > limit {
            return Err(Trap::with_detail(
                Failure::CallStackExhausted,
                format!("{height} value slots exceed the limit of {limit}"),
            ));
        }
        if height > self.prims.len() {
            let grow_to = height.max(self.prims.len() * 2).min(limit.max(height));
            self.prims.resize(grow_to, 0);
            self.refs.resize(grow_to, None);
        }
        Ok(())
    }

    // ── Primitive half ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn bits(&self, i: usize) -> u128 {
        self.prims[i]
    }

    #[inline(always)]
    pub fn set_bits(&mut self, i: usize, v: u128) {
        self.prims[i] = v;
    }

    #[inline(always)]
    pub fn i32(&self, i: usize) -> i32 {
        self.prims[i] as u32 as i32
    }

    #[inline(always)]
    pub fn set_i32(&mut self, i: usize, v: i32) {
        self.prims[i] = v as u32 as u128;
    }

    #[inline(always)]
    pub fn u32(&self, i: usize) -> u32 {
        self.prims[i] as u32
    }

    #[inline(always)]
    pub fn i64(&self, i: usize) -> i64 {
        self.prims[i] as u64 as i64
    }

    #[inline(always)]
    pub fn set_i64(&mut self, i: usize, v: i64) {
        self.prims[i] = v as u64 as u128;
    }

    #[inline(always)]
    pub fn u64(&self, i: usize) -> u64 {
        self.prims[i] as u64
    }

    #[inline(always)]
    pub fn set_u64(&mut self, i: usize, v: u64) {
        self.prims[i] = v as u128;
    }

    #[inline(always)]
    pub fn f32_bits(&self, i: usize) -> u32 {
        self.prims[i] as u32
    }

    #[inline(always)]
    pub fn f64_bits(&self, i: usize) -> u64 {
        self.prims[i] as u64
    }

    // ── Reference half ───────────────────────────────────────────────────────

    #[inline]
    pub fn get_ref(&self, i: usize) -> Option<Ref> {
        self.refs[i].clone()
    }

    #[inline]
    pub fn ref_is_null(&self, i: usize) -> bool {
        self.refs[i].is_none()
    }

    #[inline]
    pub fn take_ref(&mut self, i: usize) -> Option<Ref> {
        self.refs[i].take()
    }

    #[inline]
    pub fn set_ref(&mut self, i: usize, r: Option<Ref>) {
        self.refs[i] = r;
    }

    // ── Whole slots ──────────────────────────────────────────────────────────

    /// Copies both halves of `from` into `to`.
    #[inline]
    pub fn copy(&mut self, from: usize, to: usize) {
        self.prims[to] = self.prims[from];
        if from != to {
            self.refs[to] = self.refs[from].clone();
        }
    }

    /// Moves `from` into `to`, leaving no reference behind in `from`.
    #[inline]
    pub fn move_slot(&mut self, from: usize, to: usize) {
        self.prims[to] = self.prims[from];
        if from != to {
            self.refs[to] = self.refs[from].take();
        }
    }

    /// Drops the reference held by slot `i`, if any.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        self.refs[i] = None;
    }

    /// Clears every reference in `from..to`.
    pub fn clear_refs(&mut self, from: usize, to: usize) {
        for r in &mut self.refs[from..to] {
            *r = None;
        }
    }

    /// Resets `from..to` to zero bits and null references.
    pub fn zero(&mut self, from: usize, to: usize) {
        self.prims[from..to].fill(0);
        self.clear_refs(from, to);
    }

    /// Releases every reference, e.g. after an aborted activation.
    pub fn reset(&mut self) {
        let len = self.refs.len();
        self.clear_refs(0, len);
    }
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new()
    }
}
