//! Tables of references.

use tracing::debug;

use crate::trap::{Failure, Result, Trap};
use crate::types::{Ref, RefType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: RefType,
    pub min: u32,
    pub max: Option<u32>,
}

impl TableType {
    pub fn new(element: RefType, min: u32, max: Option<u32>) -> Self {
        TableType { element, min, max }
    }
}

pub struct Table {
    ty: TableType,
    elements: Vec<Option<Ref>>,
}

#[cold]
fn out_of_bounds(index: u64, len: u64, size: u32) -> Trap {
    Trap::with_detail(
        Failure::OutOfBoundsTableAccess,
        format!("{len} elements at index {index} past table size {size}"),
    )
}

impl Table {
    pub fn new(ty: TableType, init: Option<Ref>) -> Self {
        Table { ty, elements: vec![init; ty.min as usize] }
    }

    pub fn ty(&self) -> TableType {
        self.ty
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    fn check(&self, index: u32, len: u32) -> Result<()> {
        if index as u64 + len as u64 <= self.elements.len() as u64 {
            Ok(())
        } else {
            Err(out_of_bounds(index as u64, len as u64, self.size()))
        }
    }

    /// Borrow of slot `index`, for call dispatch.
    #[inline]
    pub(crate) fn element(&self, index: u32) -> Option<&Option<Ref>> {
        self.elements.get(index as usize)
    }

    pub fn get(&self, index: u32) -> Result<Option<Ref>> {
        self.check(index, 1)?;
        Ok(self.elements[index as usize].clone())
    }

    pub fn set(&mut self, index: u32, r: Option<Ref>) -> Result<()> {
        self.check(index, 1)?;
        self.elements[index as usize] = r;
        Ok(())
    }

    /// Appends `delta` copies of `init`. Returns the previous size, or `None`
    /// past the type maximum or `limit`.
    pub fn grow(&mut self, delta: u32, init: Option<Ref>, limit: u32) -> Option<u32> {
        let old = self.size();
        let ceiling = self.ty.max.unwrap_or(u32::MAX).min(limit);
        let new = old.checked_add(delta).filter(|&n| n <= ceiling)?;
        self.elements.try_reserve_exact(delta as usize).ok()?;
        self.elements.resize(new as usize, init);
        debug!(old_size = old, delta, "table grown");
        Some(old)
    }

    pub fn fill(&mut self, index: u32, r: Option<Ref>, len: u32) -> Result<()> {
        self.check(index, len)?;
        self.elements[index as usize..(index + len) as usize].fill(r);
        Ok(())
    }

    /// `table.copy` within one table. Overlap behaves as if through a temporary.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<()> {
        self.check(src, len)?;
        self.check(dst, len)?;
        if len == 0 {
            return Ok(());
        }
        let tmp: Vec<Option<Ref>> = self.elements[src as usize..(src + len) as usize].to_vec();
        self.elements[dst as usize..(dst + len) as usize].clone_from_slice(&tmp);
        Ok(())
    }

    pub fn copy_between(to: &mut Table, from: &Table, dst: u32, src: u32, len: u32) -> Result<()> {
        from.check(src, len)?;
        to.check(dst, len)?;
        to.elements[dst as usize..(dst + len) as usize]
            .clone_from_slice(&from.elements[src as usize..(src + len) as usize]);
        Ok(())
    }

    /// `table.init` from a (possibly dropped, hence empty) element segment.
    pub fn init(&mut self, dst: u32, segment: &[Option<Ref>], src: u32, len: u32) -> Result<()> {
        if src as u64 + len as u64 > segment.len() as u64 {
            return Err(out_of_bounds(src as u64, len as u64, segment.len() as u32));
        }
        self.check(dst, len)?;
        self.elements[dst as usize..(dst + len) as usize]
            .clone_from_slice(&segment[src as usize..(src + len) as usize]);
        Ok(())
    }
}
