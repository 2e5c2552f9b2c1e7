//! Linear memory.
//!
//! A [`Memory`] is either owned by one instance (`Vec<u8>`) or a handle to a
//! [`SharedMemory`] that several instances, possibly on several threads, can
//! import. Both expose the same bounds-checked accessors; atomics live in
//! [`atomic`].

pub mod atomic;
pub mod shared;

pub use atomic::{AtomicOp, AtomicWidth, RmwOp};
pub use shared::SharedMemory;

use tracing::debug;

use crate::trap::{Failure, Result, Trap};

/// Page size (matches Wasm).
pub const PAGE_SIZE: u64 = 65_536;
/// Page ceiling of a 32-bit memory.
pub const MAX_PAGES_32: u64 = 65_536;
/// Page ceiling of a 64-bit memory.
pub const MAX_PAGES_64: u64 = 1 << 48;

/// Limits and flavour of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub min: u64,
    pub max: Option<u64>,
    pub shared: bool,
    /// Addresses are `i64` (memory64) instead of `i32`.
    pub index64: bool,
}

impl MemoryType {
    pub fn new(min: u64, max: Option<u64>) -> Self {
        MemoryType { min, max, shared: false, index64: false }
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn index64(mut self) -> Self {
        self.index64 = true;
        self
    }

    pub(crate) fn page_limit(&self) -> u64 {
        let ceiling = if self.index64 { MAX_PAGES_64 } else { MAX_PAGES_32 };
        self.max.unwrap_or(ceiling).min(ceiling)
    }
}

pub(crate) enum Storage {
    Local(Vec<u8>),
    Shared(SharedMemory),
}

/// Linear memory of an instance.
pub struct Memory {
    ty: MemoryType,
    storage: Storage,
}

#[cold]
fn out_of_bounds(addr: u64, len: u64, size: u64) -> Trap {
    Trap::with_detail(
        Failure::OutOfBoundsMemoryAccess,
        format!("{len} bytes at address {addr} past memory size {size}"),
    )
}

#[cold]
fn address_too_large() -> Trap {
    Trap::with_detail(Failure::OutOfBoundsMemoryAccess, "memory address too large")
}

fn byte_len(pages: u64) -> Option<usize> {
    usize::try_from(pages.checked_mul(PAGE_SIZE)?).ok()
}

impl Memory {
    /// Allocates `ty.min` zeroed pages. Shared types get a fresh [`SharedMemory`].
    pub fn new(ty: MemoryType) -> Result<Self> {
        if ty.shared {
            return Ok(Memory::from_shared(SharedMemory::new(ty)?));
        }
        let len = byte_len(ty.min)
            .filter(|_| ty.min <= ty.page_limit())
            .ok_or_else(|| Trap::InvalidModule(format!("memory of {} pages is too large", ty.min)))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Trap::InvalidModule(format!("cannot allocate {} pages", ty.min)))?;
        data.resize(len, 0);
        Ok(Memory { ty, storage: Storage::Local(data) })
    }

    pub fn from_shared(shared: SharedMemory) -> Self {
        Memory { ty: shared.ty(), storage: Storage::Shared(shared) }
    }

    pub fn ty(&self) -> MemoryType {
        self.ty
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        match &self.storage {
            Storage::Local(data) => data.len() as u64,
            Storage::Shared(s) => s.size(),
        }
    }

    /// Current size in pages.
    pub fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE
    }

    pub fn shared(&self) -> Option<&SharedMemory> {
        match &self.storage {
            Storage::Shared(s) => Some(s),
            Storage::Local(_) => None,
        }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Grows by `delta` pages. Returns the previous page count, or `None`
    /// when the type's maximum, `limit_pages` or the allocator says no.
    pub fn grow(&mut self, delta: u64, limit_pages: u64) -> Option<u64> {
        let ceiling = self.ty.page_limit().min(limit_pages);
        let old = match &mut self.storage {
            Storage::Local(data) => {
                let old = data.len() as u64 / PAGE_SIZE;
                let new = old.checked_add(delta).filter(|&n| n <= ceiling)?;
                let new_len = byte_len(new)?;
                let extra = new_len - data.len();
                data.try_reserve_exact(extra).ok()?;
                data.resize(new_len, 0);
                old
            }
            Storage::Shared(s) => s.grow(delta, ceiling)?,
        };
        debug!(old_pages = old, delta, "memory grown");
        Some(old)
    }

    /// Effective address of an `len`-byte access at `index + offset`.
    #[inline(always)]
    pub(crate) fn address(&self, index: u64, offset: u64, len: u64) -> Result<u64> {
        let addr = index.checked_add(offset).ok_or_else(address_too_large)?;
        self.check(addr, len)?;
        Ok(addr)
    }

    #[inline(always)]
    pub(crate) fn check(&self, addr: u64, len: u64) -> Result<()> {
        let size = self.size();
        match addr.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(out_of_bounds(addr, len, size)),
        }
    }

    // ── Interpreter accessors ────────────────────────────────────────────────

    #[inline(always)]
    pub(crate) fn load<const N: usize>(&self, index: u64, offset: u64) -> Result<[u8; N]> {
        let addr = self.address(index, offset, N as u64)?;
        let mut out = [0u8; N];
        match &self.storage {
            Storage::Local(data) => {
                let a = addr as usize;
                out.copy_from_slice(&data[a..a + N]);
            }
            Storage::Shared(s) => s.read(addr, &mut out),
        }
        Ok(out)
    }

    #[inline(always)]
    pub(crate) fn store<const N: usize>(&mut self, index: u64, offset: u64, bytes: [u8; N]) -> Result<()> {
        let addr = self.address(index, offset, N as u64)?;
        match &mut self.storage {
            Storage::Local(data) => {
                let a = addr as usize;
                data[a..a + N].copy_from_slice(&bytes);
            }
            Storage::Shared(s) => s.write(addr, &bytes),
        }
        Ok(())
    }

    // ── Embedder accessors ───────────────────────────────────────────────────

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len() as u64)?;
        match &self.storage {
            Storage::Local(data) => {
                let a = addr as usize;
                buf.copy_from_slice(&data[a..a + buf.len()]);
            }
            Storage::Shared(s) => s.read(addr, buf),
        }
        Ok(())
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.check(addr, bytes.len() as u64)?;
        match &mut self.storage {
            Storage::Local(data) => {
                let a = addr as usize;
                data[a..a + bytes.len()].copy_from_slice(bytes);
            }
            Storage::Shared(s) => s.write(addr, bytes),
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.load::<1>(addr, 0).map(|b| b[0])
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32> {
        self.load(addr, 0).map(i32::from_le_bytes)
    }

    pub fn read_i64(&self, addr: u64) -> Result<i64> {
        self.load(addr, 0).map(i64::from_le_bytes)
    }

    pub fn read_f32(&self, addr: u64) -> Result<f32> {
        self.load(addr, 0).map(f32::from_le_bytes)
    }

    pub fn read_f64(&self, addr: u64) -> Result<f64> {
        self.load(addr, 0).map(f64::from_le_bytes)
    }

    pub fn write_u8(&mut self, addr: u64, v: u8) -> Result<()> {
        self.store(addr, 0, [v])
    }

    pub fn write_i32(&mut self, addr: u64, v: i32) -> Result<()> {
        self.store(addr, 0, v.to_le_bytes())
    }

    pub fn write_i64(&mut self, addr: u64, v: i64) -> Result<()> {
        self.store(addr, 0, v.to_le_bytes())
    }

    pub fn write_f32(&mut self, addr: u64, v: f32) -> Result<()> {
        self.store(addr, 0, v.to_le_bytes())
    }

    pub fn write_f64(&mut self, addr: u64, v: f64) -> Result<()> {
        self.store(addr, 0, v.to_le_bytes())
    }

    // ── Bulk operations ──────────────────────────────────────────────────────
    //
    // Ranges are validated in full before anything is written. A zero-length
    // operation inside (or exactly at the end of) memory does nothing.

    pub fn fill(&mut self, dst: u64, value: u8, len: u64) -> Result<()> {
        self.check(dst, len)?;
        if len == 0 {
            return Ok(());
        }
        match &mut self.storage {
            Storage::Local(data) => data[dst as usize..(dst + len) as usize].fill(value),
            Storage::Shared(s) => s.fill(dst, value, len),
        }
        Ok(())
    }

    pub fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        self.check(src, len)?;
        self.check(dst, len)?;
        if len == 0 {
            return Ok(());
        }
        match &mut self.storage {
            Storage::Local(data) => {
                let s = src as usize;
                data.copy_within(s..s + len as usize, dst as usize);
            }
            Storage::Shared(sh) => {
                let mut tmp = vec![0u8; len as usize];
                sh.read(src, &mut tmp);
                sh.write(dst, &tmp);
            }
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` in `from` to `dst` in `to`.
    pub fn copy_between(to: &mut Memory, from: &Memory, dst: u64, src: u64, len: u64) -> Result<()> {
        from.check(src, len)?;
        to.check(dst, len)?;
        if len == 0 {
            return Ok(());
        }
        let mut tmp = vec![0u8; len as usize];
        from.read(src, &mut tmp)?;
        to.write(dst, &tmp)
    }

    /// `memory.init`: copies `data[src..src + len]` to `dst`.
    pub fn init(&mut self, dst: u64, data: &[u8], src: u64, len: u64) -> Result<()> {
        match src.checked_add(len) {
            Some(end) if end <= data.len() as u64 => {}
            _ => return Err(out_of_bounds(src, len, data.len() as u64)),
        }
        self.check(dst, len)?;
        if len == 0 {
            return Ok(());
        }
        self.write(dst, &data[src as usize..(src + len) as usize])
    }
}
