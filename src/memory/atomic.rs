//! Atomic memory instructions (the threads subset).

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use super::{Memory, Storage};
use crate::trap::{Failure, Result, Trap};

/// Access width of an atomic, in WebAssembly sub-opcode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicWidth {
    I32,
    I64,
    I32_8,
    I32_16,
    I64_8,
    I64_16,
    I64_32,
}

const WIDTHS: [AtomicWidth; 7] = [
    AtomicWidth::I32,
    AtomicWidth::I64,
    AtomicWidth::I32_8,
    AtomicWidth::I32_16,
    AtomicWidth::I64_8,
    AtomicWidth::I64_16,
    AtomicWidth::I64_32,
];

impl AtomicWidth {
    pub const fn bytes(self) -> u32 {
        match self {
            AtomicWidth::I32_8 | AtomicWidth::I64_8 => 1,
            AtomicWidth::I32_16 | AtomicWidth::I64_16 => 2,
            AtomicWidth::I32 | AtomicWidth::I64_32 => 4,
            AtomicWidth::I64 => 8,
        }
    }

    fn mask(self) -> u64 {
        match self.bytes() {
            8 => u64::MAX,
            n => (1u64 << (n * 8)) - 1,
        }
    }

    fn index(self) -> u8 {
        WIDTHS.iter().position(|&w| w == self).unwrap_or(0) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

const RMW_OPS: [RmwOp; 6] = [RmwOp::Add, RmwOp::Sub, RmwOp::And, RmwOp::Or, RmwOp::Xor, RmwOp::Xchg];

impl RmwOp {
    /// New cell value for `old` combined with `operand`.
    pub fn apply(self, old: u64, operand: u64) -> u64 {
        match self {
            RmwOp::Add => old.wrapping_add(operand),
            RmwOp::Sub => old.wrapping_sub(operand),
            RmwOp::And => old & operand,
            RmwOp::Or => old | operand,
            RmwOp::Xor => old ^ operand,
            RmwOp::Xchg => operand,
        }
    }
}

/// An instruction behind the `0xFE` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Notify,
    Wait32,
    Wait64,
    Fence,
    Load(AtomicWidth),
    Store(AtomicWidth),
    Rmw(RmwOp, AtomicWidth),
    Cmpxchg(AtomicWidth),
}

impl AtomicOp {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => AtomicOp::Notify,
            0x01 => AtomicOp::Wait32,
            0x02 => AtomicOp::Wait64,
            0x03 => AtomicOp::Fence,
            0x10..=0x16 => AtomicOp::Load(WIDTHS[(code - 0x10) as usize]),
            0x17..=0x1D => AtomicOp::Store(WIDTHS[(code - 0x17) as usize]),
            0x1E..=0x47 => {
                let i = (code - 0x1E) as usize;
                AtomicOp::Rmw(RMW_OPS[i / 7], WIDTHS[i % 7])
            }
            0x48..=0x4E => AtomicOp::Cmpxchg(WIDTHS[(code - 0x48) as usize]),
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            AtomicOp::Notify => 0x00,
            AtomicOp::Wait32 => 0x01,
            AtomicOp::Wait64 => 0x02,
            AtomicOp::Fence => 0x03,
            AtomicOp::Load(w) => 0x10 + w.index(),
            AtomicOp::Store(w) => 0x17 + w.index(),
            AtomicOp::Rmw(op, w) => {
                let op = RMW_OPS.iter().position(|&o| o == op).unwrap_or(0) as u8;
                0x1E + op * 7 + w.index()
            }
            AtomicOp::Cmpxchg(w) => 0x48 + w.index(),
        }
    }

    /// Natural alignment in bytes; unaligned addresses trap.
    pub fn access_bytes(self) -> u32 {
        match self {
            AtomicOp::Notify | AtomicOp::Wait32 => 4,
            AtomicOp::Wait64 => 8,
            AtomicOp::Fence => 0,
            AtomicOp::Load(w) | AtomicOp::Store(w) | AtomicOp::Rmw(_, w) | AtomicOp::Cmpxchg(w) => w.bytes(),
        }
    }
}

#[inline]
fn read_local(data: &[u8], addr: u64, bytes: u32) -> u64 {
    let mut buf = [0u8; 8];
    let a = addr as usize;
    buf[..bytes as usize].copy_from_slice(&data[a..a + bytes as usize]);
    u64::from_le_bytes(buf)
}

#[inline]
fn write_local(data: &mut [u8], addr: u64, bytes: u32, v: u64) {
    let a = addr as usize;
    data[a..a + bytes as usize].copy_from_slice(&v.to_le_bytes()[..bytes as usize]);
}

impl Memory {
    /// Effective address of an atomic access: bounds first, then alignment.
    pub(crate) fn atomic_address(&self, index: u64, offset: u64, bytes: u32) -> Result<u64> {
        let addr = self.address(index, offset, bytes as u64)?;
        if addr % bytes as u64 != 0 {
            return Err(Trap::with_detail(
                Failure::UnalignedAtomic,
                format!("address {addr} is not aligned to {bytes} bytes"),
            ));
        }
        Ok(addr)
    }

    pub(crate) fn atomic_load(&self, index: u64, offset: u64, width: AtomicWidth) -> Result<u64> {
        let bytes = width.bytes();
        let addr = self.atomic_address(index, offset, bytes)?;
        Ok(match self.storage() {
            Storage::Local(data) => read_local(data, addr, bytes),
            Storage::Shared(s) => s.load_atomic(addr, bytes),
        })
    }

    pub(crate) fn atomic_store(&mut self, index: u64, offset: u64, width: AtomicWidth, v: u64) -> Result<()> {
        let bytes = width.bytes();
        let addr = self.atomic_address(index, offset, bytes)?;
        let v = v & width.mask();
        match self.storage_mut() {
            Storage::Local(data) => write_local(data, addr, bytes, v),
            Storage::Shared(s) => {
                s.update(addr, bytes, |_| Some(v));
            }
        }
        Ok(())
    }

    /// Read-modify-write; returns the previous value, zero-extended.
    pub(crate) fn atomic_rmw(
        &mut self,
        index: u64,
        offset: u64,
        width: AtomicWidth,
        op: RmwOp,
        operand: u64,
    ) -> Result<u64> {
        let bytes = width.bytes();
        let addr = self.atomic_address(index, offset, bytes)?;
        let mask = width.mask();
        Ok(match self.storage_mut() {
            Storage::Local(data) => {
                let old = read_local(data, addr, bytes);
                write_local(data, addr, bytes, op.apply(old, operand) & mask);
                old
            }
            Storage::Shared(s) => s.update(addr, bytes, |old| Some(op.apply(old, operand) & mask)),
        })
    }

    /// Compare-exchange; `expected` is wrapped to the access width first.
    pub(crate) fn atomic_cmpxchg(
        &mut self,
        index: u64,
        offset: u64,
        width: AtomicWidth,
        expected: u64,
        replacement: u64,
    ) -> Result<u64> {
        let bytes = width.bytes();
        let addr = self.atomic_address(index, offset, bytes)?;
        let (expected, replacement) = (expected & width.mask(), replacement & width.mask());
        Ok(match self.storage_mut() {
            Storage::Local(data) => {
                let old = read_local(data, addr, bytes);
                if old == expected {
                    write_local(data, addr, bytes, replacement);
                }
                old
            }
            Storage::Shared(s) => s.update(addr, bytes, |old| (old == expected).then_some(replacement)),
        })
    }

    /// `memory.atomic.wait32/64`. A negative timeout waits until notified or
    /// until `cancel` is raised.
    pub(crate) fn atomic_wait(
        &self,
        index: u64,
        offset: u64,
        wide: bool,
        expected: u64,
        timeout_ns: i64,
        cancel: &AtomicBool,
    ) -> Result<u32> {
        let bytes = if wide { 8 } else { 4 };
        let addr = self.atomic_address(index, offset, bytes)?;
        let Some(shared) = self.shared() else {
            return Err(Failure::ExpectedSharedMemory.into());
        };
        let expected = if wide { expected } else { expected & 0xFFFF_FFFF };
        let timeout = u64::try_from(timeout_ns).ok().map(Duration::from_nanos);
        shared.wait(addr, bytes, expected, timeout, cancel)
    }

    /// `memory.atomic.notify`. Unshared memories have no waiters.
    pub(crate) fn atomic_notify(&self, index: u64, offset: u64, count: u32) -> Result<u32> {
        let addr = self.atomic_address(index, offset, 4)?;
        Ok(match self.shared() {
            Some(shared) => shared.notify(addr, count),
            None => 0,
        })
    }
}
