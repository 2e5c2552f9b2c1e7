//! Shared linear memory.
//!
//! Bytes are packed little-endian into `AtomicU64` cells. Every atomic
//! instruction is a single-cell CAS, so instances running on different
//! threads observe each other's atomics linearly. Plain accesses touch cells
//! with relaxed ordering and never clobber neighbouring bytes.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use super::{MemoryType, PAGE_SIZE};
use crate::trap::{Failure, Result, Trap};

const CELL: usize = 8;

/// Longest a parked waiter sleeps before re-checking its cancel flag.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct WaitQueue {
    next_ticket: u64,
    /// Parked waiters in arrival order: `(address, ticket)`.
    parked: VecDeque<(u64, u64)>,
    /// Tickets that have been notified but not yet observed by their waiter.
    woken: HashSet<u64>,
}

struct Inner {
    ty: MemoryType,
    cells: RwLock<Vec<AtomicU64>>,
    queue: Mutex<WaitQueue>,
    wakeup: Condvar,
}

/// A memory that can be imported by several instances at once.
#[derive(Clone)]
pub struct SharedMemory(Arc<Inner>);

/// Result of `memory.atomic.wait*`.
pub const WAIT_OK: u32 = 0;
pub const WAIT_NOT_EQUAL: u32 = 1;
pub const WAIT_TIMED_OUT: u32 = 2;

fn cells_for(pages: u64) -> Option<usize> {
    usize::try_from(pages.checked_mul(PAGE_SIZE)? / CELL as u64).ok()
}

#[inline]
fn width_mask(bytes: u32) -> u64 {
    if bytes >= 8 { u64::MAX } else { (1u64 << (bytes * 8)) - 1 }
}

impl SharedMemory {
    pub fn new(ty: MemoryType) -> Result<Self> {
        let ty = MemoryType { shared: true, ..ty };
        let n = cells_for(ty.min)
            .filter(|_| ty.min <= ty.page_limit())
            .ok_or_else(|| Trap::InvalidModule(format!("memory of {} pages is too large", ty.min)))?;
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(n)
            .map_err(|_| Trap::InvalidModule(format!("cannot allocate {} pages", ty.min)))?;
        cells.resize_with(n, || AtomicU64::new(0));
        Ok(SharedMemory(Arc::new(Inner {
            ty,
            cells: RwLock::new(cells),
            queue: Mutex::new(WaitQueue::default()),
            wakeup: Condvar::new(),
        })))
    }

    pub fn ty(&self) -> MemoryType {
        self.0.ty
    }

    pub fn size(&self) -> u64 {
        (self.0.cells.read().len() * CELL) as u64
    }

    pub fn ptr_eq(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Grows under the write lock so concurrent growers see consistent sizes.
    pub(crate) fn grow(&self, delta: u64, ceiling: u64) -> Option<u64> {
        let mut cells = self.0.cells.write();
        let old = (cells.len() * CELL) as u64 / PAGE_SIZE;
        let new = old.checked_add(delta).filter(|&n| n <= ceiling)?;
        let n = cells_for(new)?;
        let extra = n - cells.len();
        cells.try_reserve_exact(extra).ok()?;
        cells.resize_with(n, || AtomicU64::new(0));
        Some(old)
    }

    // ── Plain accesses (bounds already checked) ──────────────────────────────

    pub(crate) fn read(&self, addr: u64, buf: &mut [u8]) {
        let cells = self.0.cells.read();
        let mut a = addr as usize;
        let mut i = 0;
        while i < buf.len() {
            let start = a % CELL;
            let n = (CELL - start).min(buf.len() - i);
            let word = cells[a / CELL].load(Ordering::Relaxed).to_le_bytes();
            buf[i..i + n].copy_from_slice(&word[start..start + n]);
            i += n;
            a += n;
        }
    }

    pub(crate) fn write(&self, addr: u64, data: &[u8]) {
        let cells = self.0.cells.read();
        let mut a = addr as usize;
        let mut i = 0;
        while i < data.len() {
            let start = a % CELL;
            let n = (CELL - start).min(data.len() - i);
            let cell = &cells[a / CELL];
            let mut bytes = [0u8; CELL];
            bytes[start..start + n].copy_from_slice(&data[i..i + n]);
            let value = u64::from_le_bytes(bytes);
            if n == CELL {
                cell.store(value, Ordering::Relaxed);
            } else {
                let mask = width_mask(n as u32) << (start * 8);
                let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    Some((w & !mask) | value)
                });
            }
            i += n;
            a += n;
        }
    }

    pub(crate) fn fill(&self, addr: u64, value: u8, len: u64) {
        let chunk = [value; 4096];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk.len() as u64);
            self.write(addr + done, &chunk[..n as usize]);
            done += n;
        }
    }

    // ── Atomics (bounds and alignment already checked) ───────────────────────

    pub(crate) fn load_atomic(&self, addr: u64, bytes: u32) -> u64 {
        let cells = self.0.cells.read();
        let shift = (addr % CELL as u64) * 8;
        (cells[addr as usize / CELL].load(Ordering::SeqCst) >> shift) & width_mask(bytes)
    }

    /// Applies `f` to the `bytes`-wide value at `addr` in one CAS loop and
    /// returns the previous value. `f` returning `None` leaves memory as is.
    pub(crate) fn update<F>(&self, addr: u64, bytes: u32, mut f: F) -> u64
    where
        F: FnMut(u64) -> Option<u64>,
    {
        let cells = self.0.cells.read();
        let shift = (addr % CELL as u64) * 8;
        let mask = width_mask(bytes) << shift;
        let prev = cells[addr as usize / CELL].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
            f((w & mask) >> shift).map(|new| (w & !mask) | ((new << shift) & mask))
        });
        let word = match prev {
            Ok(w) | Err(w) => w,
        };
        (word & mask) >> shift
    }

    /// Parks the calling thread while the value at `addr` equals `expected`.
    /// `timeout` of `None` waits forever. A raised `cancel` flag unparks the
    /// waiter with a `Cancelled` trap within one wait slice.
    pub(crate) fn wait(
        &self,
        addr: u64,
        bytes: u32,
        expected: u64,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<u32> {
        let mut queue = self.0.queue.lock();
        // Checked under the queue lock: a notifier that stored first is seen
        // here, one that stores later finds this waiter parked.
        if self.load_atomic(addr, bytes) != expected {
            return Ok(WAIT_NOT_EQUAL);
        }
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.parked.push_back((addr, ticket));
        trace!(addr, ticket, "atomic wait parked");

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if queue.woken.remove(&ticket) {
                return Ok(WAIT_OK);
            }
            if cancel.load(Ordering::Relaxed) {
                queue.parked.retain(|&(_, t)| t != ticket);
                return Err(Trap::with_detail(Failure::Cancelled, "interrupted while waiting"));
            }
            let slice_end = Instant::now() + WAIT_SLICE;
            match deadline {
                Some(deadline) if deadline <= slice_end => {
                    if self.0.wakeup.wait_until(&mut queue, deadline).timed_out() {
                        if queue.woken.remove(&ticket) {
                            return Ok(WAIT_OK);
                        }
                        queue.parked.retain(|&(_, t)| t != ticket);
                        return Ok(WAIT_TIMED_OUT);
                    }
                }
                _ => {
                    self.0.wakeup.wait_until(&mut queue, slice_end);
                }
            }
        }
    }

    /// Wakes up to `count` waiters parked on `addr`, oldest first.
    pub(crate) fn notify(&self, addr: u64, count: u32) -> u32 {
        let mut queue = self.0.queue.lock();
        let mut woken = 0u32;
        while woken < count {
            let Some(pos) = queue.parked.iter().position(|&(a, _)| a == addr) else {
                break;
            };
            if let Some((_, ticket)) = queue.parked.remove(pos) {
                queue.woken.insert(ticket);
                woken += 1;
            }
        }
        if woken > 0 {
            self.0.wakeup.notify_all();
        }
        woken
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("ty", &self.0.ty)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(pages: u64) -> SharedMemory {
        SharedMemory::new(MemoryType::new(pages, Some(4))).unwrap()
    }

    #[test]
    fn unaligned_plain_access_spans_cells() {
        let m = shared(1);
        m.write(5, &[1, 2, 3, 4, 5, 6]);
        let mut out = [0u8; 8];
        m.read(4, &mut out);
        assert_eq!(out, [0, 1, 2, 3, 4, 5, 6, 0]);
    }

    #[test]
    fn narrow_update_keeps_neighbours() {
        let m = shared(1);
        m.write(0, &[0xFF; 8]);
        let prev = m.update(2, 2, |v| Some(v.wrapping_add(1)));
        assert_eq!(prev, 0xFFFF);
        let mut out = [0u8; 8];
        m.read(0, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn wait_not_equal_and_timeout() {
        let m = shared(1);
        let calm = AtomicBool::new(false);
        assert_eq!(m.wait(0, 4, 1, Some(Duration::from_millis(1)), &calm), Ok(WAIT_NOT_EQUAL));
        assert_eq!(m.wait(0, 4, 0, Some(Duration::from_millis(1)), &calm), Ok(WAIT_TIMED_OUT));
        assert_eq!(m.notify(0, 1), 0);
    }

    #[test]
    fn notify_wakes_parked_waiter() {
        let m = shared(1);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| m.wait(8, 8, 0, None, &AtomicBool::new(false)));
            // spin until the waiter is parked
            loop {
                if m.0.queue.lock().parked.len() == 1 {
                    break;
                }
                std::thread::yield_now();
            }
            assert_eq!(m.notify(8, 4), 1);
            assert_eq!(waiter.join().unwrap(), Ok(WAIT_OK));
        });
    }

    #[test]
    fn cancel_unparks_an_endless_wait() {
        let m = shared(1);
        let cancel = AtomicBool::new(false);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| m.wait(0, 4, 0, None, &cancel));
            loop {
                if m.0.queue.lock().parked.len() == 1 {
                    break;
                }
                std::thread::yield_now();
            }
            cancel.store(true, Ordering::Relaxed);
            let err = waiter.join().unwrap().unwrap_err();
            assert_eq!(err.failure(), Some(Failure::Cancelled));
        });
        assert!(m.0.queue.lock().parked.is_empty());
        assert_eq!(m.notify(0, 1), 0);
    }

    #[test]
    fn grown_pages_start_zeroed() {
        let m = shared(1);
        m.write(PAGE_SIZE - 4, &[0xAB; 4]);
        assert_eq!(m.grow(2, 4), Some(1));
        let mut out = [0xFFu8; 8];
        m.read(PAGE_SIZE - 4, &mut out);
        assert_eq!(out, [0xAB, 0xAB, 0xAB, 0xAB, 0, 0, 0, 0]);
        let mut tail = [0xFFu8; 8];
        m.read(3 * PAGE_SIZE - 8, &mut tail);
        assert_eq!(tail, [0; 8]);
    }

    #[test]
    fn grow_is_shared_by_clones() {
        let a = shared(1);
        let b = a.clone();
        assert_eq!(a.grow(1, 4), Some(1));
        assert_eq!(b.size(), 2 * PAGE_SIZE);
        assert_eq!(b.grow(3, 4), None);
        assert!(a.ptr_eq(&b));
    }
}
