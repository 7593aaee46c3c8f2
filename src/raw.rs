//! The raw, unchecked memory facility we sit on top of. It knows nothing about
//! liveness: handing it a bad address is exactly the kind of thing the rest
//! of this crate exists to catch.

use std::{collections::BTreeMap, ptr, sync::Arc};

use parking_lot::Mutex;

use crate::util::{hint::cold, num::round_up};

/// Allocate/free/reallocate/read/write by numeric address. `0` is never a
/// valid address, allocators report failure with `None`.
pub trait RawMemory: Send + Sync {
    fn allocate(&self, size: u64) -> Option<u64>;

    /// # Safety
    ///
    /// Same contract as the underlying `free()`. We do not (and can not) check
    /// it here.
    unsafe fn free(&self, address: u64);

    /// On failure the old block is untouched, as with `realloc()`
    ///
    /// # Safety
    ///
    /// `address` must be a live block from this allocator.
    unsafe fn reallocate(&self, address: u64, size: u64) -> Option<u64>;

    /// # Safety
    ///
    /// `address..address + buf.len()` must be readable.
    unsafe fn read(&self, address: u64, buf: &mut [u8]);

    /// # Safety
    ///
    /// `address..address + bytes.len()` must be writable, and nobody else may
    /// be reading it.
    unsafe fn write(&self, address: u64, bytes: &[u8]);
}

impl<M> RawMemory for Arc<M>
where
    M: RawMemory + ?Sized,
{
    fn allocate(&self, size: u64) -> Option<u64> {
        (**self).allocate(size)
    }

    unsafe fn free(&self, address: u64) {
        (**self).free(address)
    }

    unsafe fn reallocate(&self, address: u64, size: u64) -> Option<u64> {
        (**self).reallocate(address, size)
    }

    unsafe fn read(&self, address: u64, buf: &mut [u8]) {
        (**self).read(address, buf)
    }

    unsafe fn write(&self, address: u64, bytes: &[u8]) {
        (**self).write(address, bytes)
    }
}

pub(crate) mod c {
    pub use libc::{free, malloc, realloc};
}

/// The process heap, through libc's `malloc()` family
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcMemory;

impl RawMemory for LibcMemory {
    fn allocate(&self, size: u64) -> Option<u64> {
        let size = usize::try_from(size).ok()?;
        // SAFETY: `malloc()` has no preconditions
        let data = unsafe { c::malloc(size) };
        if data.is_null() {
            return cold(|| None);
        }
        Some(data as u64)
    }

    unsafe fn free(&self, address: u64) {
        // SAFETY: passed on to caller
        unsafe { c::free(address as *mut libc::c_void) }
    }

    unsafe fn reallocate(&self, address: u64, size: u64) -> Option<u64> {
        let size = usize::try_from(size).ok()?;
        // SAFETY: passed on to caller
        let data = unsafe { c::realloc(address as *mut libc::c_void, size) };
        if data.is_null() {
            return cold(|| None);
        }
        Some(data as u64)
    }

    unsafe fn read(&self, address: u64, buf: &mut [u8]) {
        // SAFETY:
        // - caller asserts the source range is readable
        // - `buf` is a unique borrow, so it can't overlap the source
        unsafe { ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len()) }
    }

    unsafe fn write(&self, address: u64, bytes: &[u8]) {
        // SAFETY: caller asserts the destination range is writable and unshared
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len()) }
    }
}

const SIM_BASE: u64 = 0x1_0000;
const SIM_ALIGN: u64 = 16;

#[derive(Default)]
struct SimHeap {
    /// base -> contents, sized to the rounded-up block size
    blocks: BTreeMap<u64, Vec<u8>>,
    /// Freed blocks, reused first-fit
    free_list: Vec<(u64, u64)>,
    next: u64,
    in_use: u64,
    limit: Option<u64>,
}

impl SimHeap {
    fn block_size(size: u64) -> Option<u64> {
        round_up(size.max(1), SIM_ALIGN)
    }

    /// A zeroed buffer of `block` bytes, or `None` if the real heap says no
    fn contents(block: u64) -> Option<Vec<u8>> {
        let len = usize::try_from(block).ok()?;
        let mut contents = Vec::new();
        contents.try_reserve_exact(len).ok()?;
        contents.resize(len, 0);
        Some(contents)
    }

    fn allocate(&mut self, size: u64) -> Option<u64> {
        let block = Self::block_size(size)?;
        if let Some(limit) = self.limit {
            if self.in_use.checked_add(block)? > limit {
                return None;
            }
        }
        let contents = Self::contents(block)?;
        let address = match self.free_list.iter().position(|&(_, cap)| cap >= block) {
            Some(i) => self.free_list.swap_remove(i).0,
            None => {
                let address = self.next;
                self.next = self.next.checked_add(block)?;
                address
            }
        };
        self.blocks.insert(address, contents);
        self.in_use += block;
        Some(address)
    }

    fn free(&mut self, address: u64) -> bool {
        match self.blocks.remove(&address) {
            Some(contents) => {
                let block = contents.len() as u64;
                self.in_use -= block;
                self.free_list.push((address, block));
                true
            }
            None => false,
        }
    }

    /// The bytes `address..address + len`, if they all sit inside one block
    fn span_mut(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
        let (&base, contents) = self.blocks.range_mut(..=address).next_back()?;
        let start = (address - base) as usize;
        contents.get_mut(start..start.checked_add(len)?)
    }
}

/// A pretend heap living in ordinary Rust collections. Addresses are fake
/// (they start at `0x10000`), but everything is observable and nothing is
/// ever UB: freeing an unknown address is ignored, and reads outside any
/// block come back as zeroes.
///
/// Handy for tests, and for dry-running the checker against a recorded
/// workload.
pub struct SimulatedMemory {
    heap: Mutex<SimHeap>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(SimHeap {
                next: SIM_BASE,
                ..SimHeap::default()
            }),
        }
    }

    /// Refuse any allocation that would take the heap past `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        let memory = Self::new();
        memory.heap.lock().limit = Some(limit);
        memory
    }

    /// Number of blocks currently allocated
    pub fn live_blocks(&self) -> usize {
        self.heap.lock().blocks.len()
    }

    pub fn is_live(&self, address: u64) -> bool {
        self.heap.lock().blocks.contains_key(&address)
    }

    /// Bytes in use, after rounding each block up to 16
    pub fn bytes_in_use(&self) -> u64 {
        self.heap.lock().in_use
    }
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMemory for SimulatedMemory {
    fn allocate(&self, size: u64) -> Option<u64> {
        self.heap.lock().allocate(size)
    }

    unsafe fn free(&self, address: u64) {
        if !self.heap.lock().free(address) {
            log::trace!("simulated free of unknown block {address:#x} ignored");
        }
    }

    unsafe fn reallocate(&self, address: u64, size: u64) -> Option<u64> {
        let mut heap = self.heap.lock();
        let old = heap.blocks.get(&address)?.clone();
        let new = heap.allocate(size)?;
        let contents = heap.blocks.get_mut(&new)?;
        let n = old.len().min(contents.len());
        contents[..n].copy_from_slice(&old[..n]);
        heap.free(address);
        Some(new)
    }

    unsafe fn read(&self, address: u64, buf: &mut [u8]) {
        match self.heap.lock().span_mut(address, buf.len()) {
            Some(span) => buf.copy_from_slice(span),
            None => buf.fill(0),
        }
    }

    unsafe fn write(&self, address: u64, bytes: &[u8]) {
        if let Some(span) = self.heap.lock().span_mut(address, bytes.len()) {
            span.copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_round_trip() {
        let memory = LibcMemory;
        let address = memory.allocate(32).unwrap();
        unsafe {
            memory.write(address, b"hello");
            let address = memory.reallocate(address, 64).unwrap();
            let mut buf = [0u8; 5];
            memory.read(address, &mut buf);
            assert_eq!(&buf, b"hello");
            memory.free(address);
        }
    }

    #[test]
    fn simulated_blocks_are_aligned_and_distinct() {
        let memory = SimulatedMemory::new();
        let a = memory.allocate(100).unwrap();
        let b = memory.allocate(1).unwrap();
        assert_eq!(a % SIM_ALIGN, 0);
        assert_eq!(b % SIM_ALIGN, 0);
        assert!(b >= a + 100);
        assert_eq!(memory.live_blocks(), 2);
    }

    #[test]
    fn simulated_free_reuses_and_tolerates_unknown() {
        let memory = SimulatedMemory::new();
        let a = memory.allocate(64).unwrap();
        unsafe {
            memory.free(a);
            memory.free(a);
            memory.free(0xdead_0000);
        }
        assert_eq!(memory.live_blocks(), 0);
        assert_eq!(memory.allocate(32), Some(a));
    }

    #[test]
    fn simulated_limit_fails_allocation() {
        let memory = SimulatedMemory::with_limit(64);
        assert!(memory.allocate(48).is_some());
        assert_eq!(memory.allocate(32), None);
        assert_eq!(memory.bytes_in_use(), 48);
    }

    #[test]
    fn simulated_oversized_allocation_fails() {
        let memory = SimulatedMemory::new();
        assert_eq!(memory.allocate(u64::MAX), None);
        assert_eq!(memory.allocate(u64::MAX - 8), None);
        assert_eq!(memory.allocate(1 << 62), None);
        assert_eq!(memory.live_blocks(), 0);
        assert_eq!(memory.bytes_in_use(), 0);
        // Nothing was consumed by the failed attempts
        assert_eq!(memory.allocate(8), Some(SIM_BASE));
    }

    #[test]
    fn simulated_reallocate_copies_contents() {
        let memory = SimulatedMemory::new();
        let a = memory.allocate(4).unwrap();
        unsafe {
            memory.write(a + 1, &[1, 2, 3]);
            let b = memory.reallocate(a, 64).unwrap();
            assert!(!memory.is_live(a));
            let mut buf = [9u8; 4];
            memory.read(b, &mut buf);
            assert_eq!(buf, [0, 1, 2, 3]);
            assert_eq!(memory.reallocate(0xdead_0000, 8), None);
        }
    }
}
