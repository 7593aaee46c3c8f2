//! The validity checker. Every intercepted allocate/free/reallocate/access
//! comes through here. We keep the ledger honest, check the operation against
//! it, tell the listeners, and hand the real work to the [`RawMemory`]
//! underneath.
//!
//! Illegal operations (double free, freeing or touching an address we are not
//! tracking) are *detections*. They are logged, sent to listeners as
//! [`MemoryEvent::IllegalAccess`], and reflected in the returned outcome's
//! `is_known_address`. They are never returned as an `Err` and never panic.
//!
//! # Ordering of a free
//!
//! ```plaintext
//! peek ledger -> BeforeFree -> [ free permit: remove from ledger, raw free ]
//!             -> IllegalAccess (if unknown) -> AfterFree
//! ```
//!
//! Listeners always run *outside* the permit. A listener may therefore call
//! back into the checker (even to do a checked access) without spinning on a
//! permit its own thread holds. The flip side is that `BeforeFree` carries a
//! preview of `is_known_address`: a racing free of the same address can
//! still get there first. `AfterFree` and the returned outcome are
//! authoritative.
//!
//! The entry is removed *before* the raw free. Doing it the other way round
//! would let another thread get the same address back from the allocator and
//! track it, only for us to untrack it.

use std::{io, sync::Arc};

use crate::{
    caller::{CallerInfo, CallerInfoRecorder},
    config::Config,
    dump::{DumpFormat, Dumper},
    error::{ConfigError, Error, IllegalAccessKind, IllegalMemoryAccess, Result},
    event::{EventBus, ListenerId, MemoryEvent, MemoryListener},
    guard::AccessGuard,
    ledger::EMPTY,
    raw::RawMemory,
    storage::{MemoryRecord, Storage},
    util::hint::cold,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeOutcome {
    pub is_known_address: bool,
    /// Tracked size of the freed block
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReallocOutcome {
    pub new_address: u64,
    pub is_known_address: bool,
    /// Tracked size of the old block
    pub old_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessOutcome {
    /// `false` if `safe_memory_access` is off. Unchecked accesses are never
    /// flagged, so `is_known_address` is then always `true`.
    pub checked: bool,
    pub is_known_address: bool,
    /// `(base, size)` of the allocation containing the access
    pub record: Option<(u64, u64)>,
}

impl AccessOutcome {
    const UNCHECKED: Self = Self {
        checked: false,
        is_known_address: true,
        record: None,
    };
}

pub struct ValidityChecker<M>
where
    M: RawMemory,
{
    config: Config,
    memory: M,
    storage: Storage,
    guard: AccessGuard,
    callers: Option<CallerInfoRecorder>,
    events: EventBus,
}

impl<M> ValidityChecker<M>
where
    M: RawMemory,
{
    pub fn new(config: Config, memory: M) -> Result<Self, ConfigError> {
        config.validate()?;
        log::debug!("validity checker up with {config:?}");
        Ok(Self {
            storage: Storage::new(&config),
            guard: AccessGuard::new(config.concurrent_access_check),
            callers: config
                .caller_info_monitoring
                .then(|| CallerInfoRecorder::new(config.max_caller_info_depth)),
            events: EventBus::new(),
            memory,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying memory. Anything done through this directly is
    /// invisible to the checker.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_listener<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: MemoryListener + 'static,
    {
        self.events.register(listener)
    }

    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        self.events.deregister(id)
    }

    // No closures here, they would show up as frames in the trail
    fn capture_caller(&self) -> Option<CallerInfo> {
        match &self.callers {
            Some(recorder) => Some(recorder.capture()),
            None => None,
        }
    }

    fn report(&self, kind: IllegalAccessKind, address: u64, size: u64) {
        let illegal = IllegalMemoryAccess {
            kind,
            address,
            size,
        };
        log::warn!("illegal memory access: {illegal}");
        self.events.dispatch(&MemoryEvent::IllegalAccess(illegal));
    }

    fn peek(&self, address: u64) -> Option<u64> {
        self.storage.read(|p| p.get(address)).flatten()
    }

    /// Allocate `size` bytes from the underlying memory and start tracking
    /// them. Allocator failure comes back as [`Error::AllocationFailure`];
    /// tracking itself never fails an allocation.
    pub fn on_allocate(&self, size: u64) -> Result<u64> {
        self.allocate_with(size, || self.memory.allocate(size))
    }

    /// [`ValidityChecker::on_allocate`], but with `allocate` doing the actual
    /// allocation. `None` (or `Some(0)`) means it failed.
    pub fn allocate_with<F>(&self, size: u64, allocate: F) -> Result<u64>
    where
        F: FnOnce() -> Option<u64>,
    {
        self.events.dispatch(&MemoryEvent::BeforeAllocate { size });
        let address = match allocate() {
            Some(address) if address != EMPTY => address,
            _ => {
                return cold(|| {
                    log::error!("allocation of {size} bytes failed");
                    Err(Error::AllocationFailure { size })
                })
            }
        };
        let caller = self.capture_caller();
        self.storage.write(|p| p.insert(address, size, caller));
        log::trace!("allocated {address:#x} ({size} bytes)");
        self.events
            .dispatch(&MemoryEvent::AfterAllocate { address, size });
        Ok(address)
    }

    /// Stop tracking `address` and free it. If we were not tracking it, that
    /// is reported (with `safe_memory_management` on) and the free goes ahead
    /// anyway: we can only flag it, not stop it.
    ///
    /// # Safety
    ///
    /// Whatever [`RawMemory::free`] requires of `address`.
    pub unsafe fn on_free(&self, address: u64) -> FreeOutcome {
        // SAFETY: passed on to caller
        self.free_with(address, || unsafe { self.memory.free(address) })
    }

    /// [`ValidityChecker::on_free`], but with `free` doing the actual free
    pub fn free_with<F>(&self, address: u64, free: F) -> FreeOutcome
    where
        F: FnOnce(),
    {
        let preview = self.peek(address);
        self.events.dispatch(&MemoryEvent::BeforeFree {
            address,
            size: preview,
            is_known_address: preview.is_some(),
        });

        let size = {
            let _permit = self.guard.acquire_free();
            let size = self.storage.write(|p| p.remove(address)).flatten();
            free();
            size
        };

        let is_known_address = size.is_some();
        if !is_known_address && self.config.safe_memory_management {
            cold(|| self.report(IllegalAccessKind::FreeOfUnknownAddress, address, 0));
        }
        log::trace!("freed {address:#x} (known: {is_known_address})");
        self.events.dispatch(&MemoryEvent::AfterFree {
            address,
            size,
            is_known_address,
        });
        FreeOutcome {
            is_known_address,
            size,
        }
    }

    /// Reallocate `address` to `new_size` bytes, moving the ledger entry to
    /// the new address. An untracked `address` is reported (with
    /// `safe_memory_management` on), and the reallocation goes ahead.
    ///
    /// If the underlying reallocation fails, the old entry stays tracked and
    /// [`Error::ReallocationFailure`] is returned.
    ///
    /// # Safety
    ///
    /// Whatever [`RawMemory::reallocate`] requires of `address`.
    pub unsafe fn on_reallocate(&self, address: u64, new_size: u64) -> Result<ReallocOutcome> {
        // SAFETY: passed on to caller
        self.reallocate_with(address, new_size, || unsafe {
            self.memory.reallocate(address, new_size)
        })
    }

    /// [`ValidityChecker::on_reallocate`], but with `reallocate` doing the
    /// actual reallocation. `None` (or `Some(0)`) means it failed and the old
    /// block is still live.
    pub fn reallocate_with<F>(
        &self,
        address: u64,
        new_size: u64,
        reallocate: F,
    ) -> Result<ReallocOutcome>
    where
        F: FnOnce() -> Option<u64>,
    {
        let preview = self.peek(address);
        self.events.dispatch(&MemoryEvent::BeforeReallocate {
            old_address: address,
            old_size: preview,
            new_size,
            is_known_address: preview.is_some(),
        });
        let caller = self.capture_caller();

        let (old, new_address) = {
            let _permit = self.guard.acquire_free();
            let old = self
                .storage
                .write(|p| {
                    let caller = p.caller_info(address).cloned();
                    p.remove(address).map(|size| (size, caller))
                })
                .flatten();
            let new_address = reallocate().filter(|&a| a != EMPTY);
            match (new_address, &old) {
                (Some(new_address), _) => {
                    self.storage
                        .write(|p| p.insert(new_address, new_size, caller));
                }
                (None, Some((size, caller))) => {
                    self.storage
                        .write(|p| p.insert(address, *size, caller.clone()));
                }
                (None, None) => {}
            }
            (old, new_address)
        };

        let old_size = old.map(|(size, _)| size);
        let is_known_address = old_size.is_some();
        if !is_known_address && self.config.safe_memory_management {
            cold(|| {
                self.report(
                    IllegalAccessKind::ReallocationOfUnknownAddress,
                    address,
                    new_size,
                )
            });
        }

        let Some(new_address) = new_address else {
            return cold(|| {
                log::error!("reallocation of {address:#x} to {new_size} bytes failed");
                Err(Error::ReallocationFailure {
                    address,
                    size: new_size,
                })
            });
        };
        log::trace!("reallocated {address:#x} -> {new_address:#x} ({new_size} bytes)");
        self.events.dispatch(&MemoryEvent::AfterReallocate {
            old_address: address,
            old_size,
            new_address,
            new_size,
            is_known_address,
        });
        Ok(ReallocOutcome {
            new_address,
            is_known_address,
            old_size,
        })
    }

    /// Track an allocation that somebody else already made. Used for custom
    /// memory management, where we observe the operation instead of
    /// performing it.
    pub fn record_allocation(&self, address: u64, size: u64) -> Result<u64> {
        self.allocate_with(size, || Some(address))
    }

    /// Untrack an address somebody else already freed
    pub fn record_free(&self, address: u64) -> FreeOutcome {
        self.free_with(address, || ())
    }

    pub fn record_reallocation(
        &self,
        old_address: u64,
        new_address: u64,
        new_size: u64,
    ) -> Result<ReallocOutcome> {
        self.reallocate_with(old_address, new_size, || Some(new_address))
    }

    /// Check that `address` lies inside a live allocation. Only does anything
    /// with `safe_memory_access` on.
    pub fn on_access(&self, address: u64, size: u64) -> AccessOutcome {
        self.access(address, size, || ()).0
    }

    /// Run `f` (the actual read or write) inside an access permit, if
    /// `address` checks out. If it does not, `f` is skipped and the access is
    /// reported. With `safe_memory_access` off, `f` always runs.
    ///
    /// `f` must not free or reallocate through this checker. With
    /// `concurrent_access_check` on, that would wait for the access permit
    /// its own thread is holding, and spin forever.
    pub fn access<R, F>(&self, address: u64, size: u64, f: F) -> (AccessOutcome, Option<R>)
    where
        F: FnOnce() -> R,
    {
        if !self.config.safe_memory_access {
            let _permit = self.guard.acquire_access();
            return (AccessOutcome::UNCHECKED, Some(f()));
        }

        let (record, value) = {
            let _permit = self.guard.acquire_access();
            let record = self.storage.read(|p| p.containing(address)).flatten();
            let value = record.map(|_| f());
            (record, value)
        };

        let is_known_address = record.is_some();
        if !is_known_address {
            cold(|| self.report(IllegalAccessKind::AccessToUnknownAddress, address, size));
        }
        let outcome = AccessOutcome {
            checked: true,
            is_known_address,
            record,
        };
        (outcome, value)
    }

    /// Checked read of `buf.len()` bytes at `address + offset`. `buf` is left
    /// alone if the access is refused.
    ///
    /// # Safety
    ///
    /// Whatever [`RawMemory::read`] requires. With `safe_memory_access` on we
    /// only verify the start address, not that the whole range is in bounds.
    pub unsafe fn read(&self, address: u64, offset: u64, buf: &mut [u8]) -> AccessOutcome {
        let at = address.wrapping_add(offset);
        // SAFETY: passed on to caller
        self.access(at, buf.len() as u64, || unsafe { self.memory.read(at, buf) })
            .0
    }

    /// Checked write of `bytes` at `address + offset`
    ///
    /// # Safety
    ///
    /// Whatever [`RawMemory::write`] requires, same caveat as
    /// [`ValidityChecker::read`].
    pub unsafe fn write(&self, address: u64, offset: u64, bytes: &[u8]) -> AccessOutcome {
        let at = address.wrapping_add(offset);
        // SAFETY: passed on to caller
        self.access(at, bytes.len() as u64, || unsafe {
            self.memory.write(at, bytes)
        })
        .0
    }

    /// Tracked size of exactly `address`
    pub fn get(&self, address: u64) -> Option<u64> {
        self.peek(address)
    }

    /// `(base, size)` of the live allocation containing `address`
    pub fn containing(&self, address: u64) -> Option<(u64, u64)> {
        self.storage.read(|p| p.containing(address)).flatten()
    }

    pub fn caller_info(&self, address: u64) -> Option<CallerInfo> {
        self.storage
            .read(|p| p.caller_info(address).cloned())
            .flatten()
    }

    /// Number of live allocations visible to this thread (all of them, unless
    /// storage is thread-partitioned)
    pub fn allocation_count(&self) -> usize {
        self.storage.read(|p| p.len()).unwrap_or(0)
    }

    /// Snapshot of every visible live allocation. Not atomic with respect to
    /// other threads' operations, but internally consistent.
    pub fn live_allocations(&self) -> Vec<MemoryRecord> {
        self.storage.read(|p| p.records()).unwrap_or_default()
    }

    /// Call `callback` for every visible live allocation. Runs on a snapshot,
    /// so `callback` is free to call back into the checker.
    pub fn iterate_live_allocations<F>(&self, callback: F)
    where
        F: FnMut(MemoryRecord),
    {
        self.live_allocations().into_iter().for_each(callback)
    }

    pub fn dump<W>(&self, sink: W, format: DumpFormat) -> io::Result<()>
    where
        W: io::Write,
    {
        Dumper::new(format).write(&self.live_allocations(), sink)
    }
}
