//! A two-category gate: any number of *accessors* may be inside at once, and
//! any number of *freers* may be inside at once, but never one of each.
//!
//! Entering is "increment, verify, rollback-and-retry":
//!
//! ```plaintext
//! loop {
//!     mine += 1           <-- [1]
//!     if theirs == 0 { break }
//!     mine -= 1
//! }
//! ```
//!
//! If the other side is doing the same thing, at least one of us sees the
//! other's increment at [1] (both are `SeqCst`, so the two increments have a
//! single total order), and that one backs off. It is possible that *both*
//! back off, in which case we both go round again.
//!
//! # Liveness
//!
//! There is no fairness whatsoever. A steady stream of accessors can keep
//! `accessors` above zero forever and starve every freer (and vice versa).
//! We accept that: the critical sections are a handful of raw memory ops, so
//! in practice the counters hit zero constantly.
//!
//! Nothing here ever blocks or parks. The only waiting is the spin in
//! [`AccessGuard::acquire`].

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Reads and writes of tracked memory
    Access,
    /// Frees and reallocations
    Free,
}

pub struct AccessGuard {
    enabled: bool,
    accessors: CachePadded<AtomicUsize>,
    freers: CachePadded<AtomicUsize>,
}

/// RAII permit. While it exists, nobody from the other [`Category`] is inside
/// the gate. `Drop` leaves the gate.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    /// `None` if the gate is disabled
    counter: Option<&'a AtomicUsize>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::Release);
        }
    }
}

impl AccessGuard {
    /// A disabled gate hands out permits that do nothing. The caller is then
    /// on the hook for making sure frees and accesses never race.
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            accessors: CachePadded::new(AtomicUsize::new(0)),
            freers: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn counters(&self, category: Category) -> (&AtomicUsize, &AtomicUsize) {
        match category {
            Category::Access => (&self.accessors, &self.freers),
            Category::Free => (&self.freers, &self.accessors),
        }
    }

    /// Spin until we are inside the gate as `category`
    pub fn acquire(&self, category: Category) -> Permit<'_> {
        if !self.enabled {
            return Permit { counter: None };
        }
        let (mine, theirs) = self.counters(category);
        let backoff = Backoff::new();
        loop {
            mine.fetch_add(1, Ordering::SeqCst);
            if theirs.load(Ordering::SeqCst) == 0 {
                break;
            }
            // The other side got here first (or at the same time), back off
            // and let them finish.
            mine.fetch_sub(1, Ordering::SeqCst);
            while theirs.load(Ordering::Relaxed) != 0 {
                backoff.spin();
            }
        }
        Permit {
            counter: Some(mine),
        }
    }

    pub fn acquire_access(&self) -> Permit<'_> {
        self.acquire(Category::Access)
    }

    pub fn acquire_free(&self) -> Permit<'_> {
        self.acquire(Category::Free)
    }

    /// Threads currently holding (or trying to take) an access permit
    pub fn active_accessors(&self) -> usize {
        self.accessors.load(Ordering::Acquire)
    }

    /// Threads currently holding (or trying to take) a free permit
    pub fn active_freers(&self) -> usize {
        self.freers.load(Ordering::Acquire)
    }
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::new(true)
    }
}
