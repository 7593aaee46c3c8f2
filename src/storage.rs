//! Where the ledger lives.
//!
//! In the default mode there is one [`Partition`] for the whole process,
//! behind an `RwLock`: lookups share the read side, anything that can move
//! entries around (insert, remove, and so resize) takes the write side. A
//! lookup therefore never sees a table halfway through a rehash.
//!
//! With thread-partitioned storage every thread gets its own [`Partition`]
//! and never sees anyone else's. Freeing (or touching) memory that another
//! thread allocated is reported as an unknown address. That is the whole
//! point of the mode, not a bug: no sharing, no lock.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{caller::CallerInfo, config::Config, ledger::Ledger, serialize::serde_addr};

/// One live allocation, as reported to the outside world
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRecord {
    #[serde(with = "serde_addr")]
    pub address: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerInfo>,
}

/// A ledger plus two side tables keyed the same way: caller info, and the
/// live bases in address order for interior lookups
pub struct Partition {
    ledger: Ledger,
    callers: HashMap<u64, CallerInfo, RandomState>,
    bases: BTreeMap<u64, u64>,
}

impl Partition {
    pub fn new(initial_capacity: usize, load_factor: f64) -> Self {
        Self {
            ledger: Ledger::with_capacity_and_load_factor(initial_capacity, load_factor),
            callers: HashMap::with_hasher(RandomState::new()),
            bases: BTreeMap::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Track `address`. Any caller info left over from a previous entry at
    /// the same address is replaced (or dropped if `caller` is `None`).
    pub fn insert(&mut self, address: u64, size: u64, caller: Option<CallerInfo>) -> Option<u64> {
        match caller {
            Some(caller) => {
                self.callers.insert(address, caller);
            }
            None => {
                self.callers.remove(&address);
            }
        }
        let previous = self.ledger.insert(address, size);
        self.bases.insert(address, size);
        previous
    }

    pub fn remove(&mut self, address: u64) -> Option<u64> {
        self.callers.remove(&address);
        self.bases.remove(&address);
        self.ledger.remove(address)
    }

    pub fn get(&self, address: u64) -> Option<u64> {
        self.ledger.get(address)
    }

    /// Same answer as [`Ledger::containing`], in `O(log n)` instead of a
    /// scan. Only the nearest base below `address` is considered, which is
    /// enough as long as live blocks do not overlap.
    pub fn containing(&self, address: u64) -> Option<(u64, u64)> {
        if let Some(size) = self.ledger.get(address) {
            return Some((address, size));
        }
        let (&base, &size) = self.bases.range(..address).next_back()?;
        (address - base < size).then_some((base, size))
    }

    pub fn caller_info(&self, address: u64) -> Option<&CallerInfo> {
        self.callers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }

    pub fn record(&self, address: u64, size: u64) -> MemoryRecord {
        MemoryRecord {
            address,
            size,
            caller: self.callers.get(&address).cloned(),
        }
    }

    /// Copy out every live allocation, in ledger order
    pub fn records(&self) -> Vec<MemoryRecord> {
        self.ledger
            .iter()
            .map(|(address, size)| self.record(address, size))
            .collect()
    }
}

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// storage id -> this thread's partition of it
    static PARTITIONS: RefCell<HashMap<u64, Partition>> = RefCell::new(HashMap::new());
}

pub enum Storage {
    Shared(RwLock<Partition>),
    PerThread {
        id: u64,
        initial_capacity: usize,
        load_factor: f64,
    },
}

impl Storage {
    pub fn new(config: &Config) -> Self {
        if config.thread_partitioned_storage {
            Self::PerThread {
                id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
                initial_capacity: config.ledger_initial_capacity,
                load_factor: config.ledger_load_factor,
            }
        } else {
            Self::Shared(RwLock::new(Partition::new(
                config.ledger_initial_capacity,
                config.ledger_load_factor,
            )))
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::PerThread { .. })
    }

    /// Run `f` on the visible partition. Returns `None` only if this thread's
    /// locals are already being torn down.
    pub fn read<R>(&self, f: impl FnOnce(&Partition) -> R) -> Option<R> {
        match self {
            Self::Shared(partition) => Some(f(&partition.read())),
            Self::PerThread { .. } => self.with_local(|partition| f(partition)),
        }
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Partition) -> R) -> Option<R> {
        match self {
            Self::Shared(partition) => Some(f(&mut partition.write())),
            Self::PerThread { .. } => self.with_local(f),
        }
    }

    fn with_local<R>(&self, f: impl FnOnce(&mut Partition) -> R) -> Option<R> {
        let Self::PerThread {
            id,
            initial_capacity,
            load_factor,
        } = *self
        else {
            return None;
        };
        PARTITIONS
            .try_with(|partitions| {
                let mut partitions = partitions.borrow_mut();
                let partition = partitions
                    .entry(id)
                    .or_insert_with(|| Partition::new(initial_capacity, load_factor));
                f(partition)
            })
            .ok()
    }
}

impl Drop for Storage {
    /// Only the current thread's partition can be reached from here. Other
    /// threads drop theirs when they exit.
    fn drop(&mut self) {
        if let Self::PerThread { id, .. } = *self {
            let _ = PARTITIONS.try_with(|partitions| partitions.borrow_mut().remove(&id));
        }
    }
}
