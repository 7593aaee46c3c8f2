//! Custom memory management: the host has its own allocator functions and
//! tells us which of them allocate, free or reallocate, and where in their
//! argument lists the interesting values sit.
//!
//! Argument positions are 1-based, as a human would count them. The defaults
//! match the usual C shapes: `alloc(size)`, `free(address)` and
//! `realloc(address, size)`.
//!
//! ```
//! # use memward::{callsite::{CallSiteTable, Invoked}, config::Config,
//! #     checker::ValidityChecker, raw::SimulatedMemory};
//! let config = Config::builder().custom_memory_management(true).build().unwrap();
//! let checker = ValidityChecker::new(config, SimulatedMemory::new()).unwrap();
//! let sites = CallSiteTable::new();
//! sites.register_allocation("pool_get", Some(2));
//!
//! // pool_get(pool, size)
//! let invoked = sites
//!     .invoke(&checker, "pool_get", &[7, 128], |_args| 0x4000)
//!     .unwrap();
//! assert_eq!(invoked, Invoked::Allocated(0x4000));
//! assert_eq!(checker.get(0x4000), Some(128));
//! ```

use std::fmt;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::{
    checker::{FreeOutcome, ReallocOutcome, ValidityChecker},
    error::{Error, Result},
    raw::RawMemory,
};

pub const DEFAULT_ALLOCATION_SIZE_POSITION: usize = 1;
pub const DEFAULT_FREE_ADDRESS_POSITION: usize = 1;
pub const DEFAULT_REALLOCATION_OLD_ADDRESS_POSITION: usize = 1;
pub const DEFAULT_REALLOCATION_NEW_SIZE_POSITION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Allocation,
    Free,
    Reallocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    Allocation {
        size_position: usize,
    },
    Free {
        address_position: usize,
    },
    Reallocation {
        old_address_position: usize,
        new_size_position: usize,
    },
}

impl CallSite {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Allocation { .. } => OperationKind::Allocation,
            Self::Free { .. } => OperationKind::Free,
            Self::Reallocation { .. } => OperationKind::Reallocation,
        }
    }
}

/// What a call site did, as seen by the checker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invoked {
    Allocated(u64),
    Freed(FreeOutcome),
    Reallocated(ReallocOutcome),
}

#[derive(Default)]
pub struct CallSiteTable {
    sites: RwLock<HashMap<String, CallSite, RandomState>>,
}

impl CallSiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, site: CallSite) -> Option<CallSite> {
        log::debug!("registered {:?} call site {name:?}", site.kind());
        self.sites.write().insert(name.to_owned(), site)
    }

    /// Returns whatever `name` was registered as before, if anything
    pub fn register_allocation(&self, name: &str, size_position: Option<usize>) -> Option<CallSite> {
        self.register(name, CallSite::Allocation {
            size_position: size_position.unwrap_or(DEFAULT_ALLOCATION_SIZE_POSITION),
        })
    }

    pub fn register_free(&self, name: &str, address_position: Option<usize>) -> Option<CallSite> {
        self.register(name, CallSite::Free {
            address_position: address_position.unwrap_or(DEFAULT_FREE_ADDRESS_POSITION),
        })
    }

    pub fn register_reallocation(
        &self,
        name: &str,
        old_address_position: Option<usize>,
        new_size_position: Option<usize>,
    ) -> Option<CallSite> {
        self.register(name, CallSite::Reallocation {
            old_address_position: old_address_position
                .unwrap_or(DEFAULT_REALLOCATION_OLD_ADDRESS_POSITION),
            new_size_position: new_size_position.unwrap_or(DEFAULT_REALLOCATION_NEW_SIZE_POSITION),
        })
    }

    pub fn deregister(&self, name: &str) -> Option<CallSite> {
        self.sites.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<CallSite> {
        self.sites.read().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.sites.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `original` (the host's own function, called with `args`) as call
    /// site `name`, and tell `checker` about it.
    ///
    /// `original` returns the new address for allocations and
    /// reallocations, `0` meaning failure. Its return value is ignored for
    /// frees.
    pub fn invoke<M, F>(
        &self,
        checker: &ValidityChecker<M>,
        name: &str,
        args: &[u64],
        original: F,
    ) -> Result<Invoked>
    where
        M: RawMemory,
        F: FnOnce(&[u64]) -> u64,
    {
        if !checker.config().custom_memory_management {
            return Err(Error::CustomManagementDisabled);
        }
        let site = self
            .get(name)
            .ok_or_else(|| Error::UnknownCallSite(name.to_owned()))?;
        let arg = |position: usize| {
            position
                .checked_sub(1)
                .and_then(|i| args.get(i))
                .copied()
                .ok_or_else(|| Error::MissingArgument {
                    call_site: name.to_owned(),
                    position,
                })
        };

        match site {
            CallSite::Allocation { size_position } => {
                let size = arg(size_position)?;
                checker
                    .allocate_with(size, || Some(original(args)))
                    .map(Invoked::Allocated)
            }
            CallSite::Free { address_position } => {
                let address = arg(address_position)?;
                Ok(Invoked::Freed(checker.free_with(address, || {
                    original(args);
                })))
            }
            CallSite::Reallocation {
                old_address_position,
                new_size_position,
            } => {
                let address = arg(old_address_position)?;
                let new_size = arg(new_size_position)?;
                checker
                    .reallocate_with(address, new_size, || Some(original(args)))
                    .map(Invoked::Reallocated)
            }
        }
    }
}

impl fmt::Debug for CallSiteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.sites.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{config::Config, error::IllegalAccessKind, event::MemoryEvent, raw::SimulatedMemory};

    fn custom_checker() -> ValidityChecker<SimulatedMemory> {
        let config = Config::builder()
            .custom_memory_management(true)
            .safe_memory_management(true)
            .build()
            .unwrap();
        ValidityChecker::new(config, SimulatedMemory::new()).unwrap()
    }

    #[test]
    fn defaults_follow_c_shapes() {
        let sites = CallSiteTable::new();
        sites.register_allocation("alloc", None);
        sites.register_free("release", None);
        sites.register_reallocation("resize", None, None);
        assert_eq!(sites.get("alloc"), Some(CallSite::Allocation { size_position: 1 }));
        assert_eq!(sites.get("release"), Some(CallSite::Free { address_position: 1 }));
        assert_eq!(
            sites.get("resize"),
            Some(CallSite::Reallocation {
                old_address_position: 1,
                new_size_position: 2
            })
        );
        assert_eq!(sites.get("resize").map(|s| s.kind()), Some(OperationKind::Reallocation));
    }

    #[test]
    fn reregistering_replaces() {
        let sites = CallSiteTable::new();
        assert_eq!(sites.register_free("release", None), None);
        assert_eq!(
            sites.register_free("release", Some(3)),
            Some(CallSite::Free { address_position: 1 })
        );
        assert_eq!(sites.len(), 1);
        assert!(sites.deregister("release").is_some());
        assert!(sites.is_empty());
    }

    #[test]
    fn lifecycle_through_call_sites() {
        let checker = custom_checker();
        let sites = CallSiteTable::new();
        sites.register_allocation("pool_get", Some(2));
        sites.register_reallocation("pool_resize", Some(2), Some(3));
        sites.register_free("pool_put", Some(2));

        let Invoked::Allocated(a) = sites.invoke(&checker, "pool_get", &[1, 32], |_| 0x8000).unwrap()
        else {
            panic!("expected an allocation");
        };
        assert_eq!(checker.get(a), Some(32));

        let Invoked::Reallocated(moved) = sites
            .invoke(&checker, "pool_resize", &[1, a, 64], |_| 0x9000)
            .unwrap()
        else {
            panic!("expected a reallocation");
        };
        assert!(moved.is_known_address);
        assert_eq!(checker.get(0x9000), Some(64));
        assert_eq!(checker.get(a), None);

        let called = Mutex::new(None);
        let freed = sites
            .invoke(&checker, "pool_put", &[1, 0x9000], |args| {
                *called.lock() = Some(args.to_vec());
                0
            })
            .unwrap();
        assert_eq!(
            freed,
            Invoked::Freed(FreeOutcome {
                is_known_address: true,
                size: Some(64)
            })
        );
        assert_eq!(*called.lock(), Some(vec![1, 0x9000]));
        assert_eq!(checker.allocation_count(), 0);
    }

    #[test]
    fn double_free_through_call_site_is_reported() {
        let checker = custom_checker();
        let illegal = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&illegal);
        checker.register_listener(Arc::new(move |event: &MemoryEvent| {
            if let MemoryEvent::IllegalAccess(access) = event {
                sink.lock().push(access.kind);
            }
        }));
        let sites = CallSiteTable::new();
        sites.register_allocation("get", None);
        sites.register_free("put", None);

        sites.invoke(&checker, "get", &[16], |_| 0x8000).unwrap();
        sites.invoke(&checker, "put", &[0x8000], |_| 0).unwrap();
        sites.invoke(&checker, "put", &[0x8000], |_| 0).unwrap();
        assert_eq!(*illegal.lock(), [IllegalAccessKind::FreeOfUnknownAddress]);
    }

    #[test]
    fn failed_original_allocation() {
        let checker = custom_checker();
        let sites = CallSiteTable::new();
        sites.register_allocation("get", None);
        let err = sites.invoke(&checker, "get", &[16], |_| 0).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { size: 16 }));
        assert_eq!(checker.allocation_count(), 0);
    }

    #[test]
    fn invoke_errors() {
        let checker = custom_checker();
        let sites = CallSiteTable::new();
        sites.register_reallocation("resize", None, Some(4));

        let err = sites.invoke(&checker, "nope", &[], |_| 0).unwrap_err();
        assert!(matches!(err, Error::UnknownCallSite(name) if name == "nope"));

        let err = sites.invoke(&checker, "resize", &[0x8000, 8], |_| 0).unwrap_err();
        assert!(matches!(err, Error::MissingArgument { position: 4, .. }));

        let plain = ValidityChecker::new(Config::default(), SimulatedMemory::new()).unwrap();
        let err = sites.invoke(&plain, "resize", &[0x8000, 8, 0, 0], |_| 0).unwrap_err();
        assert!(matches!(err, Error::CustomManagementDisabled));
    }

    #[test]
    fn position_zero_is_missing() {
        let checker = custom_checker();
        let sites = CallSiteTable::new();
        sites.register_free("put", Some(0));
        let err = sites.invoke(&checker, "put", &[0x8000], |_| 0).unwrap_err();
        assert!(matches!(err, Error::MissingArgument { position: 0, .. }));
    }
}
