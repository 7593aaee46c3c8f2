use serde::Serialize;
use thiserror::Error;

use crate::serialize::serde_addr;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Something wrong with a [`crate::config::Config`]. Only ever raised while
/// building the configuration, never from a memory operation.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`safe_memory_access` and `custom_memory_management` cannot both be enabled")]
    ExclusiveModes,
    #[error("`max_caller_info_depth` must be at least 1")]
    ZeroCallerDepth,
    #[error("ledger load factor must be in (0, 1), got {0}")]
    InvalidLoadFactor(f64),
    #[error("ledger initial capacity must be at most {max}, got {0}", max = crate::ledger::MAX_INITIAL_CAPACITY)]
    InitialCapacityTooLarge(usize),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The underlying allocator said no. We pass this on as-is.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure { size: u64 },
    #[error("reallocation of {address:#x} to {size} bytes failed")]
    ReallocationFailure { address: u64, size: u64 },
    #[error("memward is already initialized")]
    AlreadyInitialized,
    #[error("memward is not initialized")]
    NotInitialized,
    #[error("`custom_memory_management` is not enabled")]
    CustomManagementDisabled,
    #[error("no call site registered as {0:?}")]
    UnknownCallSite(String),
    #[error("call site {call_site:?} has no argument at position {position}")]
    MissingArgument { call_site: String, position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IllegalAccessKind {
    FreeOfUnknownAddress,
    ReallocationOfUnknownAddress,
    AccessToUnknownAddress,
}

/// An operation against an address we are not tracking. This is a
/// *detection*: it is handed to listeners and logged, and the operation
/// carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[error("{kind:?} at {address:#x} ({size} bytes)")]
pub struct IllegalMemoryAccess {
    pub kind: IllegalAccessKind,
    #[serde(with = "serde_addr")]
    pub address: u64,
    /// Bytes touched for an access, the requested size for a reallocation,
    /// `0` for a free
    pub size: u64,
}
