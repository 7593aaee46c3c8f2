//! Live-allocation tracking and validation over raw, unchecked memory.
//!
//! A [`ValidityChecker`] sits between a caller and a [`RawMemory`] that will
//! happily free or read any address it is given. It keeps a ledger of what is
//! actually live, checks every free, reallocation and (optionally) access
//! against it, and reports what does not add up to registered listeners.
//!
//! ```
//! use memward::{Config, SimulatedMemory, ValidityChecker};
//!
//! let config = Config::builder().safe_memory_management(true).build().unwrap();
//! let checker = ValidityChecker::new(config, SimulatedMemory::new()).unwrap();
//!
//! let a = checker.on_allocate(100).unwrap();
//! assert_eq!(checker.get(a), Some(100));
//! assert!(unsafe { checker.on_free(a) }.is_known_address);
//! // Double free: detected, reported, not fatal
//! assert!(!unsafe { checker.on_free(a) }.is_known_address);
//! ```

pub mod caller;
pub mod callsite;
pub mod checker;
pub mod config;
pub mod dump;
pub mod error;
pub mod event;
pub mod externc;
pub mod global;
pub mod guard;
pub mod ledger;
pub mod raw;
pub mod serialize;
pub mod storage;
pub mod util;

pub use checker::{AccessOutcome, FreeOutcome, ReallocOutcome, ValidityChecker};
pub use config::Config;
pub use error::{ConfigError, Error, IllegalAccessKind, IllegalMemoryAccess, Result};
pub use event::{MemoryEvent, MemoryListener};
pub use raw::{LibcMemory, RawMemory, SimulatedMemory};
