//! The process-wide checker behind the C entry points.
//!
//! Lifecycle is explicit: [`init`] once at startup, [`teardown`] (optionally)
//! at shutdown. In between, [`instance`] hands out a reference-counted handle,
//! so a teardown racing an in-flight operation just lets that operation
//! finish against the old checker.
//!
//! Rust callers that do not need a process singleton should construct a
//! [`ValidityChecker`] directly and pass it around instead.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::{
    checker::ValidityChecker,
    config::Config,
    error::{Error, Result},
    raw::LibcMemory,
};

pub type GlobalChecker = ValidityChecker<LibcMemory>;

static INSTANCE: Lazy<RwLock<Option<Arc<GlobalChecker>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process checker. Fails if one is already installed, or if
/// `config` does not validate.
pub fn init(config: Config) -> Result<Arc<GlobalChecker>> {
    let mut instance = INSTANCE.write();
    if instance.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let checker = Arc::new(ValidityChecker::new(config, LibcMemory)?);
    *instance = Some(Arc::clone(&checker));
    log::info!("memward initialized");
    Ok(checker)
}

/// [`init`] with [`Config::from_env`]
pub fn init_from_env() -> Result<Arc<GlobalChecker>> {
    init(Config::from_env()?)
}

pub fn instance() -> Option<Arc<GlobalChecker>> {
    INSTANCE.read().clone()
}

/// Like [`instance`], but not being initialized is an error
pub fn try_instance() -> Result<Arc<GlobalChecker>> {
    instance().ok_or(Error::NotInitialized)
}

pub fn is_initialized() -> bool {
    INSTANCE.read().is_some()
}

/// Uninstall the process checker and hand it back. Whatever was still live
/// stays allocated; it is just no longer tracked.
pub fn teardown() -> Option<Arc<GlobalChecker>> {
    let checker = INSTANCE.write().take()?;
    let live = checker.allocation_count();
    if live > 0 {
        log::warn!("memward torn down with {live} live allocation(s)");
    } else {
        log::info!("memward torn down");
    }
    Some(checker)
}
