//! C entry points over the process checker in [`crate::global`].
//!
//! Until `memward_init` succeeds (and after `memward_teardown`), the
//! allocation functions fall straight through to libc. Memory allocated
//! during that window is unknown to the checker, so freeing it later is
//! reported like any other unknown free.

use std::{
    ffi::CStr,
    fs::File,
    io::{self, BufWriter},
    ptr,
};

use libc::{c_char, c_int, c_void, size_t};

use crate::{dump::DumpFormat, error::Error, global, raw::c};

pub const MEMWARD_OK: c_int = 0;
pub const MEMWARD_ERR_ALREADY_INITIALIZED: c_int = 1;
pub const MEMWARD_ERR_CONFIG: c_int = -1;
pub const MEMWARD_ERR_NOT_INITIALIZED: c_int = -2;
pub const MEMWARD_ERR_IO: c_int = -3;

/// Set up logging and install the process checker, configured from the
/// `MEMWARD_*` environment variables.
#[no_mangle]
pub extern "C" fn memward_init() -> c_int {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();
    match global::init_from_env() {
        Ok(_) => MEMWARD_OK,
        Err(Error::AlreadyInitialized) => MEMWARD_ERR_ALREADY_INITIALIZED,
        Err(err) => {
            log::error!("memward_init: {err}");
            MEMWARD_ERR_CONFIG
        }
    }
}

#[no_mangle]
pub extern "C" fn memward_malloc(size: size_t) -> *mut c_void {
    let Some(checker) = global::instance() else {
        // SAFETY: `malloc()` has no preconditions
        return unsafe { c::malloc(size) };
    };
    match checker.on_allocate(size as u64) {
        Ok(address) => address as *mut c_void,
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
///
/// `data` must be null or come from `memward_malloc`/`memward_realloc` (or
/// plain `malloc()`), and not have been freed. Breaking that rule is exactly
/// what we report, but the free still happens.
#[no_mangle]
pub unsafe extern "C" fn memward_free(data: *mut c_void) {
    if data.is_null() {
        return;
    }
    match global::instance() {
        Some(checker) => {
            // SAFETY: passed on to caller
            unsafe { checker.on_free(data as u64) };
        }
        // SAFETY: passed on to caller
        None => unsafe { c::free(data) },
    }
}

/// # Safety
///
/// Same as [`memward_free`] for `data`.
#[no_mangle]
pub unsafe extern "C" fn memward_realloc(data: *mut c_void, size: size_t) -> *mut c_void {
    if data.is_null() {
        return memward_malloc(size);
    }
    if size == 0 {
        // SAFETY: passed on to caller
        unsafe { memward_free(data) };
        return ptr::null_mut();
    }
    let Some(checker) = global::instance() else {
        // SAFETY: passed on to caller
        return unsafe { c::realloc(data, size) };
    };
    // SAFETY: passed on to caller
    match unsafe { checker.on_reallocate(data as u64, size as u64) } {
        Ok(outcome) => outcome.new_address as *mut c_void,
        Err(_) => ptr::null_mut(),
    }
}

/// Dump live allocations to `path`, or to stderr if `path` is null. `json`
/// non-zero selects JSON output.
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memward_dump(path: *const c_char, json: c_int) -> c_int {
    let Some(checker) = global::instance() else {
        return MEMWARD_ERR_NOT_INITIALIZED;
    };
    let format = if json != 0 {
        DumpFormat::Json
    } else {
        DumpFormat::Text
    };
    let result = if path.is_null() {
        checker.dump(io::stderr().lock(), format)
    } else {
        // SAFETY: caller asserts `path` is a valid C string
        let path = unsafe { CStr::from_ptr(path) };
        match path.to_str() {
            Ok(path) => File::create(path).and_then(|file| checker.dump(BufWriter::new(file), format)),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
        }
    };
    match result {
        Ok(()) => MEMWARD_OK,
        Err(err) => {
            log::error!("memward_dump: {err}");
            MEMWARD_ERR_IO
        }
    }
}

/// Returns the number of allocations still live at teardown, or
/// `MEMWARD_ERR_NOT_INITIALIZED`
#[no_mangle]
pub extern "C" fn memward_teardown() -> c_int {
    match global::teardown() {
        Some(checker) => c_int::try_from(checker.allocation_count()).unwrap_or(c_int::MAX),
        None => MEMWARD_ERR_NOT_INITIALIZED,
    }
}
