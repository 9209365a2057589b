//! Companion crate to [`alloc_probe`].  This crate compiles into a dynamic library that the
//! `ap_check` tool (or any other harness) loads to find out which module services `malloc`
//! from the point of view of a separately loaded library.
//!
//! Built with the `atfork_fallback` feature for Android, it also carries the no-op
//! `pthread_atfork` from [`alloc_probe::atfork`].

use alloc_probe::probe;
use libc::{c_char, c_void};

/// Path of the module that owns the `malloc` this library is bound to.  The string belongs
/// to the dynamic loader.  Aborts if the loader cannot place `malloc`.
#[no_mangle]
pub extern "C" fn dep_lookup_malloc_address() -> *const c_char {
    probe::malloc_owner_ptr()
}

/// `malloc(size)`, nothing more.
///
/// # Safety
///
/// Release the result with [`dep_free`] or any compatible `free`, once.
#[no_mangle]
pub unsafe extern "C" fn dep_malloc(size: libc::size_t) -> *mut c_void {
    probe::probe_malloc(size)
}

/// `free(ptr)`, nothing more.
///
/// # Safety
///
/// `ptr` must be null or a live allocation from the process allocator.
#[no_mangle]
pub unsafe extern "C" fn dep_free(ptr: *mut c_void) {
    probe::probe_free(ptr)
}

#[cfg(all(feature = "atfork_fallback", target_os = "android"))]
pub use alloc_probe::atfork::pthread_atfork;
