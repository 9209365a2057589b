//! Which loaded module owns `malloc`, plus passthrough `malloc`/`free`.
//!
//! Nothing here keeps state between calls; the loader strings returned by
//! [`owning_module`] and [`malloc_owner_ptr`] belong to the dynamic loader.

use std::{
    ffi::{CStr, OsStr},
    mem,
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    process,
};

use byteorder::{ByteOrder, LittleEndian};
use libc::{c_char, c_void, dlsym, RTLD_DEFAULT};
use once_cell::sync::Lazy;

type MallocFunc = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;

// Address bound to the name `malloc` in global lookup scope, 0 if unbound.
static GLOBAL_MALLOC: Lazy<usize> =
    Lazy::new(|| unsafe { dlsym(RTLD_DEFAULT, b"malloc\0".as_ptr() as *const c_char) as usize });

fn linked_malloc() -> *const c_void {
    let malloc: MallocFunc = libc::malloc;
    malloc as *const c_void
}

/// Path of the loaded module that contains `addr`, as reported by `dladdr`.
///
/// # Safety
///
/// The string is owned by the dynamic loader and stays valid only while that module
/// remains loaded.  Copy it before anything may `dlclose` the module.
pub unsafe fn owning_module(addr: *const c_void) -> Option<&'static CStr> {
    let mut info: libc::Dl_info = mem::zeroed();
    if libc::dladdr(addr, &mut info) == 0 || info.dli_fname.is_null() {
        return None;
    }
    Some(CStr::from_ptr(info.dli_fname))
}

/// Path of the module that provides the `malloc` this code is linked against.
///
/// Aborts the process if the loader cannot place the address: the probe only exists
/// to assert this, so there is nothing sensible to return.
pub fn malloc_owner_ptr() -> *const c_char {
    match unsafe { owning_module(linked_malloc()) } {
        Some(path) => path.as_ptr(),
        None => {
            eprintln!("failed finding `malloc`");
            process::abort();
        }
    }
}

/// Owned copy of [`malloc_owner_ptr`].
pub fn malloc_owner() -> PathBuf {
    let path = unsafe { CStr::from_ptr(malloc_owner_ptr()) };
    PathBuf::from(OsStr::from_bytes(path.to_bytes()))
}

/// Owner of whatever `malloc` resolves to by name in global scope.  With an
/// interposing allocator preloaded this is the interposer.
pub fn global_malloc_owner() -> Option<PathBuf> {
    if *GLOBAL_MALLOC == 0 {
        return None;
    }
    unsafe { owning_module(*GLOBAL_MALLOC as *const c_void) }
        .map(|path| PathBuf::from(OsStr::from_bytes(path.to_bytes())))
}

/// Symbol name at the linked `malloc` address, e.g. `malloc` or `_rjem_malloc`.
pub fn malloc_symbol() -> Option<String> {
    let mut name = None;
    backtrace::resolve(linked_malloc() as *mut c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

/// Allocate through the process's standard `malloc`.  Null on failure.
///
/// # Safety
///
/// The result must be released with [`probe_free`] (or a compatible `free`) exactly once.
pub unsafe fn probe_malloc(size: libc::size_t) -> *mut c_void {
    libc::malloc(size)
}

/// Release through the process's standard `free`.  Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live allocation from the process allocator.
pub unsafe fn probe_free(ptr: *mut c_void) {
    libc::free(ptr)
}

/// Fill `buf` with a pattern derived from `seed`: little-endian u64 words counting up
/// from `seed`, tail bytes set to the low byte of `seed`.
pub fn fill_pattern(buf: &mut [u8], seed: u64) {
    let mut words = buf.chunks_exact_mut(8);
    for (i, word) in (&mut words).enumerate() {
        LittleEndian::write_u64(word, seed.wrapping_add(i as u64));
    }
    for byte in words.into_remainder() {
        *byte = seed as u8;
    }
}

/// Whether `buf` still holds the pattern written by [`fill_pattern`].
pub fn check_pattern(buf: &[u8], seed: u64) -> bool {
    let words = buf.chunks_exact(8);
    let tail = words.remainder();
    words
        .enumerate()
        .all(|(i, word)| LittleEndian::read_u64(word) == seed.wrapping_add(i as u64))
        && tail.iter().all(|byte| *byte == seed as u8)
}
