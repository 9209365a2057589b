//! Fork-notification registration for the allocator.
//!
//! Allocators such as jemalloc call `pthread_atfork` unconditionally to re-arm their
//! internal locks around `fork`.  Some old Android system libraries do not define it,
//! so linking fails there.  Rust has no stable weak linkage, so instead of a weak
//! symbol the fallback is selected at compile time: with the `atfork_fallback` feature
//! on an Android target, [`Platform`] is [`Fallback`] and this crate itself exports a
//! no-op `pthread_atfork`, so linking `alloc_probe` alongside the allocator is enough.
//! Everywhere else [`Platform`] forwards to the real one.
//!
//! Handlers passed to the fallback are never invoked.

use libc::c_int;

/// Callback registered to run around `fork`.
pub type ForkHandler = Option<unsafe extern "C" fn()>;

/// Registers fork handlers with the platform.
///
/// The provided body is the fallback: it accepts any handlers, never calls or
/// stores them, and reports success.
pub trait ForkRegistrar {
    /// # Safety
    ///
    /// Implementations may hand the pointers to the C runtime, which will call them
    /// around every subsequent `fork`.
    unsafe fn register(_prefork: ForkHandler, _parent: ForkHandler, _child: ForkHandler) -> c_int {
        0
    }
}

/// No-op registrar for targets whose libc lacks `pthread_atfork`.
pub struct Fallback;

impl ForkRegistrar for Fallback {}

/// Registrar backed by the system `pthread_atfork`.
pub struct Native;

impl ForkRegistrar for Native {
    unsafe fn register(prefork: ForkHandler, parent: ForkHandler, child: ForkHandler) -> c_int {
        libc::pthread_atfork(prefork, parent, child)
    }
}

#[cfg(all(feature = "atfork_fallback", target_os = "android"))]
pub type Platform = Fallback;

#[cfg(not(all(feature = "atfork_fallback", target_os = "android")))]
pub type Platform = Native;

// The allocator's build declares the handlers as byte pointers.
unsafe fn as_handler(ptr: *mut u8) -> ForkHandler {
    if ptr.is_null() {
        None
    } else {
        Some(std::mem::transmute::<*mut u8, unsafe extern "C" fn()>(ptr))
    }
}

/// C-ABI shaped fallback with the signature the allocator links against.
/// Always returns 0; the pointers are never dereferenced.
///
/// # Safety
///
/// Safe for any pointer values, including null.  Marked `unsafe` to match the
/// exported C entry point.
pub unsafe extern "C" fn fallback_pthread_atfork(
    prefork: *mut u8,
    postfork_parent: *mut u8,
    postfork_child: *mut u8,
) -> c_int {
    Fallback::register(
        as_handler(prefork),
        as_handler(postfork_parent),
        as_handler(postfork_child),
    )
}

/// Stand-in for the `pthread_atfork` missing from old Android system libraries.  Any
/// image linking this crate next to the allocator resolves the allocator's reference here.
///
/// # Safety
///
/// Accepts any pointer values.
#[cfg(all(feature = "atfork_fallback", target_os = "android"))]
#[no_mangle]
pub unsafe extern "C" fn pthread_atfork(
    prefork: *mut u8,
    postfork_parent: *mut u8,
    postfork_child: *mut u8,
) -> c_int {
    Platform::register(
        as_handler(prefork),
        as_handler(postfork_parent),
        as_handler(postfork_child),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null_mut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count() {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn fallback_accepts_null_handlers() {
        assert_eq!(
            unsafe { fallback_pthread_atfork(null_mut(), null_mut(), null_mut()) },
            0
        );
    }

    #[test]
    fn fallback_never_touches_pointers() {
        // Bogus addresses: any dereference or call would fault.
        let bogus = 0x10 as *mut u8;
        assert_eq!(unsafe { fallback_pthread_atfork(bogus, bogus, bogus) }, 0);
        assert_eq!(
            unsafe { fallback_pthread_atfork(null_mut(), bogus, null_mut()) },
            0
        );
    }

    #[test]
    fn fallback_does_not_invoke_handlers() {
        let before = CALLS.load(Ordering::SeqCst);
        let rc = unsafe { Fallback::register(Some(count), Some(count), Some(count)) };
        assert_eq!(rc, 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn native_accepts_empty_registration() {
        assert_eq!(unsafe { Native::register(None, None, None) }, 0);
    }

    #[test]
    fn platform_registration_succeeds() {
        assert_eq!(unsafe { Platform::register(None, None, None) }, 0);
    }

    #[cfg(all(feature = "atfork_fallback", target_os = "android"))]
    #[test]
    fn exported_symbol_is_noop() {
        let before = CALLS.load(Ordering::SeqCst);
        let handler = count as unsafe extern "C" fn() as *mut u8;
        assert_eq!(unsafe { pthread_atfork(handler, handler, handler) }, 0);
        assert_eq!(unsafe { pthread_atfork(null_mut(), null_mut(), null_mut()) }, 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), before);
    }
}
