//! Loading the `lib_alloc_probe` shared object and calling its entry points.

use std::{
    ffi::{CStr, CString, OsStr},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use libc::{c_char, c_void, RTLD_LOCAL, RTLD_NOW};

type LookupFunc = unsafe extern "C" fn() -> *const c_char;
type MallocFunc = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);

pub const LOOKUP_SYMBOL: &str = "dep_lookup_malloc_address";
pub const MALLOC_SYMBOL: &str = "dep_malloc";
pub const FREE_SYMBOL: &str = "dep_free";

/// A `dlopen`ed probe library.  Closed on drop.
pub struct ProbeLibrary {
    path: PathBuf,
    handle: *mut c_void,
    lookup: LookupFunc,
    malloc: MallocFunc,
    free: FreeFunc,
}

fn last_dlerror() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

unsafe fn symbol(handle: *mut c_void, name: &str) -> Result<*mut c_void, anyhow::Error> {
    let cname = CString::new(name)?;
    libc::dlerror();
    let sym = libc::dlsym(handle, cname.as_ptr());
    if sym.is_null() {
        bail!("symbol `{}` not found: {}", name, last_dlerror());
    }
    Ok(sym)
}

unsafe fn entry_points(
    handle: *mut c_void,
) -> Result<(*mut c_void, *mut c_void, *mut c_void), anyhow::Error> {
    Ok((
        symbol(handle, LOOKUP_SYMBOL)?,
        symbol(handle, MALLOC_SYMBOL)?,
        symbol(handle, FREE_SYMBOL)?,
    ))
}

impl ProbeLibrary {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("invalid library path {}", path.display()))?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), RTLD_NOW | RTLD_LOCAL) };
        if handle.is_null() {
            return Err(anyhow!(
                "failed to load {}: {}",
                path.display(),
                last_dlerror()
            ));
        }

        let (lookup, malloc, free) = match unsafe { entry_points(handle) } {
            Ok(syms) => syms,
            Err(e) => {
                unsafe { libc::dlclose(handle) };
                return Err(e.context(format!("{} is not a probe library", path.display())));
            }
        };

        Ok(ProbeLibrary {
            path: path.to_path_buf(),
            handle,
            lookup: unsafe { std::mem::transmute::<*mut c_void, LookupFunc>(lookup) },
            malloc: unsafe { std::mem::transmute::<*mut c_void, MallocFunc>(malloc) },
            free: unsafe { std::mem::transmute::<*mut c_void, FreeFunc>(free) },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module that owns `malloc` as seen from inside the probe library.
    pub fn lookup_malloc_address(&self) -> PathBuf {
        let path = unsafe { CStr::from_ptr((self.lookup)()) };
        PathBuf::from(OsStr::from_bytes(path.to_bytes()))
    }

    /// # Safety
    ///
    /// See [`crate::probe::probe_malloc`].
    pub unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void {
        (self.malloc)(size)
    }

    /// # Safety
    ///
    /// See [`crate::probe::probe_free`].
    pub unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

impl Drop for ProbeLibrary {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library() {
        let err = ProbeLibrary::open("/nonexistent/liballoc_probe_dep.so")
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to load"));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn library_without_probe_symbols() {
        let err = ProbeLibrary::open("libc.so.6").err().unwrap();
        let msg = format!("{:#}", err);
        assert!(msg.contains("is not a probe library"), "{}", msg);
        assert!(msg.contains(LOOKUP_SYMBOL), "{}", msg);
    }

    #[test]
    fn interior_nul_in_path() {
        assert!(ProbeLibrary::open("lib\0probe.so").is_err());
    }
}
