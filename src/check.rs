//! End-to-end interposition check: the probe target and this process must agree on
//! which module services `malloc`, and memory must cross between them freely.

use std::{
    path::{Path, PathBuf},
    slice,
};

use anyhow::bail;
use libc::c_void;

use crate::{
    dylib::ProbeLibrary,
    probe::{self, check_pattern, fill_pattern},
    ProbeReport,
};

const PATTERN_SEED: u64 = 0xDECADE;
const CROSS_SIZE: usize = 10;

/// Something exposing the three probe entry points.
pub trait ProbeTarget {
    /// Library the entry points come from, if not this process.
    fn library(&self) -> Option<&Path>;
    fn lookup_malloc_address(&self) -> PathBuf;
    /// # Safety
    ///
    /// See [`probe::probe_malloc`].
    unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void;
    /// # Safety
    ///
    /// See [`probe::probe_free`].
    unsafe fn free(&self, ptr: *mut c_void);
}

impl ProbeTarget for ProbeLibrary {
    fn library(&self) -> Option<&Path> {
        Some(self.path())
    }

    fn lookup_malloc_address(&self) -> PathBuf {
        ProbeLibrary::lookup_malloc_address(self)
    }

    unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void {
        ProbeLibrary::malloc(self, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        ProbeLibrary::free(self, ptr)
    }
}

/// The probe functions of this crate, called directly.
pub struct InProcess;

impl ProbeTarget for InProcess {
    fn library(&self) -> Option<&Path> {
        None
    }

    fn lookup_malloc_address(&self) -> PathBuf {
        probe::malloc_owner()
    }

    unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void {
        probe::probe_malloc(size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        probe::probe_free(ptr)
    }
}

#[derive(Clone, Debug)]
pub struct CheckOptions {
    /// Bytes to allocate, write and free through the target.
    pub size: usize,
    /// Suffix the owning module's path must end with, e.g. `libjemalloc.so.2`.
    pub expect: Option<String>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            size: 64,
            expect: None,
        }
    }
}

// Pointers from either side must be releasable by the other.
unsafe fn cross_free<T: ProbeTarget>(target: &T) -> Result<(), anyhow::Error> {
    let ptr = probe::probe_malloc(CROSS_SIZE);
    if ptr.is_null() {
        bail!("local allocation of {} bytes failed", CROSS_SIZE);
    }
    target.free(ptr);

    let ptr = target.malloc(CROSS_SIZE);
    if ptr.is_null() {
        bail!("probe allocation of {} bytes failed", CROSS_SIZE);
    }
    probe::probe_free(ptr);
    Ok(())
}

// Returns whether the buffer was written, i.e. `false` for a null zero-size result.
unsafe fn exercise<T: ProbeTarget>(target: &T, size: usize) -> Result<bool, anyhow::Error> {
    let ptr = target.malloc(size);
    if ptr.is_null() {
        if size == 0 {
            return Ok(false);
        }
        bail!("probe allocation of {} bytes failed", size);
    }
    let buf = slice::from_raw_parts_mut(ptr as *mut u8, size);
    fill_pattern(buf, PATTERN_SEED);
    let intact = check_pattern(buf, PATTERN_SEED);
    target.free(ptr);
    if !intact {
        bail!("{} byte probe buffer was corrupted before free", size);
    }
    Ok(true)
}

/// Run every check against `target`, stopping at the first failure.
pub fn run<T: ProbeTarget>(target: &T, opts: &CheckOptions) -> Result<ProbeReport, anyhow::Error> {
    let mut report = ProbeReport::new();
    report.library = target.library().map(Path::to_path_buf);
    report.size = opts.size;

    unsafe { cross_free(target)? };
    report.pass("allocations are interchangeable across the module boundary");

    // In-process targets answer with `report.owner` itself.
    if target.library().is_some() {
        let there = target.lookup_malloc_address();
        if there != report.owner {
            bail!(
                "probe sees `malloc` in {} but this process sees it in {}",
                there.display(),
                report.owner.display()
            );
        }
        report.pass("probe and process agree on the `malloc` owner");
    }

    if let Some(global) = &report.global_owner {
        if *global != report.owner {
            bail!(
                "`malloc` is linked from {} but resolves by name to {}",
                report.owner.display(),
                global.display()
            );
        }
        report.pass("global symbol lookup agrees with the linked `malloc`");
    }

    if let Some(expect) = &opts.expect {
        if !report.owner.to_string_lossy().ends_with(expect.as_str()) {
            bail!(
                "`malloc` is provided by {}, expected {}",
                report.owner.display(),
                expect
            );
        }
        report.pass(format!("`malloc` is provided by {}", expect));
    }

    if unsafe { exercise(target, opts.size)? } {
        report.pass(format!("{} byte allocation written and freed", opts.size));
    } else {
        report.pass(format!("{} byte allocation returned null", opts.size));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_passes() {
        let report = run(&InProcess, &CheckOptions::default()).unwrap();
        assert_eq!(report.size, 64);
        assert!(report.library.is_none());
        assert_eq!(report.owner, probe::malloc_owner());
        assert!(report.checks.len() >= 2);
        assert!(!report.checks.iter().any(|c| c.contains("agree on")));
    }

    #[test]
    fn expected_owner() {
        let owner = probe::malloc_owner();
        let name = owner.file_name().unwrap().to_string_lossy().into_owned();
        let opts = CheckOptions {
            expect: Some(name.clone()),
            ..CheckOptions::default()
        };
        let report = run(&InProcess, &opts).unwrap();
        assert!(report.checks.iter().any(|c| c.contains(&name)));
    }

    #[test]
    fn unexpected_owner() {
        let opts = CheckOptions {
            expect: Some("libnot-an-allocator.so".to_string()),
            ..CheckOptions::default()
        };
        let err = run(&InProcess, &opts).unwrap_err();
        assert!(err.to_string().contains("libnot-an-allocator.so"));
    }

    #[test]
    fn zero_size() {
        let opts = CheckOptions {
            size: 0,
            expect: None,
        };
        let report = run(&InProcess, &opts).unwrap();
        let last = report.checks.last().unwrap().as_str();
        assert!(
            last == "0 byte allocation returned null"
                || last == "0 byte allocation written and freed",
            "{}",
            last
        );
    }

    struct NullOnZero;

    impl ProbeTarget for NullOnZero {
        fn library(&self) -> Option<&Path> {
            Some(Path::new("/tmp/libnullonzero.so"))
        }
        fn lookup_malloc_address(&self) -> PathBuf {
            probe::malloc_owner()
        }
        unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void {
            if size == 0 {
                std::ptr::null_mut()
            } else {
                probe::probe_malloc(size)
            }
        }
        unsafe fn free(&self, ptr: *mut c_void) {
            probe::probe_free(ptr)
        }
    }

    #[test]
    fn null_zero_size_is_recorded() {
        let opts = CheckOptions {
            size: 0,
            expect: None,
        };
        let report = run(&NullOnZero, &opts).unwrap();
        assert!(report.checks.iter().any(|c| c.contains("agree on")));
        assert_eq!(
            report.checks.last().map(String::as_str),
            Some("0 byte allocation returned null")
        );
        assert!(!report.checks.iter().any(|c| c.contains("written and freed")));
    }

    struct Elsewhere;

    impl ProbeTarget for Elsewhere {
        fn library(&self) -> Option<&Path> {
            Some(Path::new("/tmp/libelsewhere.so"))
        }
        fn lookup_malloc_address(&self) -> PathBuf {
            PathBuf::from("/opt/other/libmalloc.so")
        }
        unsafe fn malloc(&self, size: libc::size_t) -> *mut c_void {
            probe::probe_malloc(size)
        }
        unsafe fn free(&self, ptr: *mut c_void) {
            probe::probe_free(ptr)
        }
    }

    #[test]
    fn owner_mismatch() {
        let err = run(&Elsewhere, &CheckOptions::default()).unwrap_err();
        assert!(err.to_string().contains("/opt/other/libmalloc.so"));
    }
}
