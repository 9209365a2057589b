//! `alloc_probe` checks that a replacement allocator (jemalloc, say) is the one actually
//! servicing `malloc` and `free` in a process, rather than the system allocator.
//!
//! The companion [`lib_alloc_probe`] crate builds a small shared library exporting three
//! C functions:
//!
//! * `dep_lookup_malloc_address()`: path of the module that provides the `malloc` the
//!   library is bound to;
//! * `dep_malloc(size)` and `dep_free(ptr)`: plain passthroughs to `malloc`/`free`.
//!
//! The `ap_check` tool from this crate loads that library and verifies that both sides
//! see the same `malloc`, that memory allocated on one side can be freed on the other,
//! and optionally that the owner is the allocator you expect:
//!
//! ```bash
//! LD_PRELOAD=libjemalloc.so.2 ap_check --lib target/release/liballoc_probe_dep.so \
//!     --expect libjemalloc.so.2 --out reports
//! ```
//!
//! Reports stored with `--out` from several runs can be compared with
//! `ap_check --dir reports`.
//!
//! The crate also carries the `pthread_atfork` fallback for old Android targets, see
//! [`atfork`].

use std::{
    fmt,
    fmt::{Display, Formatter},
    fs,
    path::{Path, PathBuf},
    process,
};

use anyhow::{bail, Context};
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

pub mod atfork;
pub mod check;
pub mod dylib;
pub mod probe;

pub use check::{CheckOptions, InProcess, ProbeTarget};
pub use dylib::ProbeLibrary;

/// File name prefix of stored reports; the process id follows.
pub const REPORT_PREFIX: &str = "alloc_probe";

/// Result of a successful interposition check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub pid: u32,
    /// Module providing the linked `malloc`.
    pub owner: PathBuf,
    /// Module providing `malloc` by name in global scope.
    pub global_owner: Option<PathBuf>,
    pub symbol: Option<String>,
    /// Probe library the checks went through, `None` for in-process checks.
    pub library: Option<PathBuf>,
    /// Size of the written-and-freed allocation.
    pub size: usize,
    pub checks: Vec<String>,
}

impl Default for ProbeReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeReport {
    /// Report for the current process with the `malloc` lookups filled in.
    pub fn new() -> Self {
        ProbeReport {
            pid: process::id(),
            owner: probe::malloc_owner(),
            global_owner: probe::global_malloc_owner(),
            symbol: probe::malloc_symbol(),
            library: None,
            size: 0,
            checks: Vec::new(),
        }
    }

    pub fn pass<S: Into<String>>(&mut self, check: S) {
        self.checks.push(check.into());
    }

    /// Write the report as YAML to `<dir>/alloc_probe.<pid>`.
    pub fn store<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf, anyhow::Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report directory {}", dir.display()))?;
        let file = dir.join(format!("{}.{}", REPORT_PREFIX, self.pid));
        let yaml = serde_yaml::to_string(self)?;
        fs::write(&file, yaml)
            .with_context(|| format!("failed to write report {}", file.display()))?;
        Ok(file)
    }

    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self, anyhow::Error> {
        let file = file.as_ref();
        let bytes =
            fs::read(file).with_context(|| format!("failed to read report {}", file.display()))?;
        serde_yaml::from_slice(&bytes[..])
            .with_context(|| format!("malformed report {}", file.display()))
    }
}

impl Display for ProbeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "process {}: `malloc` from {}", self.pid, self.owner.display())?;
        if let Some(symbol) = &self.symbol {
            write!(f, " ({})", symbol)?;
        }
        if let Some(library) = &self.library {
            write!(f, "\n  probe library {}", library.display())?;
        }
        write!(
            f,
            "\n  probed {}B",
            self.size.to_formatted_string(&Locale::en)
        )?;
        for check in self.checks.iter() {
            write!(f, "\n  ok: {}", check)?;
        }
        Ok(())
    }
}

/// All reports must name the same `malloc` owner; returns it.
pub fn compare(reports: &[ProbeReport]) -> Result<PathBuf, anyhow::Error> {
    let first = match reports.first() {
        Some(first) => first,
        None => bail!("no reports to compare"),
    };
    for report in reports[1..].iter() {
        if report.owner != first.owner {
            bail!(
                "process {} got `malloc` from {} but process {} got it from {}",
                first.pid,
                first.owner.display(),
                report.pid,
                report.owner.display()
            );
        }
    }
    Ok(first.owner.clone())
}
