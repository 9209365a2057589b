use alloc_probe::{check, compare, CheckOptions, ProbeLibrary, ProbeReport, REPORT_PREFIX};
use anyhow::bail;
use args::Args;
use getopts::Occur;
use glob::glob;

const PROGRAM_DESC: &str = "Check which module services malloc/free";
const PROGRAM_NAME: &str = "ap_check";

#[derive(Debug, PartialEq)]
enum Mode {
    Compare(String),
    Probe(String),
}

fn select_mode(lib: Option<String>, dir: Option<String>) -> Result<Mode, anyhow::Error> {
    match (lib, dir) {
        (_, Some(dir)) => Ok(Mode::Compare(dir)),
        (Some(lib), None) => Ok(Mode::Probe(lib)),
        (None, None) => bail!("either --lib or --dir is required"),
    }
}

fn compare_dir(dir: &str) -> Result<(), anyhow::Error> {
    let wildcard = format!("{}/{}.*", dir, REPORT_PREFIX);

    let mut reports = vec![];
    for path in glob(wildcard.as_str())? {
        let path = path?;
        eprintln!("found report in {}", path.display());
        reports.push(ProbeReport::load(&path)?);
    }

    let owner = compare(&reports)?;
    eprintln!(
        "{} reports agree: `malloc` from {}",
        reports.len(),
        owner.display()
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "l",
        "lib",
        "Probe library to load (required unless --dir is given)",
        "PATH",
        Occur::Optional,
        None,
    );
    args.option(
        "e",
        "expect",
        "File name the module providing malloc must end with",
        "NAME",
        Occur::Optional,
        None,
    );
    args.option(
        "s",
        "size",
        "Bytes to allocate, write and free through the probe",
        "N",
        Occur::Optional,
        Some("64".to_string()),
    );
    args.option(
        "o",
        "out",
        "Directory to store the report in",
        "DIR",
        Occur::Optional,
        None,
    );
    args.option(
        "d",
        "dir",
        "Compare the reports stored in DIR instead of probing",
        "DIR",
        Occur::Optional,
        None,
    );

    args.parse_from_cli()?;

    let lib = match select_mode(
        args.optional_value_of("lib")?,
        args.optional_value_of("dir")?,
    )? {
        Mode::Compare(dir) => return compare_dir(&dir),
        Mode::Probe(lib) => lib,
    };

    let opts = CheckOptions {
        size: args.value_of("size")?,
        expect: args.optional_value_of("expect")?,
    };

    let library = ProbeLibrary::open(&lib)?;
    eprintln!("loaded probe library {}", library.path().display());
    let report = check::run(&library, &opts)?;

    eprintln!("{}", report);

    if let Some(out) = args.optional_value_of::<String>("out")? {
        let file = report.store(&out)?;
        eprintln!("stored report in {}", file.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lib_is_required_without_dir() {
        let err = select_mode(None, None).unwrap_err();
        assert!(err.to_string().contains("--lib"));
    }

    #[test]
    fn dir_selects_comparison() {
        assert_eq!(
            select_mode(None, Some("reports".to_string())).unwrap(),
            Mode::Compare("reports".to_string())
        );
        assert_eq!(
            select_mode(Some("libx.so".to_string()), Some("reports".to_string())).unwrap(),
            Mode::Compare("reports".to_string())
        );
    }

    #[test]
    fn lib_selects_probe() {
        assert_eq!(
            select_mode(Some("liballoc_probe_dep.so".to_string()), None).unwrap(),
            Mode::Probe("liballoc_probe_dep.so".to_string())
        );
    }
}
