// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::tracer::Format;

#[derive(Parser, Debug)]
#[command(
    name = "trailfs",
    version,
    about = "Mounts a synthesized file system which generates a trace event for \
             each low-level file I/O operation executed on any file or directory \
             under its control, forwarding every operation to the shadow directory \
             that actually hosts the data."
)]
pub struct Cli {
    /// Top directory through which the shadow contents are exposed
    /// (must exist and be empty)
    #[arg(long, value_name = "DIR")]
    pub mount: PathBuf,

    /// Directory where the files and directories to trace actually reside
    #[arg(long, value_name = "DIR")]
    pub shadow: PathBuf,

    /// File to write trace events to; '-' writes to standard output.
    /// An extension of '.csv' or '.json' selects the record format.
    #[arg(long, value_name = "FILE", default_value = "-")]
    pub out: String,

    /// Format each trace event as a set of comma-separated values on one line
    #[arg(long, conflicts_with = "json")]
    pub csv: bool,

    /// Format each trace event as a JSON object on one line
    #[arg(long)]
    pub json: bool,

    /// Expose the shadow file system read-only
    #[arg(long)]
    pub ro: bool,
}

/// Validated run configuration consumed by the tracer and the file system.
#[derive(Debug, Clone)]
pub struct Config {
    pub mount: PathBuf,
    pub shadow: PathBuf,
    pub format: Format,
    pub destination: String,
    pub read_only: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config> {
        let mount = validate_mount_point(&cli.mount)?;
        let shadow = validate_shadow_dir(&cli.shadow)?;

        // The mount point must not live under the shadow directory
        if mount.starts_with(&shadow) {
            bail!(
                "mount point ({}) cannot be under shadow directory ({})",
                mount.display(),
                shadow.display()
            );
        }

        Ok(Config {
            mount,
            shadow,
            format: select_format(&cli.out, cli.csv, cli.json),
            destination: cli.out,
            read_only: cli.ro,
        })
    }
}

fn validate_mount_point(path: &Path) -> Result<PathBuf> {
    let abspath = fs::canonicalize(path)
        .with_context(|| format!("'{}' is not a valid mount point", path.display()))?;
    ensure_is_dir(&abspath)?;
    ensure_dir_empty(&abspath)?;
    Ok(abspath)
}

fn validate_shadow_dir(path: &Path) -> Result<PathBuf> {
    let abspath = fs::canonicalize(path)
        .with_context(|| format!("'{}' is not a valid directory", path.display()))?;
    ensure_is_dir(&abspath)?;
    Ok(abspath)
}

fn ensure_is_dir(abspath: &Path) -> Result<()> {
    let info = fs::metadata(abspath)
        .with_context(|| format!("directory '{}' does not exist", abspath.display()))?;
    if !info.is_dir() {
        bail!("'{}' is not a directory", abspath.display());
    }
    Ok(())
}

fn ensure_dir_empty(abspath: &Path) -> Result<()> {
    let mut entries = fs::read_dir(abspath)
        .with_context(|| format!("could not open directory '{}'", abspath.display()))?;
    if entries.next().is_some() {
        bail!("'{}' is not empty", abspath.display());
    }
    Ok(())
}

/// Selects the trace format: explicit flags win, otherwise the output file
/// extension decides, defaulting to CSV.
fn select_format(out: &str, csv: bool, json: bool) -> Format {
    if json {
        return Format::Json;
    }
    if csv {
        return Format::Csv;
    }
    match Path::new(out)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("json") => Format::Json,
        _ => Format::Csv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(mount: &Path, shadow: &Path) -> Cli {
        Cli {
            mount: mount.to_path_buf(),
            shadow: shadow.to_path_buf(),
            out: "-".to_string(),
            csv: false,
            json: false,
            ro: false,
        }
    }

    #[test]
    fn format_inferred_from_extension() {
        assert_eq!(select_format("trace.json", false, false), Format::Json);
        assert_eq!(select_format("trace.JSON", false, false), Format::Json);
        assert_eq!(select_format("trace.csv", false, false), Format::Csv);
        assert_eq!(select_format("trace.txt", false, false), Format::Csv);
        assert_eq!(select_format("-", false, false), Format::Csv);
    }

    #[test]
    fn explicit_flags_override_extension() {
        assert_eq!(select_format("trace.json", true, false), Format::Csv);
        assert_eq!(select_format("trace.csv", false, true), Format::Json);
    }

    #[test]
    fn valid_directories_are_accepted() {
        let mount = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::write(shadow.path().join("data.txt"), b"x").unwrap();
        let conf = Config::from_cli(cli(mount.path(), shadow.path())).unwrap();
        assert!(conf.mount.is_absolute());
        assert!(conf.shadow.is_absolute());
        assert_eq!(conf.format, Format::Csv);
        assert!(!conf.read_only);
    }

    #[test]
    fn mount_point_must_exist() {
        let shadow = tempfile::tempdir().unwrap();
        let err = Config::from_cli(cli(Path::new("/no/such/mount"), shadow.path()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("not a valid mount point"), "got: {err}");
    }

    #[test]
    fn mount_point_must_be_empty() {
        let mount = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join("occupied"), b"x").unwrap();
        let err = Config::from_cli(cli(mount.path(), shadow.path()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("not empty"), "got: {err}");
    }

    #[test]
    fn mount_point_must_be_a_directory() {
        let shadow = tempfile::tempdir().unwrap();
        let file = shadow.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(Config::from_cli(cli(&file, shadow.path())).is_err());
    }

    #[test]
    fn shadow_must_exist() {
        let mount = tempfile::tempdir().unwrap();
        let err = Config::from_cli(cli(mount.path(), Path::new("/no/such/shadow")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("not a valid directory"), "got: {err}");
    }

    #[test]
    fn mount_under_shadow_is_rejected() {
        let shadow = tempfile::tempdir().unwrap();
        let mount = shadow.path().join("inner");
        std::fs::create_dir(&mount).unwrap();
        let err = Config::from_cli(cli(&mount, shadow.path()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("cannot be under"), "got: {err}");
    }

    #[test]
    fn sibling_directories_are_fine() {
        let base = tempfile::tempdir().unwrap();
        let mount = base.path().join("mnt");
        let shadow = base.path().join("data");
        std::fs::create_dir(&mount).unwrap();
        std::fs::create_dir(&shadow).unwrap();
        assert!(Config::from_cli(cli(&mount, &shadow)).is_ok());
    }

    #[test]
    fn read_only_flag_is_carried() {
        let mount = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let mut c = cli(mount.path(), shadow.path());
        c.ro = true;
        c.json = true;
        let conf = Config::from_cli(c).unwrap();
        assert!(conf.read_only);
        assert_eq!(conf.format, Format::Json);
    }

    #[test]
    fn cli_parses_mandatory_flags() {
        use clap::Parser;
        let cli = Cli::try_parse_from([
            "trailfs",
            "--mount=/tmp/m",
            "--shadow=/tmp/s",
            "--out=trace.json",
            "--ro",
        ])
        .unwrap();
        assert_eq!(cli.mount, PathBuf::from("/tmp/m"));
        assert_eq!(cli.shadow, PathBuf::from("/tmp/s"));
        assert_eq!(cli.out, "trace.json");
        assert!(cli.ro);
        assert!(Cli::try_parse_from(["trailfs", "--mount=/tmp/m"]).is_err());
        assert!(Cli::try_parse_from([
            "trailfs", "--mount=/m", "--shadow=/s", "--csv", "--json"
        ])
        .is_err());
    }
}
