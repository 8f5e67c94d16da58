//! Command-line arguments and logging setup

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Rotated log files kept next to the active one
pub const LOG_FILES_KEPT: usize = 7;

/// Deduplicated, failover-aware file transfer client
#[derive(Parser, Debug)]
#[command(name = "ferry", author, version, about, long_about = None)]
pub struct Cli {
    /// Chain configuration file (TOML); watched for changes
    pub config_file: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log to this file (rotated daily) instead of stderr
    #[arg(short, long, env = "FERRY_LOG")]
    pub log: Option<PathBuf>,

    /// Port announcements are published on (0 picks a free port)
    #[arg(short, long, default_value_t = 0)]
    pub publish_port: u16,

    /// Do not reload when the configuration file changes
    #[arg(long)]
    pub no_watch: bool,
}

impl Cli {
    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Daily-rotated appender writing `<path>.<date>` files, pruned to
/// [`LOG_FILES_KEPT`].
pub fn log_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let prefix = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix.to_string_lossy())
        .max_log_files(LOG_FILES_KEPT)
        .build(directory)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the level
/// chosen by `--verbose`.
///
/// File logging goes through a background writer; keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_filter()));

    let (result, guard) = match &cli.log {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(log_appender(path)?);
            let result = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init();
            (result, Some(guard))
        }
        None => {
            let result = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            (result, None)
        }
    };
    result
        .map_err(|e| anyhow::anyhow!(e))
        .context("cannot install logger")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["ferry", "/etc/ferry.toml"]).unwrap();
        assert_eq!(cli.config_file, PathBuf::from("/etc/ferry.toml"));
        assert!(!cli.verbose);
        assert!(!cli.no_watch);
        assert_eq!(cli.publish_port, 0);
        assert_eq!(cli.default_filter(), "info");
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "ferry",
            "-v",
            "--log",
            "/var/log/ferry.log",
            "-p",
            "9010",
            "--no-watch",
            "ferry.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log, Some(PathBuf::from("/var/log/ferry.log")));
        assert_eq!(cli.publish_port, 9010);
        assert!(cli.no_watch);
        assert_eq!(cli.default_filter(), "debug");
    }

    #[test]
    fn test_log_appender_writes_dated_file() {
        use std::io::Write;

        let tmp = tempfile::TempDir::new().unwrap();
        let mut appender = log_appender(&tmp.path().join("ferry.log")).unwrap();
        appender.write_all(b"line\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("ferry.log."), "{:?}", names);
    }

    #[test]
    fn test_log_appender_rejects_directory_path() {
        assert!(log_appender(Path::new("/")).is_err());
    }

    #[test]
    fn test_config_file_required() {
        assert!(Cli::try_parse_from(["ferry"]).is_err());
    }
}
