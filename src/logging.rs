//! Tracing setup for applications embedding the engine.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to the host. This
//! module offers the default: a compact stdout layer plus an optional file layer.
//!
//! Environment:
//! - `RUST_LOG` filters events (defaults to `info`).
//! - `CITEGROUNDER_LOG_FILE` appends to the given path; `off` disables the file layer. When unset,
//!   logs go to `logs/citegrounder.log`.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_DIRECTIVE: &str = "info";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_NAME: &str = "citegrounder.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where the file layer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFile {
    /// No file layer.
    Off,
    /// Append to this file.
    Path(PathBuf),
    /// `logs/citegrounder.log` under the working directory.
    Default,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive such as `info` or `citegrounder=debug`.
    pub directive: String,
    /// File layer target.
    pub file: LogFile,
}

impl LogSettings {
    /// Read `RUST_LOG` and `CITEGROUNDER_LOG_FILE`.
    pub fn from_env() -> Self {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string());
        let file = std::env::var("CITEGROUNDER_LOG_FILE")
            .map(|value| LogFile::parse(&value))
            .unwrap_or(LogFile::Default);
        Self { directive, file }
    }
}

impl LogFile {
    fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("off") {
            Self::Off
        } else if value.is_empty() {
            Self::Default
        } else {
            Self::Path(PathBuf::from(value))
        }
    }
}

/// Install the default subscriber configured from the environment.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    init_tracing_with(&LogSettings::from_env())
}

/// Install a subscriber with explicit settings.
///
/// Returns `false` when a global subscriber was already installed, so repeated calls from
/// embedding applications and test binaries are harmless.
pub fn init_tracing_with(settings: &LogSettings) -> bool {
    let env_filter = EnvFilter::try_new(&settings.directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    if let Some(writer) = file_writer(&settings.file) {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact();

        registry.with(file_layer).try_init().is_ok()
    } else {
        registry.try_init().is_ok()
    }
}

/// Non-blocking writer for the file layer, or `None` when it is disabled or cannot be opened.
fn file_writer(target: &LogFile) -> Option<NonBlocking> {
    let appender = match target {
        LogFile::Off => return None,
        LogFile::Path(path) => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            }
        }
        LogFile::Default => {
            if let Err(err) = std::fs::create_dir_all(DEFAULT_LOG_DIR) {
                eprintln!("Failed to create logs directory: {err}");
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::never(
                DEFAULT_LOG_DIR,
                DEFAULT_LOG_NAME,
            ))
        }
    };
    let (writer, guard) = appender;
    // Only the first guard is kept alive; later writers belong to subscribers that failed to
    // install anyway.
    let _ = LOG_GUARD.set(guard);
    Some(writer)
}
