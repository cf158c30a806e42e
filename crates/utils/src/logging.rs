//! Logging setup for the fbuild driver
//!
//! Two layers are installed: a human-readable stderr layer whose level follows
//! the `-v` count (or `RUST_LOG` when set), and an uncolored debug-level file
//! layer that keeps a full record of the run inside the build root.

use fbuild_core::{Error, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// What the log output should look like
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Count of `-v` flags
    pub verbose: u8,
    /// Allow ANSI colors on stderr
    pub color: bool,
    /// Prefix events with the worker thread name and id
    pub show_threads: bool,
    /// Debug-level log file, created (with parents) if missing
    pub log_file: Option<PathBuf>,
}

impl LogSettings {
    /// Stderr level for the configured verbosity
    pub fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Initialize the tracing system.
///
/// Calling this a second time in the same process keeps the first subscriber
/// and returns `Ok`.
pub fn init(settings: &LogSettings) -> Result<()> {
    let stderr_filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| Error::configuration(format!("invalid RUST_LOG: {e}")))?,
        _ => EnvFilter::default().add_directive(settings.level().into()),
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(settings.color && is_tty())
        .with_target(false)
        .with_thread_names(settings.show_threads)
        .with_thread_ids(settings.show_threads)
        .with_level(true)
        .compact()
        .with_filter(stderr_filter);

    let file_layer = match &settings.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::file_system(parent, "create log directory", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::file_system(path, "open log file", e))?;
            Some(
                fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_thread_names(true)
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    if tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("a global subscriber is already installed; keeping it");
    }

    Ok(())
}

/// Check if we're running in a TTY environment
fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_verbosity_maps_to_levels() {
        let mut settings = LogSettings::default();
        assert_eq!(settings.level(), LevelFilter::INFO);
        settings.verbose = 1;
        assert_eq!(settings.level(), LevelFilter::DEBUG);
        settings.verbose = 5;
        assert_eq!(settings.level(), LevelFilter::TRACE);
    }

    #[test]
    fn test_init_creates_log_file_and_is_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("build").join("fbuild.log");
        let settings = LogSettings {
            log_file: Some(log_file.clone()),
            ..Default::default()
        };

        init(&settings).unwrap();
        init(&settings).unwrap();

        assert!(log_file.exists());
    }
}
