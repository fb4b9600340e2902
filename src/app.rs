//! Application startup utilities.
//!
//! This module contains exit codes, tracing setup, and error hints that
//! support the main entry point.

use vinegar::config::{ConfigError, LoggingConfig};

use tracing_subscriber::EnvFilter;

/// Application exit codes.
pub mod exit_code {
    use std::process::ExitCode;

    /// Clean shutdown (exit code 0).
    pub const SUCCESS: ExitCode = ExitCode::SUCCESS;

    /// Configuration error (exit code 1).
    pub const CONFIG_ERROR: ExitCode = ExitCode::FAILURE;

    /// I/O error during startup, e.g. a socket that cannot be bound
    /// (exit code 2).
    ///
    /// A function rather than a constant because `ExitCode::from` is not
    /// `const fn`.
    pub fn startup_io_error() -> ExitCode {
        ExitCode::from(2)
    }

    /// Runtime fatal (exit code 3).
    pub fn runtime_error() -> ExitCode {
        ExitCode::from(3)
    }
}

/// Prints helpful hints for common configuration errors.
pub fn print_config_hint(error: &ConfigError) {
    if matches!(error, ConfigError::FileRead { .. }) {
        eprintln!("\nRun 'vinegar init' to generate a configuration template.");
    }
}

/// Sets up the tracing subscriber for logging.
///
/// `verbose` forces debug level regardless of the configured one. The
/// `RUST_LOG` environment variable still takes precedence over both.
pub fn setup_tracing(logging: &LoggingConfig, verbose: bool) {
    let default_directive = if verbose {
        "debug".to_string()
    } else {
        match logging {
            LoggingConfig::Level(level) => level.clone(),
            LoggingConfig::DirectivesFile(path) => {
                // Directives are one per line; blank lines and #-comments
                // are skipped.
                std::fs::read_to_string(path)
                    .map(|text| {
                        text.lines()
                            .map(str::trim)
                            .filter(|line| !line.is_empty() && !line.starts_with('#'))
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_else(|err| {
                        eprintln!(
                            "Cannot read logging config file {}: {err}; using level info",
                            path.display()
                        );
                        "info".to_string()
                    })
            }
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .parse_lossy(
            std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or(default_directive),
        );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
