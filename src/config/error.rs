//! Error types for configuration parsing and validation.

use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceBuildError;

/// Error type for configuration operations.
///
/// Configuration errors are fatal at startup; the process exits with
/// status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the YAML configuration.
    #[error("Failed to parse YAML config: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Failed to write a configuration file (for the init command).
    #[error("Failed to write config file '{}': {source}", path.display())]
    FileWrite {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An address could not be parsed.
    #[error("Invalid bind address '{address}' for the {server} server")]
    InvalidBindAddress {
        /// The offending address string.
        address: String,
        /// Which server section it belongs to.
        server: &'static str,
    },

    /// An invalid value for a plain option.
    #[error("Invalid value for {option}: {reason}")]
    InvalidOption {
        /// Name of the option.
        option: &'static str,
        /// Reason the value is invalid.
        reason: String,
    },

    /// Both logging options are set at once.
    #[error("Only one of logging_config_file and logging_level can be used")]
    ConflictingLoggingOptions,

    /// A data source or request handler could not be built.
    #[error(transparent)]
    Build(#[from] SourceBuildError),
}
