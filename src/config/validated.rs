//! Validated configuration derived from the CLI and the YAML file.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::http::HttpServerConfig;
use crate::tftp::TftpServerConfig;

use super::cli::Cli;
use super::error::ConfigError;
use super::file::{default_config_template, HandlerConfig, ServerFileConfig, SourceConfig};

/// How logging should be initialized.
#[derive(Debug, Clone)]
pub enum LoggingConfig {
    /// A plain level name for the default subscriber.
    Level(String),
    /// Filter directives read from a file, one per line.
    DirectivesFile(PathBuf),
}

/// Fully validated configuration ready for use by the server.
///
/// Plain values (addresses, ports, limits) are parsed here; the data
/// sources and request handlers stay in their declarative form and are
/// built during startup wiring, where the composite source they share is
/// available.
#[derive(Debug)]
pub struct ValidatedConfig {
    /// Ordered data source stack, still declarative.
    pub data_sources: Vec<SourceConfig>,
    /// Append-merge sequences when combining source contributions.
    pub data_sources_merge_lists: bool,
    /// HTTP server settings.
    pub http: HttpServerConfig,
    /// HTTP handler pipeline, still declarative.
    pub http_handlers: Vec<HandlerConfig>,
    /// TFTP server settings.
    pub tftp: TftpServerConfig,
    /// TFTP handler pipeline, still declarative.
    pub tftp_handlers: Vec<HandlerConfig>,
    /// Logging initialization.
    pub logging: LoggingConfig,
    /// Debug logging forced from the command line.
    pub verbose: bool,
}

impl fmt::Display for ValidatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config {{ sources: {}, http: {}:{} ({} handlers), tftp: {}:{} ({} handlers) }}",
            self.data_sources.len(),
            self.http.bind_address,
            self.http.bind_port,
            self.http_handlers.len(),
            self.tftp.bind_address,
            self.tftp.bind_port,
            self.tftp_handlers.len(),
        )
    }
}

impl ValidatedConfig {
    /// Loads and validates the configuration named by the CLI.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// any value fails validation.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let path = cli.config_file();
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            path: path.clone(),
            source,
        })?;
        let file: ServerFileConfig = serde_yaml::from_str(&text)?;
        Self::from_file_config(file, cli)
    }

    /// Validates an already-parsed file configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid values.
    pub fn from_file_config(file: ServerFileConfig, cli: &Cli) -> Result<Self, ConfigError> {
        let http_bind: IpAddr =
            file.http
                .bind_address
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddress {
                    address: file.http.bind_address.clone(),
                    server: "http",
                })?;
        let tftp_bind: IpAddr =
            file.tftp
                .bind_address
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddress {
                    address: file.tftp.bind_address.clone(),
                    server: "tftp",
                })?;
        if file.tftp.block_counter_wrap_value > 1 {
            return Err(ConfigError::InvalidOption {
                option: "tftp.block_counter_wrap_value",
                reason: "must be 0 or 1".to_string(),
            });
        }
        if file.tftp.default_timeout == 0 {
            return Err(ConfigError::InvalidOption {
                option: "tftp.default_timeout",
                reason: "must be greater than 0".to_string(),
            });
        }
        if file.http.max_request_body_size == 0 {
            return Err(ConfigError::InvalidOption {
                option: "http.max_request_body_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        for handler in &file.tftp.request_handlers {
            if matches!(handler, HandlerConfig::SqliteUpdate(_)) {
                return Err(ConfigError::InvalidOption {
                    option: "tftp.request_handlers",
                    reason: "the sqlite_update handler is HTTP-only".to_string(),
                });
            }
        }

        let logging = match (&file.logging_config_file, &file.logging_level) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingLoggingOptions),
            (Some(path), None) => LoggingConfig::DirectivesFile(path.clone()),
            (None, level) => {
                let level = level.as_deref().unwrap_or("info").to_lowercase();
                if !matches!(level.as_str(), "error" | "warn" | "info" | "debug" | "trace") {
                    return Err(ConfigError::InvalidOption {
                        option: "logging_level",
                        reason: format!(
                            "\"{level}\" is not one of error, warn, info, debug, trace"
                        ),
                    });
                }
                LoggingConfig::Level(level)
            }
        };

        Ok(Self {
            data_sources: file.data_sources,
            data_sources_merge_lists: file.data_sources_merge_lists,
            http: HttpServerConfig {
                bind_address: http_bind,
                bind_port: file.http.bind_port,
                max_request_body_size: file.http.max_request_body_size,
                ..HttpServerConfig::default()
            },
            http_handlers: file.http.request_handlers,
            tftp: TftpServerConfig {
                bind_address: tftp_bind,
                bind_port: file.tftp.bind_port,
                default_timeout: file.tftp.default_timeout,
                max_retries: file.tftp.max_retries,
                max_block_size: file
                    .tftp
                    .max_block_size
                    .clamp(
                        crate::tftp::protocol::DEFAULT_BLOCK_SIZE,
                        crate::tftp::protocol::MAX_BLOCK_SIZE,
                    ),
                block_counter_wrap_value: file.tftp.block_counter_wrap_value,
                ..TftpServerConfig::default()
            },
            tftp_handlers: file.tftp.request_handlers,
            logging,
            verbose: cli.verbose,
        })
    }
}

/// Writes the default configuration template to a file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(path, default_config_template()).map_err(|source| ConfigError::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}
