//! Configuration layer for the Vinegar server.
//!
//! This module provides:
//! - CLI argument parsing ([`Cli`], [`Command`])
//! - YAML configuration file parsing ([`ServerFileConfig`])
//! - Validated configuration ([`ValidatedConfig`])
//! - Configuration file generation ([`write_default_config`])
//!
//! The configuration file is a single YAML document. Its top-level keys are
//! `data_sources` (ordered list of source configurations, each carrying a
//! `name` selecting the implementation), `data_sources_merge_lists`, `http`
//! and `tftp` (each with a `bind_address`, `bind_port`, and an ordered
//! `request_handlers` list), and `logging_level` or `logging_config_file`.
//!
//! Everything is validated up front; a server that starts does not fail on
//! configuration later.

mod cli;
mod error;
mod file;
mod validated;

#[cfg(test)]
#[path = "validated_tests.rs"]
mod validated_tests;

pub use cli::{Cli, Command};
pub use error::ConfigError;
pub use file::{
    default_config_template, HandlerConfig, ServerFileConfig, SourceConfig,
};
pub use validated::{LoggingConfig, ValidatedConfig, write_default_config};
