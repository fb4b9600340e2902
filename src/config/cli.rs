//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default location of the server configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/vinegar/vinegar-server.yaml";

/// Vinegar: a PXE/network-boot server rendering per-system installation
/// artifacts.
#[derive(Debug, Parser)]
#[command(name = "vinegar", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Enable debug logging (overrides the configured level).
    #[arg(short, long)]
    pub verbose: bool,

    /// Optional subcommand.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a commented configuration template.
    Init {
        /// Where to write the template.
        #[arg(default_value = "vinegar-server.yaml")]
        output: PathBuf,
    },
}

impl Cli {
    /// Parses the process arguments.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the configuration file path, falling back to the default.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}
