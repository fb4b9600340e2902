//! Serde view of the YAML configuration file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::handler::{FileHandlerConfig, SqliteUpdateConfig};
use crate::source::{SqliteConfig, TextFileConfig, YamlTargetConfig};

/// One entry of the `data_sources` list, selected by its `name` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SourceConfig {
    /// The text-file source.
    TextFile(TextFileConfig),
    /// The YAML targeting source.
    YamlTarget(YamlTargetConfig),
    /// The SQLite source.
    Sqlite(SqliteConfig),
}

/// One entry of a `request_handlers` list, selected by its `name` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// The file-serving handler.
    File(FileHandlerConfig),
    /// The SQLite update handler (HTTP only).
    SqliteUpdate(SqliteUpdateConfig),
}

/// The `http` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    /// Address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on.
    #[serde(default = "default_http_port")]
    pub bind_port: u16,
    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    /// Ordered handler pipeline.
    #[serde(default)]
    pub request_handlers: Vec<HandlerConfig>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_http_port(),
            max_request_body_size: default_max_request_body_size(),
            request_handlers: Vec::new(),
        }
    }
}

/// The `tftp` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TftpSection {
    /// Address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on.
    #[serde(default = "default_tftp_port")]
    pub bind_port: u16,
    /// Per-wait timeout in seconds when the client negotiates none.
    #[serde(default = "default_tftp_timeout")]
    pub default_timeout: u64,
    /// Retransmissions before a transfer is given up.
    #[serde(default = "default_tftp_retries")]
    pub max_retries: u32,
    /// Upper bound accepted for the `blksize` option.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u16,
    /// Value the block counter wraps to after 65535 (0 or 1).
    #[serde(default)]
    pub block_counter_wrap_value: u16,
    /// Ordered handler pipeline.
    #[serde(default)]
    pub request_handlers: Vec<HandlerConfig>,
}

impl Default for TftpSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_tftp_port(),
            default_timeout: default_tftp_timeout(),
            max_retries: default_tftp_retries(),
            max_block_size: default_max_block_size(),
            block_counter_wrap_value: 0,
            request_handlers: Vec::new(),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerFileConfig {
    /// Ordered data source stack.
    #[serde(default)]
    pub data_sources: Vec<SourceConfig>,
    /// Append-merge sequences when combining source contributions.
    #[serde(default)]
    pub data_sources_merge_lists: bool,
    /// HTTP server section.
    #[serde(default)]
    pub http: HttpSection,
    /// TFTP server section.
    #[serde(default)]
    pub tftp: TftpSection,
    /// Logging level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default)]
    pub logging_level: Option<String>,
    /// File holding tracing filter directives, one per line.
    #[serde(default)]
    pub logging_config_file: Option<PathBuf>,
}

fn default_bind_address() -> String {
    "::".to_string()
}

const fn default_http_port() -> u16 {
    80
}

const fn default_tftp_port() -> u16 {
    69
}

const fn default_max_request_body_size() -> usize {
    1024 * 1024
}

const fn default_tftp_timeout() -> u64 {
    5
}

const fn default_tftp_retries() -> u32 {
    5
}

const fn default_max_block_size() -> u16 {
    crate::tftp::protocol::MAX_BLOCK_SIZE
}

/// Returns the commented configuration template written by `vinegar init`.
#[must_use]
pub fn default_config_template() -> &'static str {
    r#"# Vinegar server configuration.

# Ordered stack of data sources. Later sources override earlier ones.
data_sources:
  # A text file with one line per system.
  - name: text_file
    file: /etc/vinegar/hosts.txt
    # The expression must match whole lines; named groups feed system_id
    # and the variables below.
    regular_expression: '(?P<mac>[0-9A-Fa-f:]+);(?P<ip>[0-9.]+);(?P<hostname>[^;]+)'
    regular_expression_ignore: '|(?:#.*)'
    system_id:
      source: hostname
      transform:
        - string.add_suffix: .example.com
        - string.to_lower
    variables:
      'net:mac_addr':
        source: mac
        transform:
          - mac_address.normalize
      'net:ipv4_addr':
        source: ip
        transform:
          - ipv4_address.normalize
      'net:hostname':
        source: hostname
        transform:
          - string.to_lower

  # Targeted YAML files; top.yaml maps matcher expressions to file lists.
  - name: yaml_target
    root_dir: /etc/vinegar/targets

  # Mutable per-system state, updated through the sqlite_update handler.
  - name: sqlite
    db_file: /var/lib/vinegar/state.db
    key_prefix: state

# Append-merge lists instead of replacing them when sources overlap.
#data_sources_merge_lists: true

http:
  bind_address: '::'
  bind_port: 80
  request_handlers:
    # Rendered installer configs, addressed by MAC.
    - name: file
      request_path: /preseed/...
      root_dir: /srv/vinegar/preseed
      lookup_key: 'net:mac_addr'
      lookup_value_transform:
        - mac_address.normalize
      template: handlebars
    # Clear the netboot flag once an installation finished.
    - name: sqlite_update
      request_path: /reset-netboot-enabled
      db_file: /var/lib/vinegar/state.db
      action: delete_value
      key: netboot_enabled
      client_address_key: 'net:ipv4_addr'

tftp:
  bind_address: '::'
  bind_port: 69
  request_handlers:
    # Boot-loader configs, addressed by MAC.
    - name: file
      request_path: /grub/...
      root_dir: /srv/vinegar/grub
      lookup_key: 'net:mac_addr'
      lookup_value_transform:
        - mac_address.normalize
      template: handlebars
      # Unknown machines fall back to a local-boot stanza in the template.
      lookup_no_result_action: continue
    # Static boot-loader binaries.
    - name: file
      request_path: /
      root_dir: /srv/vinegar/boot

logging_level: info
"#
}
