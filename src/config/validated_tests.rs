//! Tests for configuration parsing and validation.

use super::*;
use crate::config::file::ServerFileConfig;

fn cli() -> Cli {
    Cli {
        config_file: None,
        verbose: false,
        command: None,
    }
}

fn validate(yaml: &str) -> Result<ValidatedConfig, ConfigError> {
    let file: ServerFileConfig = serde_yaml::from_str(yaml)?;
    ValidatedConfig::from_file_config(file, &cli())
}

mod defaults {
    use super::*;

    #[test]
    fn an_empty_document_yields_the_documented_defaults() {
        let config = validate("{}").unwrap();
        assert_eq!(config.http.bind_address.to_string(), "::");
        assert_eq!(config.http.bind_port, 80);
        assert_eq!(config.tftp.bind_port, 69);
        assert_eq!(config.tftp.default_timeout, 5);
        assert_eq!(config.tftp.max_retries, 5);
        assert_eq!(config.tftp.block_counter_wrap_value, 0);
        assert!(!config.data_sources_merge_lists);
        assert!(config.data_sources.is_empty());
        assert!(matches!(&config.logging, LoggingConfig::Level(level) if level == "info"));
    }

    #[test]
    fn sections_can_be_partially_specified() {
        let config = validate("http:\n  bind_port: 8080\n").unwrap();
        assert_eq!(config.http.bind_port, 8080);
        assert_eq!(config.tftp.bind_port, 69);
    }
}

mod sources {
    use super::*;

    #[test]
    fn data_sources_are_selected_by_name_in_order() {
        let config = validate(
            r#"
data_sources:
  - name: sqlite
    db_file: /var/lib/vinegar/state.db
  - name: yaml_target
    root_dir: /etc/vinegar/targets
"#,
        )
        .unwrap();
        assert_eq!(config.data_sources.len(), 2);
        assert!(matches!(config.data_sources[0], SourceConfig::Sqlite(_)));
        assert!(matches!(config.data_sources[1], SourceConfig::YamlTarget(_)));
    }

    #[test]
    fn unknown_source_names_fail_parsing() {
        assert!(validate("data_sources:\n  - name: ldap\n").is_err());
    }

    #[test]
    fn unknown_source_options_fail_parsing() {
        assert!(validate(
            "data_sources:\n  - name: sqlite\n    db_file: /x\n    bogus: 1\n"
        )
        .is_err());
    }
}

mod handlers {
    use super::*;

    #[test]
    fn handler_pipelines_preserve_declaration_order() {
        let config = validate(
            r#"
http:
  request_handlers:
    - name: sqlite_update
      request_path: /reset
      db_file: /x.db
      action: delete_data
    - name: file
      request_path: /files
      root_dir: /srv/files
"#,
        )
        .unwrap();
        assert_eq!(config.http_handlers.len(), 2);
        assert!(matches!(config.http_handlers[0], HandlerConfig::SqliteUpdate(_)));
        assert!(matches!(config.http_handlers[1], HandlerConfig::File(_)));
    }

    #[test]
    fn sqlite_update_is_rejected_for_tftp() {
        let err = validate(
            r#"
tftp:
  request_handlers:
    - name: sqlite_update
      request_path: /reset
      db_file: /x.db
      action: delete_data
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { .. }));
    }
}

mod validation {
    use super::*;

    #[test]
    fn bad_bind_addresses_are_rejected() {
        let err = validate("http:\n  bind_address: nowhere\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidBindAddress { server: "http", .. }
        ));
        assert!(validate("tftp:\n  bind_address: '999.0.0.1'\n").is_err());
    }

    #[test]
    fn wrap_value_must_be_zero_or_one() {
        assert!(validate("tftp:\n  block_counter_wrap_value: 1\n").is_ok());
        assert!(validate("tftp:\n  block_counter_wrap_value: 2\n").is_err());
    }

    #[test]
    fn tftp_timeout_must_be_positive() {
        assert!(validate("tftp:\n  default_timeout: 0\n").is_err());
    }

    #[test]
    fn max_block_size_is_clamped_into_the_protocol_range() {
        let config = validate("tftp:\n  max_block_size: 100\n").unwrap();
        assert_eq!(config.tftp.max_block_size, 512);
    }

    #[test]
    fn logging_options_are_mutually_exclusive() {
        let err = validate(
            "logging_level: info\nlogging_config_file: /etc/vinegar/logging.conf\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingLoggingOptions));
    }

    #[test]
    fn unknown_logging_levels_are_rejected() {
        assert!(validate("logging_level: loud\n").is_err());
        assert!(validate("logging_level: DEBUG\n").is_ok());
    }
}

mod template {
    use super::*;

    #[test]
    fn the_generated_template_parses_and_validates() {
        let config = validate(default_config_template()).unwrap();
        assert_eq!(config.data_sources.len(), 3);
        assert_eq!(config.http_handlers.len(), 2);
        assert_eq!(config.tftp_handlers.len(), 2);
    }
}
