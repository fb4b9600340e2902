//! Data source backed by a plain text file with one line per system.
//!
//! Every non-ignored line is matched against a configured regular expression
//! whose capture groups feed the `system_id` projection and each `variables`
//! entry. All transforms run eagerly when the file is parsed; the parsed
//! records are cached and re-read when the file changes on disk.
//!
//! This source supports reverse lookups over the final (transformed)
//! values, which makes it a good root source defining the set of existing
//! systems.

#[cfg(test)]
#[path = "text_file_tests.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Deserialize;

use crate::data::{version_for_file, version_for_str, Value, Version};
use crate::transform::{ChainSpec, TransformChain};

use super::{DataSource, DataSourceError, SourceBuildError};

/// What to do with a line that the configuration cannot digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineAction {
    /// Log a warning and skip the line.
    #[default]
    Warn,
    /// Fail the whole read.
    Error,
    /// Skip the line silently.
    Ignore,
}

/// How the value of one variable is extracted from a matched line.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    /// Capture group providing the raw value, by name or index.
    pub source: GroupRef,
    /// Transform chain applied to the raw value.
    #[serde(default)]
    pub transform: ChainSpec,
}

/// Reference to a regular-expression capture group.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GroupRef {
    /// Group index (0 is the whole match).
    Index(usize),
    /// Named group.
    Name(String),
}

/// Configuration of a [`TextFileSource`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextFileConfig {
    /// Path of the text file.
    pub file: PathBuf,
    /// Regular expression matched against every full line.
    pub regular_expression: String,
    /// Lines fully matching this expression are skipped silently.
    #[serde(default)]
    pub regular_expression_ignore: Option<String>,
    /// Projection producing the system ID.
    pub system_id: VariableConfig,
    /// Projections producing the data tree; keys may be compound.
    pub variables: BTreeMap<String, VariableConfig>,
    /// Re-read the file only when its version changes.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Return the first of several systems matching a reverse lookup
    /// instead of treating the lookup as ambiguous.
    #[serde(default)]
    pub find_first_match: bool,
    /// What to do with lines matching neither expression.
    #[serde(default)]
    pub mismatch_action: LineAction,
    /// What to do with a line that repeats an earlier system ID.
    #[serde(default)]
    pub duplicate_system_id_action: LineAction,
}

const fn default_cache_enabled() -> bool {
    true
}

struct CompiledVariable {
    source: GroupRef,
    chain: TransformChain,
}

/// Records parsed from one version of the file.
#[derive(Default)]
struct ParsedFile {
    file_version: Version,
    systems: HashMap<String, (Value, Version)>,
    // Reverse index over the plain rendering of every stored value.
    index: HashMap<(String, String), Vec<String>>,
}

/// Data source reading per-system records from a text file.
pub struct TextFileSource {
    file: PathBuf,
    line_regex: Regex,
    ignore_regex: Option<Regex>,
    system_id: CompiledVariable,
    variables: Vec<(String, CompiledVariable)>,
    cache_enabled: bool,
    find_first_match: bool,
    mismatch_action: LineAction,
    duplicate_system_id_action: LineAction,
    parsed: RwLock<Arc<ParsedFile>>,
}

impl TextFileSource {
    /// Builds the source, compiling its expressions and transform chains.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] for invalid regular expressions or
    /// transform chains.
    pub fn new(config: &TextFileConfig) -> Result<Self, SourceBuildError> {
        let line_regex = compile_full_match(&config.regular_expression)?;
        let ignore_regex = config
            .regular_expression_ignore
            .as_deref()
            .map(compile_full_match)
            .transpose()?;
        let system_id = compile_variable(&config.system_id)?;
        let variables = config
            .variables
            .iter()
            .map(|(key, variable)| Ok((key.clone(), compile_variable(variable)?)))
            .collect::<Result<Vec<_>, SourceBuildError>>()?;
        Ok(Self {
            file: config.file.clone(),
            line_regex,
            ignore_regex,
            system_id,
            variables,
            cache_enabled: config.cache_enabled,
            find_first_match: config.find_first_match,
            mismatch_action: config.mismatch_action,
            duplicate_system_id_action: config.duplicate_system_id_action,
            parsed: RwLock::new(Arc::new(ParsedFile::default())),
        })
    }

    /// Returns the current parsed records, re-reading the file if needed.
    fn current(&self) -> Result<Arc<ParsedFile>, DataSourceError> {
        let current_version = version_for_file(&self.file);
        if self.cache_enabled {
            let parsed = self
                .parsed
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if parsed.file_version == current_version {
                return Ok(Arc::clone(&parsed));
            }
        }
        let fresh = Arc::new(self.parse_file(current_version)?);
        let mut parsed = self
            .parsed
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *parsed = Arc::clone(&fresh);
        Ok(fresh)
    }

    fn parse_file(&self, file_version: Version) -> Result<ParsedFile, DataSourceError> {
        let content =
            std::fs::read_to_string(&self.file).map_err(|source| DataSourceError::Io {
                path: self.file.clone(),
                source,
            })?;
        let mut parsed = ParsedFile {
            file_version,
            ..ParsedFile::default()
        };
        let mut system_lines: HashMap<String, usize> = HashMap::new();
        let mut lines: Vec<&str> = content.split('\n').collect();
        // A trailing newline produces one empty pseudo-line.
        if lines.last() == Some(&"") {
            lines.pop();
        }
        for (line_index, raw_line) in lines.into_iter().enumerate() {
            let line_no = line_index + 1;
            // Only line terminators are trimmed, not other whitespace.
            let line = raw_line.trim_end_matches('\r');
            if let Some(ignore) = &self.ignore_regex {
                if ignore.is_match(line) {
                    continue;
                }
            }
            let Some(captures) = self.line_regex.captures(line) else {
                match self.mismatch_action {
                    LineAction::Error => {
                        return Err(DataSourceError::Parse {
                            path: self.file.clone(),
                            message: format!(
                                "line {line_no} does not match the configured format: \"{line}\""
                            ),
                        });
                    }
                    LineAction::Warn => {
                        tracing::warn!(
                            "Line {line_no} of {} does not match the configured format: \"{line}\"",
                            self.file.display()
                        );
                    }
                    LineAction::Ignore => {}
                }
                continue;
            };
            let system_id = match extract_value(&captures, &self.system_id) {
                Ok(Some(Value::String(id))) if !id.is_empty() => id,
                Ok(other) => {
                    return Err(DataSourceError::Parse {
                        path: self.file.clone(),
                        message: format!(
                            "line {line_no} does not produce a system ID (got {})",
                            other.map_or("no value", |value| value.kind())
                        ),
                    });
                }
                Err(err) => {
                    return Err(DataSourceError::Parse {
                        path: self.file.clone(),
                        message: format!("line {line_no}: {err}"),
                    });
                }
            };
            if let Some(&existing_line) = system_lines.get(&system_id) {
                match self.duplicate_system_id_action {
                    LineAction::Error => {
                        return Err(DataSourceError::Parse {
                            path: self.file.clone(),
                            message: format!(
                                "line {line_no}: system ID \"{system_id}\" is already \
                                 specified in line {existing_line}"
                            ),
                        });
                    }
                    LineAction::Warn => {
                        tracing::warn!(
                            "Duplicate system ID in {} line {line_no}: \"{system_id}\" is \
                             already specified in line {existing_line}; ignoring line {line_no}",
                            self.file.display()
                        );
                    }
                    LineAction::Ignore => {}
                }
                continue;
            }
            let mut data = Value::empty_mapping();
            for (key, variable) in &self.variables {
                let value = match extract_value(&captures, variable) {
                    Ok(value) => value,
                    Err(err) => {
                        return Err(DataSourceError::Parse {
                            path: self.file.clone(),
                            message: format!("line {line_no}: {err}"),
                        });
                    }
                };
                // A variable whose group did not participate in the match
                // is simply left out of the tree.
                let Some(value) = value else { continue };
                parsed
                    .index
                    .entry((key.clone(), value.to_plain_string()))
                    .or_default()
                    .push(system_id.clone());
                data.insert(key, value);
            }
            parsed
                .systems
                .insert(system_id.clone(), (data, version_for_str(line)));
            system_lines.insert(system_id, line_no);
        }
        Ok(parsed)
    }
}

impl DataSource for TextFileSource {
    fn get_data(
        &self,
        system_id: &str,
        _preceding: &Value,
        _preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        let parsed = self.current()?;
        Ok(parsed
            .systems
            .get(system_id)
            .map_or_else(|| (Value::empty_mapping(), 0), Clone::clone))
    }

    fn find_system(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        let parsed = self.current()?;
        let Some(systems) = parsed
            .index
            .get(&(key.to_string(), value.to_plain_string()))
        else {
            return Ok(None);
        };
        if systems.len() == 1 || self.find_first_match {
            Ok(systems.first().cloned())
        } else {
            // Ambiguous lookups identify no system.
            Ok(None)
        }
    }
}

fn compile_full_match(pattern: &str) -> Result<Regex, SourceBuildError> {
    // The configured expression must match the full line.
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| SourceBuildError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_variable(config: &VariableConfig) -> Result<CompiledVariable, SourceBuildError> {
    Ok(CompiledVariable {
        source: config.source.clone(),
        chain: TransformChain::from_spec(&config.transform)?,
    })
}

fn extract_value(
    captures: &regex::Captures<'_>,
    variable: &CompiledVariable,
) -> Result<Option<Value>, DataSourceError> {
    let group = match &variable.source {
        GroupRef::Index(index) => captures.get(*index),
        GroupRef::Name(name) => captures.name(name.as_str()),
    };
    let Some(group) = group else {
        return Ok(None);
    };
    let value = variable
        .chain
        .apply(Value::String(group.as_str().to_string()))
        .map_err(|err| DataSourceError::Other(err.to_string()))?;
    Ok(Some(value))
}
