//! YAML-based data source using pattern-based targeting.
//!
//! The file `top.yaml` in the root of a directory tree maps matcher
//! expressions to lists of data files. For each system, every entry whose
//! expression matches contributes its files; the files are rendered through
//! the template engine (with `id` and the preceding data in scope), parsed
//! as YAML, and recursively merged in top order.
//!
//! A file name `a.b.c` resolves to `a/b/c.yaml` under the root, or to
//! `a/b/c/init.yaml` if the former does not exist. A name with a leading `.`
//! resolves relative to the directory of the including file. A data file can
//! pull in further files with an `include:` list; keys before the include
//! merge before the included data, keys after it merge after.
//!
//! This source cannot identify a system from its data, so it does not
//! support reverse lookups.

#[cfg(test)]
#[path = "yaml_target_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::data::{aggregate_version, merge, version_for_str, Value, Version};
use crate::matcher::Matcher;
use crate::template::{create_engine, Context, EngineConfig, TemplateEngine};

use super::{DataSource, DataSourceError, SourceBuildError};

/// Configuration of a [`YamlTargetSource`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlTargetConfig {
    /// Root of the directory tree holding `top.yaml` and the data files.
    pub root_dir: PathBuf,
    /// Append-merge sequences instead of replacing them.
    #[serde(default)]
    pub merge_lists: bool,
    /// Tolerate a `top.yaml` that renders to an empty document.
    #[serde(default)]
    pub allow_empty_top: bool,
    /// Template engine used for the data files; `none` disables templating.
    #[serde(default = "default_template")]
    pub template: String,
    /// Configuration passed to the template engine.
    #[serde(default)]
    pub template_config: EngineConfig,
}

fn default_template() -> String {
    "handlebars".to_string()
}

/// Data source reading targeted YAML files from a directory tree.
pub struct YamlTargetSource {
    root_dir: PathBuf,
    top_file: PathBuf,
    merge_lists: bool,
    allow_empty_top: bool,
    engine: Option<Arc<dyn TemplateEngine>>,
    // Memoized result per system, valid while the aggregate version holds.
    cache: Mutex<HashMap<String, (Version, Value)>>,
}

impl YamlTargetSource {
    /// Builds the source and its template engine.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] if the engine name is unknown.
    pub fn new(config: &YamlTargetConfig) -> Result<Self, SourceBuildError> {
        let engine = if config.template == "none" {
            None
        } else {
            Some(create_engine(&config.template, &config.template_config)?)
        };
        Ok(Self {
            root_dir: config.root_dir.clone(),
            top_file: config.root_dir.join("top.yaml"),
            merge_lists: config.merge_lists,
            allow_empty_top: config.allow_empty_top,
            engine,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Renders a file through the engine (or reads it verbatim) and returns
    /// the text plus its content version.
    fn render_file(
        &self,
        path: &Path,
        context: &Context,
    ) -> Result<(String, Version), DataSourceError> {
        let text = match &self.engine {
            Some(engine) => {
                let bytes =
                    engine
                        .render(path, context)
                        .map_err(|source| DataSourceError::Template {
                            path: path.to_path_buf(),
                            source,
                        })?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => {
                std::fs::read_to_string(path).map_err(|source| DataSourceError::Io {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };
        let version = version_for_str(&text);
        Ok((text, version))
    }

    /// Evaluates `top.yaml` and returns the file names that apply to the
    /// system, in top order.
    fn process_top(
        &self,
        system_id: &str,
        context: &Context,
    ) -> Result<Vec<String>, DataSourceError> {
        if !self.top_file.is_file() {
            return Err(DataSourceError::Io {
                path: self.top_file.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "top.yaml not found",
                ),
            });
        }
        let (text, _) = self.render_file(&self.top_file, context)?;
        let top: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|err| DataSourceError::Parse {
                path: self.top_file.clone(),
                message: err.to_string(),
            })?;
        if top.is_null() {
            if self.allow_empty_top {
                return Ok(Vec::new());
            }
            return Err(DataSourceError::Parse {
                path: self.top_file.clone(),
                message: "top file is empty; set allow_empty_top to accept this".to_string(),
            });
        }
        // The YAML mapping type preserves document order, which defines the
        // merge order; the data tree type would not.
        let Some(mapping) = top.as_mapping() else {
            return Err(DataSourceError::Parse {
                path: self.top_file.clone(),
                message: "top file must contain a mapping at the top level".to_string(),
            });
        };
        let data = context.data.clone().unwrap_or_else(Value::empty_mapping);
        let mut files = Vec::new();
        for (expression, file_list) in mapping {
            let Some(expression) = expression.as_str() else {
                return Err(DataSourceError::Parse {
                    path: self.top_file.clone(),
                    message: "target expressions must be strings".to_string(),
                });
            };
            let matcher =
                Matcher::parse(expression).map_err(|source| DataSourceError::Matcher {
                    path: self.top_file.clone(),
                    source,
                })?;
            if matcher.matches(system_id, &data) {
                files.extend(file_name_list(&self.top_file, file_list)?);
            }
        }
        Ok(files)
    }

    /// Resolves a dotted file name to a path on disk.
    fn resolve_file(
        &self,
        including_file: &Path,
        name: &str,
    ) -> Result<PathBuf, DataSourceError> {
        // A leading dot resolves relative to the including file.
        let (base, relative_name) = match name.strip_prefix('.') {
            Some(rest) => (
                including_file
                    .parent()
                    .unwrap_or(&self.root_dir)
                    .to_path_buf(),
                rest,
            ),
            None => (self.root_dir.clone(), name),
        };
        let mut path = base;
        for segment in relative_name.split('.') {
            path.push(segment);
        }
        let file_path = path.with_extension("yaml");
        if file_path.is_file() {
            return Ok(file_path);
        }
        let init_path = path.join("init.yaml");
        if init_path.is_file() {
            return Ok(init_path);
        }
        Err(DataSourceError::Other(format!(
            "File {name} included by {} could not be found",
            including_file.display()
        )))
    }

    /// Processes one data file, returning ordered `(data, version)` pieces.
    fn process_file(
        &self,
        parents: &mut Vec<String>,
        name: &str,
        path: &Path,
        context: &Context,
    ) -> Result<Vec<(Value, Version)>, DataSourceError> {
        if parents.iter().any(|parent| parent == name) {
            let start = parents.iter().position(|parent| parent == name).unwrap_or(0);
            let chain: Vec<&str> = parents[start..]
                .iter()
                .map(String::as_str)
                .chain([name])
                .collect();
            return Err(DataSourceError::Other(format!(
                "Include cycle detected: {}",
                chain.join(" -> ")
            )));
        }
        let (text, version) = self.render_file(path, context)?;
        let document: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|err| DataSourceError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        if document.is_null() {
            return Ok(Vec::new());
        }
        let Some(mapping) = document.as_mapping() else {
            return Err(DataSourceError::Parse {
                path: path.to_path_buf(),
                message: "data files must contain a mapping at the top level".to_string(),
            });
        };

        // Split the document around the include list so that data before it
        // merges before the included files and data after it merges after.
        let mut preceding = serde_yaml::Mapping::new();
        let mut following = serde_yaml::Mapping::new();
        let mut include_files: Option<Vec<String>> = None;
        for (key, value) in mapping {
            if key.as_str() == Some("include") {
                include_files = Some(file_name_list(path, value)?);
            } else if include_files.is_none() {
                preceding.insert(key.clone(), value.clone());
            } else {
                following.insert(key.clone(), value.clone());
            }
        }

        let mut pieces = Vec::new();
        if !preceding.is_empty() {
            pieces.push((Value::from(serde_yaml::Value::Mapping(preceding)), version));
        }
        if let Some(include_files) = include_files {
            parents.push(name.to_string());
            for included_name in include_files {
                let included_path = self.resolve_file(path, &included_name)?;
                pieces.extend(self.process_file(
                    parents,
                    &included_name,
                    &included_path,
                    context,
                )?);
            }
            parents.pop();
        }
        if !following.is_empty() {
            pieces.push((Value::from(serde_yaml::Value::Mapping(following)), version));
        }
        Ok(pieces)
    }

    fn compile(
        &self,
        system_id: &str,
        preceding: &Value,
    ) -> Result<(Value, Version), DataSourceError> {
        let context = Context {
            id: Some(system_id.to_string()),
            data: Some(preceding.clone()),
            request_info: None,
        };
        let file_names = self.process_top(system_id, &context)?;
        let mut pieces = Vec::new();
        let mut parents = vec!["top file".to_string()];
        for name in file_names {
            let path = self.resolve_file(&self.top_file, &name)?;
            pieces.extend(self.process_file(&mut parents, &name, &path, &context)?);
        }
        let version = aggregate_version(pieces.iter().map(|(_, version)| *version));
        // Serve the cached tree while the involved file versions hold.
        {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((cached_version, cached_data)) = cache.get(system_id) {
                if *cached_version == version {
                    return Ok((cached_data.clone(), version));
                }
            }
        }
        let mut data = Value::empty_mapping();
        for (piece, _) in pieces {
            data = merge(&data, &piece, self.merge_lists)?;
        }
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(system_id.to_string(), (version, data.clone()));
        Ok((data, version))
    }
}

impl DataSource for YamlTargetSource {
    fn get_data(
        &self,
        system_id: &str,
        preceding: &Value,
        _preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        self.compile(system_id, preceding)
    }

    fn find_system(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        Ok(None)
    }

    fn supports_find_system(&self) -> bool {
        false
    }
}

/// Reads a YAML sequence of file names.
fn file_name_list(
    path: &Path,
    value: &serde_yaml::Value,
) -> Result<Vec<String>, DataSourceError> {
    let Some(sequence) = value.as_sequence() else {
        return Err(DataSourceError::Parse {
            path: path.to_path_buf(),
            message: "expected a list of file names".to_string(),
        });
    };
    sequence
        .iter()
        .map(|entry| {
            entry.as_str().map(str::to_string).ok_or_else(|| {
                DataSourceError::Parse {
                    path: path.to_path_buf(),
                    message: "file names must be strings".to_string(),
                }
            })
        })
        .collect()
}
