//! Sources providing the configuration data associated with each system.
//!
//! A [`DataSource`] contributes a partial data tree for a system (forward
//! lookup) and can optionally identify a system given a key and a value
//! (reverse lookup). Multiple sources are stacked with
//! [`CompositeDataSource`]: contributions are merged in declared order, and
//! the first source claiming a reverse lookup wins.
//!
//! Data sources are thread safe; `get_data` and `find_system` may be called
//! concurrently from different request workers.

mod sqlite;
mod store;
mod text_file;
mod yaml_target;

#[cfg(test)]
#[path = "composite_tests.rs"]
mod composite_tests;

pub use sqlite::{SqliteConfig, SqliteSource};
pub use store::{DataStore, StoreError, ValueType};
pub use text_file::{TextFileConfig, TextFileSource};
pub use yaml_target::{YamlTargetConfig, YamlTargetSource};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::data::{aggregate_version, merge, MergeError, Value, Version};
use crate::matcher::MatcherError;
use crate::template::TemplateError;
use crate::transform::ChainError;

/// Error raised while building a data source from its configuration.
///
/// Build errors are fatal at startup; the server reports them as
/// configuration errors.
#[derive(Debug, Error)]
pub enum SourceBuildError {
    /// A regular expression in the configuration did not compile.
    #[error("Invalid regular expression \"{pattern}\": {source}")]
    Regex {
        /// The offending pattern.
        pattern: String,
        /// Compile error.
        #[source]
        source: regex::Error,
    },

    /// A transform chain in the configuration was invalid.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The backing store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The template engine could not be constructed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Any other invalid configuration value.
    #[error("{0}")]
    Invalid(String),
}

/// Error raised by a data source while serving a request.
///
/// How a failure is surfaced to the client is the caller's concern (see the
/// request handlers' `data_source_error_action`), not the source's.
#[derive(Debug, Error)]
pub enum DataSourceError {
    /// An I/O error while reading a backing file.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A backing file could not be parsed.
    #[error("Error parsing {path}: {message}")]
    Parse {
        /// Path of the malformed file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// A matcher expression in a target file was invalid.
    #[error("Invalid matcher expression in {path}: {source}")]
    Matcher {
        /// File containing the expression.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: MatcherError,
    },

    /// Rendering a backing template failed.
    #[error("Error rendering {path}: {source}")]
    Template {
        /// Path of the template.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: TemplateError,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Two contributions could not be merged.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Any other failure, e.g. an include cycle.
    #[error("{0}")]
    Other(String),
}

/// A source of per-system configuration data.
pub trait DataSource: Send + Sync {
    /// Returns the source's contribution for a system plus a version.
    ///
    /// `preceding` is the merged result of all earlier sources in the stack
    /// together with its version; sources that render templates expose it
    /// to them. Merging the contribution into `preceding` is the caller's
    /// job, not the source's.
    ///
    /// The returned version changes whenever the returned data changes for
    /// the same system. A system the source knows nothing about yields an
    /// empty mapping.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError`] on I/O, parse, or template failures.
    fn get_data(
        &self,
        system_id: &str,
        preceding: &Value,
        preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError>;

    /// Finds a system given a lookup key and value.
    ///
    /// Returns `Ok(None)` if no system matches. Sources that cannot perform
    /// reverse lookups report [`DataSource::supports_find_system`] as
    /// `false` and always return `Ok(None)` here.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError`] on I/O or parse failures.
    fn find_system(&self, key: &str, value: &Value)
        -> Result<Option<String>, DataSourceError>;

    /// Tells whether this source can perform reverse lookups at all.
    ///
    /// The composite skips unsupported sources without calling
    /// [`DataSource::find_system`].
    fn supports_find_system(&self) -> bool {
        true
    }
}

/// Ordered stack of data sources with defined merge semantics.
pub struct CompositeDataSource {
    sources: Vec<Arc<dyn DataSource>>,
    merge_lists: bool,
    cache: Mutex<HashMap<String, (Version, Value)>>,
}

impl CompositeDataSource {
    /// Creates a composite over the given sources.
    ///
    /// Merge order equals the order of `sources`. `merge_lists` selects
    /// append-merge for sequences instead of replacement.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn DataSource>>, merge_lists: bool) -> Self {
        Self {
            sources,
            merge_lists,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl DataSource for CompositeDataSource {
    fn get_data(
        &self,
        system_id: &str,
        preceding: &Value,
        preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        let mut data = preceding.clone();
        let mut version = preceding_version;
        for source in &self.sources {
            let (contribution, contribution_version) =
                source.get_data(system_id, &data, version)?;
            data = merge(&data, &contribution, self.merge_lists)?;
            version = aggregate_version([version, contribution_version]);
        }
        // Return the cached tree when nothing changed, so that repeated
        // lookups for an unchanged source stack yield equal results without
        // keeping stale data alive after a change.
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match cache.get(system_id) {
            Some((cached_version, cached_data)) if *cached_version == version => {
                Ok((cached_data.clone(), version))
            }
            _ => {
                cache.insert(system_id.to_string(), (version, data.clone()));
                Ok((data, version))
            }
        }
    }

    fn find_system(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        for source in &self.sources {
            if !source.supports_find_system() {
                continue;
            }
            if let Some(system_id) = source.find_system(key, value)? {
                return Ok(Some(system_id));
            }
        }
        Ok(None)
    }
}
