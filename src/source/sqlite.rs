//! Data source backed by the SQLite state store.
//!
//! Unlike the file-based sources, this source never caches: every query
//! touches the database. This is what makes updates written through the
//! `sqlite_update` request handler visible to the very next request.

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::data::{version_for_str, Value, Version};

use super::store::DataStore;
use super::{DataSource, DataSourceError, SourceBuildError};

/// Configuration of a [`SqliteSource`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Path of the SQLite database file.
    pub db_file: PathBuf,
    /// Allow reverse lookups through this source.
    #[serde(default = "default_find_system_enabled")]
    pub find_system_enabled: bool,
    /// Compound-key prefix under which the store's flat keys are nested.
    #[serde(default)]
    pub key_prefix: String,
}

const fn default_find_system_enabled() -> bool {
    true
}

/// Data source reading per-system values from the SQLite store.
pub struct SqliteSource {
    store: Arc<DataStore>,
    find_system_enabled: bool,
    key_prefix: String,
}

impl SqliteSource {
    /// Opens the backing store.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError::Store`] if the database cannot be
    /// opened.
    pub fn new(config: &SqliteConfig) -> Result<Self, SourceBuildError> {
        let store = Arc::new(DataStore::open(&config.db_file)?);
        Ok(Self::with_store(store, config))
    }

    /// Creates the source on top of an already-open store.
    #[must_use]
    pub fn with_store(store: Arc<DataStore>, config: &SqliteConfig) -> Self {
        Self {
            store,
            find_system_enabled: config.find_system_enabled,
            key_prefix: config.key_prefix.clone(),
        }
    }
}

impl DataSource for SqliteSource {
    fn get_data(
        &self,
        system_id: &str,
        _preceding: &Value,
        _preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        let flat = self.store.get_data(system_id)?;
        let mut data = Value::Mapping(flat);
        // The store uses flat keys; the prefix wraps them into the
        // configured spot of the tree.
        if !self.key_prefix.is_empty() {
            for component in self.key_prefix.rsplit(crate::data::KEY_SEPARATOR) {
                let mut wrapper = crate::data::Mapping::new();
                wrapper.insert(component.to_string(), data);
                data = Value::Mapping(wrapper);
            }
        }
        let version = version_for_str(&serde_json::Value::from(&data).to_string());
        Ok((data, version))
    }

    fn find_system(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        if !self.find_system_enabled {
            return Ok(None);
        }
        let store_key = if self.key_prefix.is_empty() {
            key
        } else {
            let prefix = format!("{}{}", self.key_prefix, crate::data::KEY_SEPARATOR);
            match key.strip_prefix(&prefix) {
                Some(stripped) => stripped,
                // A key outside the configured prefix cannot match.
                None => return Ok(None),
            }
        };
        let systems = self.store.find_systems(store_key, value)?;
        // Only an unambiguous match identifies a system.
        if systems.len() == 1 {
            Ok(systems.into_iter().next())
        } else {
            Ok(None)
        }
    }

    fn supports_find_system(&self) -> bool {
        self.find_system_enabled
    }
}
