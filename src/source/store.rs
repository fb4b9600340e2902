//! SQLite-backed store for per-system key/value state.
//!
//! The store keeps tuples `(system_id, key, value, type)` with a primary key
//! on `(system_id, key)`. Values are serialized as JSON text; the `type`
//! column records which of the supported kinds the value is so that it can
//! be reconstructed exactly.
//!
//! The database is opened in WAL mode with a busy timeout, so multiple
//! processes can safely share one file. Within a process, a single write
//! lock serializes all access through one connection; writes run in
//! immediate transactions and readers observe the last committed state.
//! The store never caches, which is what makes updates visible to request
//! handlers immediately.

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::data::{Mapping, Value};

/// Schema version recorded in `pragma user_version`.
const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MILLIS: i64 = 5000;

/// Error raised by the data store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened.
    #[error("Failed to open database {}: {source}", path.display())]
    Open {
        /// Path of the database file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// The database reports a schema version this build does not know.
    #[error("Database {} has unsupported schema version {found}", path.display())]
    SchemaVersion {
        /// Path of the database file.
        path: PathBuf,
        /// Version found in `pragma user_version`.
        found: i64,
    },

    /// A statement failed.
    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A stored value could not be deserialized.
    #[error("Malformed value stored for system \"{system_id}\" key \"{key}\": {source}")]
    MalformedValue {
        /// System the row belongs to.
        system_id: String,
        /// Key of the row.
        key: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Kind tag stored alongside each value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Boolean value.
    Bool,
    /// Integer value.
    Int,
    /// Floating-point value.
    Float,
    /// String value.
    String,
    /// Anything else: null, sequences, and mappings.
    Json,
}

impl ValueType {
    fn for_value(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Null | Value::Sequence(_) | Value::Mapping(_) => Self::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQLite-backed per-system key/value store.
///
/// Instances are safe for use by multiple threads.
pub struct DataStore {
    connection: Mutex<Connection>,
    path: PathBuf,
}

impl DataStore {
    /// Opens (and creates, if necessary) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened, the schema
    /// cannot be created, or the file carries an unknown schema version.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        // journal_mode is a query-style pragma that returns the resulting
        // mode, so the plain pragma_update cannot be used.
        connection.pragma_update_and_check(None, "journal_mode", "wal", |_| Ok(()))?;
        connection.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MILLIS)?;
        let user_version: i64 =
            connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match user_version {
            0 => {
                connection.execute_batch(
                    "CREATE TABLE IF NOT EXISTS system_data (
                         system_id TEXT NOT NULL,
                         key TEXT NOT NULL,
                         value TEXT,
                         type TEXT NOT NULL,
                         PRIMARY KEY (system_id, key)) WITHOUT ROWID;
                     CREATE INDEX IF NOT EXISTS key_value_index
                         ON system_data (key, value);",
                )?;
                connection.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            SCHEMA_VERSION => {}
            found => {
                return Err(StoreError::SchemaVersion {
                    path: path.to_path_buf(),
                    found,
                })
            }
        }
        Ok(Self {
            connection: Mutex::new(connection),
            path: path.to_path_buf(),
        })
    }

    /// Returns the path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all data stored for a system as a flat mapping.
    ///
    /// Returns an empty mapping for an unknown system.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failures or malformed rows.
    pub fn get_data(&self, system_id: &str) -> Result<Mapping, StoreError> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT key, value, type FROM system_data WHERE system_id = ? ORDER BY key;",
        )?;
        let mut rows = statement.query(params![system_id])?;
        let mut data = Mapping::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let raw: Option<String> = row.get(1)?;
            let value = decode_value(system_id, &key, raw.as_deref())?;
            data.insert(key, value);
        }
        Ok(data)
    }

    /// Returns the value stored for a system and key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failures or malformed rows.
    pub fn get_value(&self, system_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let connection = self.lock();
        let raw: Option<Option<String>> = connection
            .query_row(
                "SELECT value FROM system_data WHERE system_id = ? AND key = ?;",
                params![system_id, key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(decode_value(system_id, key, raw.as_deref())?)),
        }
    }

    /// Stores a value for a system and key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failures.
    pub fn set_value(&self, system_id: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let value_type = ValueType::for_value(value);
        let encoded = serde_json::Value::from(value).to_string();
        let mut connection = self.lock();
        let transaction =
            connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transaction.execute(
            "INSERT OR REPLACE INTO system_data (system_id, key, value, type)
             VALUES (?, ?, ?, ?);",
            params![system_id, key, encoded, value_type.as_str()],
        )?;
        transaction.commit()?;
        Ok(())
    }

    /// Deletes the value stored for a system and key.
    ///
    /// Deleting a key that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failures.
    pub fn delete_value(&self, system_id: &str, key: &str) -> Result<(), StoreError> {
        let mut connection = self.lock();
        let transaction =
            connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transaction.execute(
            "DELETE FROM system_data WHERE system_id = ? AND key = ?;",
            params![system_id, key],
        )?;
        transaction.commit()?;
        Ok(())
    }

    /// Deletes all data stored for a system.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failures.
    pub fn delete_data(&self, system_id: &str) -> Result<(), StoreError> {
        let mut connection = self.lock();
        let transaction =
            connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transaction.execute(
            "DELETE FROM system_data WHERE system_id = ?;",
            params![system_id],
        )?;
        transaction.commit()?;
        Ok(())
    }

    /// Returns the system IDs for which `key` holds exactly `value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failures.
    pub fn find_systems(&self, key: &str, value: &Value) -> Result<Vec<String>, StoreError> {
        let encoded = serde_json::Value::from(value).to_string();
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT system_id FROM system_data WHERE key = ? AND value = ?
             ORDER BY system_id;",
        )?;
        let systems = statement
            .query_map(params![key, encoded], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(systems)
    }

    /// Returns every system ID with at least one stored key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failures.
    pub fn list_systems(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.lock();
        let mut statement = connection
            .prepare("SELECT DISTINCT system_id FROM system_data ORDER BY system_id;")?;
        let systems = statement
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(systems)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-statement; the
        // connection itself stays usable.
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn decode_value(
    system_id: &str,
    key: &str,
    raw: Option<&str>,
) -> Result<Value, StoreError> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let json: serde_json::Value =
        serde_json::from_str(raw).map_err(|source| StoreError::MalformedValue {
            system_id: system_id.to_string(),
            key: key.to_string(),
            source,
        })?;
    Ok(Value::from(json))
}
