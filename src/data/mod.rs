//! The data tree assembled for a system.
//!
//! A [`Value`] is the concrete union representation of everything a data
//! source can contribute: scalars, sequences, and nested mappings. Compound
//! keys using `:` as the separator address nested items (`net:mac_addr` is
//! `tree["net"]["mac_addr"]`); they are a lookup convenience, not a storage
//! form. Lookups traverse sequences by integer index. A missing key yields
//! `None`, which is distinct from a stored [`Value::Null`].

mod version;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

pub use version::{aggregate_version, version_for_file, version_for_str, Version};

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Separator used in compound keys.
pub const KEY_SEPARATOR: char = ':';

/// A mapping node of the data tree.
pub type Mapping = BTreeMap<String, Value>;

/// A node in the data tree of a system.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null. Distinct from an absent key.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// String scalar.
    String(String),
    /// Ordered sequence of values.
    Sequence(Vec<Value>),
    /// Nested mapping with string keys.
    Mapping(Mapping),
}

/// Error raised when two data trees cannot be merged.
///
/// Merging fails when the same key holds a mapping in one tree but a
/// non-mapping in the other (and, with list merging enabled, a sequence in
/// one tree but a non-sequence in the other).
#[derive(Debug, Error)]
#[error("Cannot merge {found} with {expected} for key \"{key}\"")]
pub struct MergeError {
    /// Compound key at which the conflict occurred.
    pub key: String,
    /// Kind of the value in the base tree.
    pub expected: &'static str,
    /// Kind of the conflicting value in the overlay tree.
    pub found: &'static str,
}

impl Value {
    /// Returns an empty mapping value.
    #[must_use]
    pub fn empty_mapping() -> Self {
        Self::Mapping(Mapping::new())
    }

    /// Returns a short name for the kind of this value, for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
        }
    }

    /// Returns the string slice if this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the mapping if this value is a mapping.
    #[must_use]
    pub const fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Returns `true` if this value is a mapping with no entries.
    #[must_use]
    pub fn is_empty_mapping(&self) -> bool {
        matches!(self, Self::Mapping(m) if m.is_empty())
    }

    /// Looks up a compound key in the tree.
    ///
    /// The key is split at [`KEY_SEPARATOR`] and each component is used as
    /// the key on one level of nesting. Sequences are traversed by parsing
    /// the component as an integer index.
    ///
    /// Returns `None` if any component is missing. An explicitly stored
    /// null is returned as `Some(&Value::Null)`, never as `None`.
    #[must_use]
    pub fn lookup(&self, compound_key: &str) -> Option<&Value> {
        let mut current = self;
        for component in compound_key.split(KEY_SEPARATOR) {
            current = match current {
                Self::Mapping(map) => map.get(component)?,
                Self::Sequence(seq) => {
                    let index: usize = component.parse().ok()?;
                    seq.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Inserts a value at a compound key, creating nested mappings for all
    /// but the last component as needed.
    ///
    /// Intermediate values that exist but are not mappings are replaced by
    /// mappings.
    pub fn insert(&mut self, compound_key: &str, value: Value) {
        let mut current = self;
        let mut components = compound_key.split(KEY_SEPARATOR).peekable();
        while let Some(component) = components.next() {
            if !matches!(current, Self::Mapping(_)) {
                *current = Self::empty_mapping();
            }
            let Self::Mapping(map) = current else {
                unreachable!()
            };
            if components.peek().is_none() {
                map.insert(component.to_string(), value);
                return;
            }
            current = map
                .entry(component.to_string())
                .or_insert_with(Self::empty_mapping);
        }
    }

    /// Renders the value as the plain string used for comparisons.
    ///
    /// Scalars render without quoting; sequences and mappings render as
    /// compact JSON.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            other => serde_json::Value::from(other).to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_plain_string())
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(Self::Null, Self::Number)
            }
            Value::String(s) => Self::String(s.clone()),
            Value::Sequence(seq) => Self::Array(seq.iter().map(Self::from).collect()),
            Value::Mapping(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(seq) => {
                Self::Sequence(seq.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Mapping(
                map.into_iter().map(|(k, v)| (k, Self::from(v))).collect(),
            ),
        }
    }
}

impl From<serde_yaml::Value> for Value {
    fn from(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Self::Null,
            serde_yaml::Value::Bool(b) => Self::Bool(b),
            serde_yaml::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_yaml::Value::String(s) => Self::String(s),
            serde_yaml::Value::Sequence(seq) => {
                Self::Sequence(seq.into_iter().map(Self::from).collect())
            }
            serde_yaml::Value::Mapping(map) => Self::Mapping(
                map.into_iter()
                    .map(|(k, v)| (yaml_key_to_string(&k), Self::from(v)))
                    .collect(),
            ),
            // Tagged values lose their tag; only the payload is kept.
            serde_yaml::Value::Tagged(tagged) => Self::from(tagged.value),
        }
    }
}

/// Renders a YAML mapping key as a string.
///
/// YAML allows non-string keys; data trees do not, so non-string keys are
/// rendered through their scalar representation.
fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Merges two data trees, returning the resulting tree.
///
/// Mappings merge recursively. Scalar replacement is last-wins: if the same
/// key is present in both trees, the value from `overlay` takes precedence.
/// Sequences are replaced by `overlay` unless `merge_lists` is set, in which
/// case elements of the overlay sequence that are not already present are
/// appended.
///
/// # Errors
///
/// Returns [`MergeError`] if a key holds a mapping in one tree and a
/// non-mapping in the other, or (with `merge_lists`) a sequence in one tree
/// and a non-sequence in the other.
pub fn merge(base: &Value, overlay: &Value, merge_lists: bool) -> Result<Value, MergeError> {
    merge_at(base, overlay, merge_lists, None)
}

fn merge_at(
    base: &Value,
    overlay: &Value,
    merge_lists: bool,
    parent_key: Option<&str>,
) -> Result<Value, MergeError> {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let absolute_key = match parent_key {
                    Some(parent) => format!("{parent}{KEY_SEPARATOR}{key}"),
                    None => key.clone(),
                };
                let merged_value = match base_map.get(key) {
                    Some(base_value) => {
                        merge_at(base_value, overlay_value, merge_lists, Some(&absolute_key))?
                    }
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Ok(Value::Mapping(merged))
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) if merge_lists => {
            let mut merged = base_seq.clone();
            for element in overlay_seq {
                if !merged.contains(element) {
                    merged.push(element.clone());
                }
            }
            Ok(Value::Sequence(merged))
        }
        (Value::Mapping(_), other) | (other, Value::Mapping(_)) => Err(MergeError {
            key: parent_key.unwrap_or("").to_string(),
            expected: "mapping",
            found: other.kind(),
        }),
        (Value::Sequence(_), other) | (other, Value::Sequence(_)) if merge_lists => {
            Err(MergeError {
                key: parent_key.unwrap_or("").to_string(),
                expected: "sequence",
                found: other.kind(),
            })
        }
        (_, overlay_value) => Ok(overlay_value.clone()),
    }
}
