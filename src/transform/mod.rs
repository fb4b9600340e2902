//! Named pure transformation functions.
//!
//! Transforms operate on a single [`Value`] and are composable as chains. A
//! chain is declared in configuration as a sequence where each element is
//! either a bare function name (`string.to_lower`) or a single-entry mapping
//! from the function name to its arguments (`string.add_suffix: .example.com`).
//! Arguments given as a mapping are passed by name, a sequence is passed
//! positionally, and any other value is passed as the single positional
//! argument.
//!
//! The registry of known functions is populated once at startup and is
//! read-only afterwards.

mod ip_address;
mod mac_address;
mod string;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::Deserialize;
use thiserror::Error;

use crate::data::Value;

/// A transformation function.
///
/// Takes the incoming value and the arguments declared in the chain and
/// returns the next value. Transforms are side-effect free and
/// deterministic.
pub type TransformFn = fn(&Value, &TransformArgs) -> Result<Value, TransformError>;

/// Error raised while applying a transform.
#[derive(Debug, Error)]
pub enum TransformError {
    /// An argument had the wrong kind (e.g. a mapping where a string was
    /// expected).
    #[error("Transform argument \"{name}\" must be a {expected}, got a {found}")]
    ArgumentKind {
        /// Name of the offending argument.
        name: &'static str,
        /// Expected kind.
        expected: &'static str,
        /// Kind that was actually passed.
        found: &'static str,
    },

    /// The input value had the wrong kind for this transform.
    #[error("Transform input must be a {expected}, got a {found}")]
    InputKind {
        /// Expected kind.
        expected: &'static str,
        /// Kind of the actual input.
        found: &'static str,
    },

    /// The input value was of the right kind but malformed.
    #[error("{0}")]
    Value(String),
}

/// Error raised while building a transform chain from configuration.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The chain references a function that is not in the registry.
    #[error("Unknown transform function \"{0}\"")]
    UnknownFunction(String),

    /// A chain entry was neither a name nor a single-entry mapping.
    #[error("A transform chain entry must be a function name or a single-entry mapping")]
    MalformedStep,
}

/// One element of a transform chain as it appears in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChainStep {
    /// A bare function name.
    Name(String),
    /// A function name mapped to its arguments.
    WithArgs(BTreeMap<String, serde_yaml::Value>),
}

/// Chain specification as it appears in configuration.
pub type ChainSpec = Vec<ChainStep>;

/// Arguments passed to a transform function.
#[derive(Debug, Clone, Default)]
pub struct TransformArgs {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl TransformArgs {
    /// Returns the argument at the given position or name, if present.
    #[must_use]
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.named.get(name))
    }

    /// Returns a string argument.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::ArgumentKind`] if the argument is present
    /// but not a string.
    pub fn str_arg(
        &self,
        index: usize,
        name: &'static str,
    ) -> Result<Option<&str>, TransformError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(TransformError::ArgumentKind {
                name,
                expected: "string",
                found: other.kind(),
            }),
        }
    }

    /// Returns an integer argument.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::ArgumentKind`] if the argument is present
    /// but not an integer.
    pub fn int_arg(
        &self,
        index: usize,
        name: &'static str,
    ) -> Result<Option<i64>, TransformError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(TransformError::ArgumentKind {
                name,
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    fn from_config(config: serde_yaml::Value) -> Self {
        match config {
            serde_yaml::Value::Mapping(map) => Self {
                positional: Vec::new(),
                named: map
                    .into_iter()
                    .map(|(k, v)| {
                        let key = match k {
                            serde_yaml::Value::String(s) => s,
                            other => Value::from(other).to_plain_string(),
                        };
                        (key, Value::from(v))
                    })
                    .collect(),
            },
            serde_yaml::Value::Sequence(seq) => Self {
                positional: seq.into_iter().map(Value::from).collect(),
                named: BTreeMap::new(),
            },
            serde_yaml::Value::Null => Self::default(),
            other => Self {
                positional: vec![Value::from(other)],
                named: BTreeMap::new(),
            },
        }
    }
}

/// The process-wide transform registry.
pub struct TransformRegistry {
    functions: HashMap<&'static str, TransformFn>,
}

impl TransformRegistry {
    fn with_builtins() -> Self {
        let mut functions: HashMap<&'static str, TransformFn> = HashMap::new();
        functions.insert("string.to_lower", string::to_lower);
        functions.insert("string.to_upper", string::to_upper);
        functions.insert("string.to_str", string::to_str);
        functions.insert("string.add_prefix", string::add_prefix);
        functions.insert("string.add_suffix", string::add_suffix);
        functions.insert("string.remove_prefix", string::remove_prefix);
        functions.insert("string.remove_suffix", string::remove_suffix);
        functions.insert("string.split", string::split);
        functions.insert("mac_address.normalize", mac_address::normalize);
        functions.insert("ipv4_address.normalize", ip_address::normalize_ipv4);
        functions.insert("ipv4_address.strip_mask", ip_address::strip_mask_ipv4);
        functions.insert("ipv4_address.net_address", ip_address::net_address_ipv4);
        functions.insert(
            "ipv4_address.broadcast_address",
            ip_address::broadcast_address_ipv4,
        );
        functions.insert("ip_address.normalize", ip_address::normalize);
        functions.insert("ip_address.network", ip_address::network);
        functions.insert("ip_address.host", ip_address::host);
        Self { functions }
    }

    /// Returns the function registered under the given dotted name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TransformFn> {
        self.functions.get(name).copied()
    }
}

/// Returns the process-wide transform registry.
#[must_use]
pub fn registry() -> &'static TransformRegistry {
    static REGISTRY: OnceLock<TransformRegistry> = OnceLock::new();
    REGISTRY.get_or_init(TransformRegistry::with_builtins)
}

/// A compiled transform chain.
///
/// Applies its functions left to right; each step replaces the value.
#[derive(Clone, Default)]
pub struct TransformChain {
    steps: Vec<(String, TransformFn, TransformArgs)>,
}

impl TransformChain {
    /// Builds a chain from its configuration form.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownFunction`] for names missing from the
    /// registry and [`ChainError::MalformedStep`] for mappings that do not
    /// have exactly one entry.
    pub fn from_spec(spec: &ChainSpec) -> Result<Self, ChainError> {
        let mut steps = Vec::with_capacity(spec.len());
        for step in spec {
            let (name, config) = match step {
                ChainStep::Name(name) => (name.clone(), serde_yaml::Value::Null),
                ChainStep::WithArgs(map) => {
                    if map.len() != 1 {
                        return Err(ChainError::MalformedStep);
                    }
                    let (name, config) = map.iter().next().expect("len checked above");
                    (name.clone(), config.clone())
                }
            };
            let function = registry()
                .get(&name)
                .ok_or_else(|| ChainError::UnknownFunction(name.clone()))?;
            let args = TransformArgs::from_config(config);
            steps.push((name, function, args));
        }
        Ok(Self { steps })
    }

    /// Applies the chain to a value.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step.
    pub fn apply(&self, value: Value) -> Result<Value, TransformError> {
        let mut current = value;
        for (_, function, args) in &self.steps {
            current = function(&current, args)?;
        }
        Ok(current)
    }

    /// Returns `true` if the chain has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|(name, _, _)| name))
            .finish()
    }
}

/// Applies a single transform by name.
///
/// This is the entry point used by the template layer's `transform` helper.
///
/// # Errors
///
/// Returns [`ChainError::UnknownFunction`] wrapped as a value error if the
/// name is unknown, or the transform's own error.
pub fn apply_by_name(
    name: &str,
    value: &Value,
    args: &TransformArgs,
) -> Result<Value, TransformError> {
    let function = registry()
        .get(name)
        .ok_or_else(|| TransformError::Value(format!("Unknown transform function \"{name}\"")))?;
    function(value, args)
}

/// Builds [`TransformArgs`] from already-parsed values.
///
/// Used by callers that do not go through the YAML configuration form, such
/// as template helpers.
#[must_use]
pub fn positional_args(values: Vec<Value>) -> TransformArgs {
    TransformArgs {
        positional: values,
        named: BTreeMap::new(),
    }
}

/// Returns the input as a string or fails with an input-kind error.
fn input_str(value: &Value) -> Result<&str, TransformError> {
    value.as_str().ok_or(TransformError::InputKind {
        expected: "string",
        found: value.kind(),
    })
}
