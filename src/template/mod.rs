//! Template engine abstraction and the bundled Handlebars engine.
//!
//! Vinegar consumes template engines through the narrow [`TemplateEngine`]
//! interface; the engine behind it is pluggable. The bundled engine renders
//! Handlebars templates from files, caches compiled templates, and
//! invalidates them when the backing file changes on disk.
//!
//! Templates receive the context objects `id` (the system ID), `data` (the
//! merged data tree), and `request_info`. `id` and `data` are absent, not
//! null, when the request did not identify a system; templates must tolerate
//! that (`{{#if data}}...{{/if}}`).
//!
//! The bundled engine additionally provides the helpers:
//!
//! * `transform`: calls a registry transform by name:
//!   `{{transform "mac_address.normalize" value}}`,
//! * `to_yaml` / `to_json`: serialize a value so that it round-trips
//!   through the corresponding parser,
//! * `raise`: fails rendering with the given message.

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use handlebars::{
    Context as HbContext, Handlebars, Helper, HelperDef, RenderContext, RenderError,
    RenderErrorReason, ScopedJson,
};
use serde::Deserialize;
use thiserror::Error;

use crate::data::{version_for_file, Value, Version};
use crate::transform;

/// Error raised by a template engine.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template file does not exist.
    #[error("Template {} not found", path.display())]
    NotFound {
        /// Path of the missing template.
        path: PathBuf,
    },

    /// The template file could not be read.
    #[error("Failed to read template {}: {source}", path.display())]
    Io {
        /// Path of the unreadable template.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Compiling or rendering the template failed.
    #[error("Error rendering template {}: {message}", path.display())]
    Render {
        /// Path of the failing template.
        path: PathBuf,
        /// Engine-reported location and cause.
        message: String,
    },

    /// The configuration names an engine this build does not provide.
    #[error("Unknown template engine \"{0}\"")]
    UnknownEngine(String),
}

/// Context passed to a template rendering.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// System ID, when the request identified a system.
    pub id: Option<String>,
    /// Merged data tree, when the request identified a system.
    pub data: Option<Value>,
    /// Protocol-specific request information.
    pub request_info: Option<serde_json::Value>,
}

impl Context {
    /// Serializes the context, leaving unset objects out entirely.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(id) = &self.id {
            map.insert("id".to_string(), serde_json::Value::String(id.clone()));
        }
        if let Some(data) = &self.data {
            map.insert("data".to_string(), serde_json::Value::from(data));
        }
        if let Some(request_info) = &self.request_info {
            map.insert("request_info".to_string(), request_info.clone());
        }
        serde_json::Value::Object(map)
    }
}

/// A template engine.
///
/// Engines are thread safe and shared between request workers.
pub trait TemplateEngine: Send + Sync {
    /// Renders the template at `path` with the given context.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NotFound`] for a missing template file and
    /// [`TemplateError::Render`] for compile or render failures.
    fn render(&self, path: &Path, context: &Context) -> Result<Vec<u8>, TemplateError>;

    /// Returns the files this template depends on, for reload detection.
    fn resolve_dependencies(&self, path: &Path) -> Vec<PathBuf>;
}

/// Configuration of the bundled engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory whose files are registered as partials under their file
    /// stem, so templates can include them with `{{> name}}`.
    #[serde(default)]
    pub partials_dir: Option<PathBuf>,
}

/// Creates an engine by name.
///
/// `handlebars` is the only bundled engine.
///
/// # Errors
///
/// Returns [`TemplateError::UnknownEngine`] for any other name.
pub fn create_engine(
    name: &str,
    config: &EngineConfig,
) -> Result<Arc<dyn TemplateEngine>, TemplateError> {
    match name {
        "handlebars" => Ok(Arc::new(HandlebarsEngine::new(config.clone()))),
        other => Err(TemplateError::UnknownEngine(other.to_string())),
    }
}

/// The bundled Handlebars engine.
pub struct HandlebarsEngine {
    registry: RwLock<Handlebars<'static>>,
    versions: Mutex<HashMap<PathBuf, Version>>,
    partials_dir: Option<PathBuf>,
}

impl HandlebarsEngine {
    /// Creates an engine with the Vinegar helpers registered.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut registry = Handlebars::new();
        // Rendered artifacts are boot-loader configs and installer files,
        // not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("transform", Box::new(TransformHelper));
        registry.register_helper("to_yaml", Box::new(ToYamlHelper));
        registry.register_helper("to_json", Box::new(ToJsonHelper));
        registry.register_helper("raise", Box::new(RaiseHelper));
        Self {
            registry: RwLock::new(registry),
            versions: Mutex::new(HashMap::new()),
            partials_dir: config.partials_dir,
        }
    }

    /// Registers `path` (and the partials directory) if new or changed.
    fn ensure_registered(&self, path: &Path) -> Result<(), TemplateError> {
        if let Some(partials_dir) = &self.partials_dir {
            for partial in partial_files(partials_dir) {
                let name = partial
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                self.register_if_changed(&partial, &name)?;
            }
        }
        self.register_if_changed(path, &template_name(path))
    }

    fn register_if_changed(&self, path: &Path, name: &str) -> Result<(), TemplateError> {
        let current_version = version_for_file(path);
        {
            let versions = self.lock_versions();
            if versions.get(path) == Some(&current_version) {
                return Ok(());
            }
        }
        if !path.is_file() {
            return Err(TemplateError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        registry
            .register_template_string(name, content)
            .map_err(|err| TemplateError::Render {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        self.lock_versions().insert(path.to_path_buf(), current_version);
        Ok(())
    }

    fn lock_versions(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Version>> {
        self.versions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn render(&self, path: &Path, context: &Context) -> Result<Vec<u8>, TemplateError> {
        self.ensure_registered(path)?;
        let registry = self
            .registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let rendered = registry
            .render(&template_name(path), &context.to_json())
            .map_err(|err| TemplateError::Render {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(rendered.into_bytes())
    }

    fn resolve_dependencies(&self, path: &Path) -> Vec<PathBuf> {
        let mut dependencies = vec![path.to_path_buf()];
        if let Some(partials_dir) = &self.partials_dir {
            dependencies.extend(partial_files(partials_dir));
        }
        dependencies
    }
}

fn template_name(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn partial_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

fn helper_param<'rc>(
    helper: &Helper<'rc>,
    index: usize,
    name: &str,
) -> Result<serde_json::Value, RenderError> {
    helper
        .param(index)
        .map(|param| param.value().clone())
        .ok_or_else(|| {
            RenderErrorReason::Other(format!("{name}: missing argument {index}")).into()
        })
}

/// `{{transform "name" value args...}}`: applies a registry transform.
struct TransformHelper;

impl HelperDef for TransformHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        helper: &Helper<'rc>,
        _registry: &'reg Handlebars<'reg>,
        _context: &'rc HbContext,
        _render_context: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let name = helper_param(helper, 0, "transform")?;
        let name = name.as_str().ok_or_else(|| {
            RenderError::from(RenderErrorReason::Other(
                "transform: the first argument must be the transform name".to_string(),
            ))
        })?;
        let value = Value::from(helper_param(helper, 1, "transform")?);
        let args: Vec<Value> = helper
            .params()
            .iter()
            .skip(2)
            .map(|param| Value::from(param.value().clone()))
            .collect();
        let result = transform::apply_by_name(name, &value, &transform::positional_args(args))
            .map_err(|err| {
                RenderError::from(RenderErrorReason::Other(format!("transform: {err}")))
            })?;
        Ok(ScopedJson::Derived(serde_json::Value::from(&result)))
    }
}

/// `{{to_yaml value}}`: serializes a value as YAML.
struct ToYamlHelper;

impl HelperDef for ToYamlHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        helper: &Helper<'rc>,
        _registry: &'reg Handlebars<'reg>,
        _context: &'rc HbContext,
        _render_context: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let value = helper_param(helper, 0, "to_yaml")?;
        let yaml = serde_yaml::to_string(&value).map_err(|err| {
            RenderError::from(RenderErrorReason::Other(format!("to_yaml: {err}")))
        })?;
        Ok(ScopedJson::Derived(serde_json::Value::String(yaml)))
    }
}

/// `{{to_json value}}`: serializes a value as JSON.
struct ToJsonHelper;

impl HelperDef for ToJsonHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        helper: &Helper<'rc>,
        _registry: &'reg Handlebars<'reg>,
        _context: &'rc HbContext,
        _render_context: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let value = helper_param(helper, 0, "to_json")?;
        Ok(ScopedJson::Derived(serde_json::Value::String(
            value.to_string(),
        )))
    }
}

/// `{{raise "message"}}`: fails rendering with the given message.
struct RaiseHelper;

impl HelperDef for RaiseHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        helper: &Helper<'rc>,
        _registry: &'reg Handlebars<'reg>,
        _context: &'rc HbContext,
        _render_context: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let message = helper
            .param(0)
            .map(|param| param.value().as_str().map_or_else(
                || param.value().to_string(),
                str::to_string,
            ))
            .unwrap_or_else(|| "template raised an error".to_string());
        Err(RenderErrorReason::Other(message).into())
    }
}
