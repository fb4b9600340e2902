//! Request handler serving files from a directory tree.
//!
//! The handler claims requests under a configured path prefix, optionally
//! extracts a *lookup value* from a placeholder segment, resolves it to a
//! system ID through the composite data source (or uses it as the ID
//! directly with the `:system_id:` sentinel), and serves the addressed file
//! either verbatim or rendered through a template engine with the system's
//! merged data tree in scope.

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use http::StatusCode;
use serde::Deserialize;

use crate::data::Value;
use crate::source::{DataSource, SourceBuildError};
use crate::template::{create_engine, Context, EngineConfig, TemplateEngine, TemplateError};
use crate::transform::{ChainSpec, TransformChain};

use super::{
    allowed_addresses, client_address_allowed, decode_request_path, HandlerError,
    HttpHandler, HttpRequest, HttpResponse, RequestPath, ResponseBody, TftpContent,
    TftpHandler,
};

/// Sentinel for `lookup_key` marking the lookup value as the system ID.
pub const SYSTEM_ID_KEY: &str = ":system_id:";

/// What to do when the data source fails during a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceErrorAction {
    /// Fail the request with an internal error.
    #[default]
    Fail,
    /// Log a warning and continue as if no system had been found.
    Warn,
    /// Continue silently as if no system had been found.
    Continue,
}

/// What to do when no system ID can be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupNoResultAction {
    /// Respond with "not found".
    #[default]
    Fail,
    /// Proceed with both `id` and `data` absent.
    Continue,
}

/// Configuration of the file request handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHandlerConfig {
    /// Path prefix claimed by this handler; may end in a `...` placeholder
    /// segment holding the lookup value.
    pub request_path: String,
    /// Directory the served files live in.
    pub root_dir: PathBuf,
    /// Key passed to the reverse lookup, or [`SYSTEM_ID_KEY`].
    #[serde(default)]
    pub lookup_key: Option<String>,
    /// Transform chain applied to the raw lookup value.
    #[serde(default)]
    pub lookup_value_transform: ChainSpec,
    /// Template engine used to render the files; unset serves them
    /// verbatim.
    #[serde(default)]
    pub template: Option<String>,
    /// Configuration passed to the template engine.
    #[serde(default)]
    pub template_config: EngineConfig,
    /// How to react when the data source fails.
    #[serde(default)]
    pub data_source_error_action: DataSourceErrorAction,
    /// How to react when no system is found.
    #[serde(default)]
    pub lookup_no_result_action: LookupNoResultAction,
    /// Key into the system data holding the allowed client address(es).
    #[serde(default)]
    pub client_address_key: Option<String>,
    /// Static list of allowed client addresses or subnets.
    #[serde(default)]
    pub client_address_list: Vec<String>,
    /// Suffix appended to the file path derived from the request.
    #[serde(default)]
    pub file_suffix: Option<String>,
    /// `Content-Type` sent for served files (HTTP flavour only).
    #[serde(default)]
    pub content_type: Option<String>,
    /// Per-filename or per-extension `Content-Type` overrides (HTTP
    /// flavour only).
    #[serde(default)]
    pub content_type_map: BTreeMap<String, String>,
}

/// Output of the protocol-independent core.
enum FileOutput {
    /// Serve the file at the path verbatim.
    Stream { path: PathBuf, length: u64 },
    /// Serve rendered bytes originating from the path.
    Rendered { path: PathBuf, bytes: Vec<u8> },
}

/// Protocol-independent part of the file handler.
struct FileHandlerCore {
    request_path: RequestPath,
    root_dir: PathBuf,
    lookup_key: Option<String>,
    lookup_value_transform: TransformChain,
    engine: Option<Arc<dyn TemplateEngine>>,
    data_source: Arc<dyn DataSource>,
    data_source_error_action: DataSourceErrorAction,
    lookup_no_result_action: LookupNoResultAction,
    client_address_key: Option<String>,
    client_address_list: Vec<String>,
    file_suffix: Option<String>,
}

impl FileHandlerCore {
    fn new(
        config: &FileHandlerConfig,
        data_source: Arc<dyn DataSource>,
    ) -> Result<Self, SourceBuildError> {
        let request_path =
            RequestPath::parse(&config.request_path).map_err(SourceBuildError::Invalid)?;
        if config.lookup_key.is_some() && !request_path.has_placeholder() {
            return Err(SourceBuildError::Invalid(format!(
                "Request path \"{}\" needs a \"...\" placeholder because lookup_key is set",
                config.request_path
            )));
        }
        if config.lookup_key.is_none() && request_path.has_placeholder() {
            return Err(SourceBuildError::Invalid(format!(
                "Request path \"{}\" has a placeholder but no lookup_key is set",
                config.request_path
            )));
        }
        if config.client_address_key.is_some() && config.lookup_key.is_none() {
            return Err(SourceBuildError::Invalid(
                "client_address_key requires lookup_key".to_string(),
            ));
        }
        let engine = config
            .template
            .as_deref()
            .map(|name| create_engine(name, &config.template_config))
            .transpose()?;
        Ok(Self {
            request_path,
            root_dir: config.root_dir.clone(),
            lookup_key: config.lookup_key.clone(),
            lookup_value_transform: TransformChain::from_spec(&config.lookup_value_transform)?,
            engine,
            data_source,
            data_source_error_action: config.data_source_error_action,
            lookup_no_result_action: config.lookup_no_result_action,
            client_address_key: config.client_address_key.clone(),
            client_address_list: config.client_address_list.clone(),
            file_suffix: config.file_suffix.clone(),
        })
    }

    fn can_handle(&self, uri: &str) -> bool {
        decode_request_path(uri)
            .and_then(|path| self.request_path.match_path(&path))
            // A file handler needs a subpath naming the file to serve.
            .is_some_and(|matched| !matched.subpath.is_empty())
    }

    /// Resolves the system ID and its data tree for a request.
    ///
    /// Returns `(None, None)` when the handler is configured without a
    /// lookup or when the lookup found nothing and the configuration says
    /// to continue.
    fn resolve_system(
        &self,
        lookup_value: Option<&str>,
    ) -> Result<(Option<String>, Option<Value>), HandlerError> {
        let (Some(lookup_key), Some(raw_value)) = (&self.lookup_key, lookup_value) else {
            return Ok((None, None));
        };
        let transformed = self
            .lookup_value_transform
            .apply(Value::String(raw_value.to_string()))
            .map_err(|err| {
                // A value the transform rejects cannot name any system.
                tracing::debug!("Lookup value \"{raw_value}\" failed to normalize: {err}");
                HandlerError::NotFound
            });
        let system_id = if lookup_key.as_str() == SYSTEM_ID_KEY {
            Some(transformed?.to_plain_string())
        } else {
            let transformed = transformed?;
            match self.data_source.find_system(lookup_key, &transformed) {
                Ok(found) => found,
                Err(err) => match self.data_source_error_action {
                    DataSourceErrorAction::Fail => {
                        return Err(HandlerError::Internal(err.to_string()))
                    }
                    DataSourceErrorAction::Warn => {
                        tracing::warn!(
                            "find_system(\"{lookup_key}\", \"{transformed}\") failed; \
                             treating as an unresolved lookup: {err}"
                        );
                        None
                    }
                    DataSourceErrorAction::Continue => None,
                },
            }
        };
        let Some(system_id) = system_id else {
            return Ok((None, None));
        };
        // Without a template and without address checks the data tree
        // would never be read, so skip assembling it.
        if self.engine.is_none() && self.client_address_key.is_none() {
            return Ok((Some(system_id), None));
        }
        let data = match self
            .data_source
            .get_data(&system_id, &Value::empty_mapping(), 0)
        {
            Ok((data, _)) => Some(data),
            Err(err) => match self.data_source_error_action {
                DataSourceErrorAction::Fail => {
                    return Err(HandlerError::Internal(err.to_string()))
                }
                DataSourceErrorAction::Warn => {
                    tracing::warn!(
                        "get_data(\"{system_id}\") failed; continuing without system data: \
                         {err}"
                    );
                    None
                }
                DataSourceErrorAction::Continue => None,
            },
        };
        Ok((Some(system_id), data))
    }

    fn check_access(
        &self,
        system_id: Option<&str>,
        data: Option<&Value>,
        client: IpAddr,
    ) -> Result<(), HandlerError> {
        let effective_data = if system_id.is_some() { data } else { None };
        let allowed = allowed_addresses(
            effective_data,
            self.client_address_key.as_deref(),
            &self.client_address_list,
        );
        match allowed {
            None => Ok(()),
            Some(allowed) if client_address_allowed(&allowed, client) => Ok(()),
            Some(_) => Err(HandlerError::AccessDenied),
        }
    }

    /// Builds the on-disk path for a subpath, rejecting traversal.
    fn translate_path(&self, subpath: &str) -> Option<PathBuf> {
        if subpath.is_empty() || subpath.ends_with('/') {
            return None;
        }
        let with_suffix = match &self.file_suffix {
            Some(suffix) => format!("{subpath}{suffix}"),
            None => subpath.to_string(),
        };
        let relative = Path::new(&with_suffix);
        // Only plain name segments are allowed; "." and ".." never are.
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }
        let path = self.root_dir.join(relative);
        // The component check above keeps the path under root_dir; this
        // re-checks the invariant on the assembled path.
        path.starts_with(&self.root_dir).then_some(path)
    }

    fn handle(
        &self,
        uri: &str,
        client: IpAddr,
        request_info: serde_json::Value,
    ) -> Result<FileOutput, HandlerError> {
        let decoded = decode_request_path(uri).ok_or(HandlerError::NotFound)?;
        let matched = self
            .request_path
            .match_path(&decoded)
            .ok_or(HandlerError::NotFound)?;
        let (system_id, data) = self.resolve_system(matched.lookup_value.as_deref())?;

        if self.request_path.has_placeholder()
            && system_id.is_none()
            && self.lookup_no_result_action == LookupNoResultAction::Fail
        {
            return Err(HandlerError::NotFound);
        }

        self.check_access(system_id.as_deref(), data.as_ref(), client)?;

        let path = self
            .translate_path(&matched.subpath)
            .ok_or(HandlerError::NotFound)?;
        match &self.engine {
            None => {
                let metadata = std::fs::metadata(&path).map_err(|_| HandlerError::NotFound)?;
                if !metadata.is_file() {
                    return Err(HandlerError::NotFound);
                }
                Ok(FileOutput::Stream {
                    length: metadata.len(),
                    path,
                })
            }
            Some(engine) => {
                let context = Context {
                    id: system_id,
                    data,
                    request_info: Some(request_info),
                };
                match engine.render(&path, &context) {
                    Ok(bytes) => Ok(FileOutput::Rendered { path, bytes }),
                    Err(TemplateError::NotFound { .. }) => Err(HandlerError::NotFound),
                    Err(err) => Err(HandlerError::Internal(err.to_string())),
                }
            }
        }
    }
}

/// HTTP flavour of the file handler.
pub struct HttpFileHandler {
    core: FileHandlerCore,
    content_type: String,
    content_type_map: BTreeMap<String, String>,
}

impl HttpFileHandler {
    /// Builds the handler.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] for inconsistent configuration.
    pub fn new(
        config: &FileHandlerConfig,
        data_source: Arc<dyn DataSource>,
    ) -> Result<Self, SourceBuildError> {
        let content_type = config.content_type.clone().unwrap_or_else(|| {
            if config.template.is_some() {
                "text/plain; charset=UTF-8".to_string()
            } else {
                "application/octet-stream".to_string()
            }
        });
        Ok(Self {
            core: FileHandlerCore::new(config, data_source)?,
            content_type,
            content_type_map: config.content_type_map.clone(),
        })
    }

    fn content_type_for(&self, path: &Path) -> String {
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(content_type) = self.content_type_map.get(&basename) {
            return content_type.clone();
        }
        if let Some((_, extension)) = basename.rsplit_once('.') {
            if let Some(content_type) = self.content_type_map.get(&format!(".{extension}")) {
                return content_type.clone();
            }
        }
        self.content_type.clone()
    }
}

impl HttpHandler for HttpFileHandler {
    fn can_handle(&self, uri: &str) -> bool {
        self.core.can_handle(uri)
    }

    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, HandlerError> {
        if request.method != http::Method::GET && request.method != http::Method::HEAD {
            return Err(HandlerError::MethodNotAllowed);
        }
        let output = self.core.handle(
            &request.uri,
            request.client_address.ip(),
            request.request_info(),
        )?;
        let (path, body) = match output {
            FileOutput::Stream { path, length } => {
                let body = ResponseBody::File {
                    path: path.clone(),
                    length,
                };
                (path, body)
            }
            FileOutput::Rendered { path, bytes } => (path, ResponseBody::Bytes(bytes)),
        };
        Ok(HttpResponse {
            status: StatusCode::OK,
            content_type: Some(self.content_type_for(&path)),
            body,
        })
    }
}

/// TFTP flavour of the file handler.
pub struct TftpFileHandler {
    core: FileHandlerCore,
}

impl TftpFileHandler {
    /// Builds the handler.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] for inconsistent configuration.
    pub fn new(
        config: &FileHandlerConfig,
        data_source: Arc<dyn DataSource>,
    ) -> Result<Self, SourceBuildError> {
        Ok(Self {
            core: FileHandlerCore::new(config, data_source)?,
        })
    }

    /// TFTP file names need not start with a slash; treat them as if they
    /// did.
    fn normalize(filename: &str) -> String {
        if filename.starts_with('/') {
            filename.to_string()
        } else {
            format!("/{filename}")
        }
    }
}

impl TftpHandler for TftpFileHandler {
    fn can_handle(&self, filename: &str) -> bool {
        self.core.can_handle(&Self::normalize(filename))
    }

    fn handle(
        &self,
        filename: &str,
        client_address: SocketAddr,
        server_address: SocketAddr,
    ) -> Result<TftpContent, HandlerError> {
        let filename = Self::normalize(filename);
        let request_info = serde_json::json!({
            "protocol": "tftp",
            "uri": filename,
            "client_address": client_address.to_string(),
            "server_address": server_address.to_string(),
        });
        match self
            .core
            .handle(&filename, client_address.ip(), request_info)?
        {
            FileOutput::Stream { path, length } => Ok(TftpContent::File { path, length }),
            FileOutput::Rendered { bytes, .. } => Ok(TftpContent::Bytes(bytes)),
        }
    }
}
