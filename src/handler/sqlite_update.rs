//! Request handler applying updates to the SQLite state store.
//!
//! The typical use is a per-system flag that controls whether the system
//! boots into an installer. Once the installation finishes, the installed
//! system makes a single POST request to this handler and the flag is
//! cleared, so the next boot goes to the local disk.
//!
//! The request path has the form `<prefix>/<system-id>`; the system ID is
//! used both for access control and as the row key. Only POST is allowed:
//! every action changes state.

#[cfg(test)]
#[path = "sqlite_update_tests.rs"]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Deserialize;

use crate::data::Value;
use crate::source::{DataSource, DataStore, SourceBuildError};

use super::{
    allowed_addresses, client_address_allowed, decode_request_path, HandlerError,
    HttpHandler, HttpRequest, HttpResponse,
};

/// Action applied to the store when the handler triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// Delete every key stored for the system.
    DeleteData,
    /// Delete only the configured key.
    DeleteValue,
    /// Set the configured key to the configured value.
    SetValue,
    /// Set the configured key to the request body parsed as JSON.
    SetJsonValueFromRequestBody,
    /// Set the configured key to the request body as text.
    SetTextValueFromRequestBody,
}

/// Configuration of the SQLite update handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteUpdateConfig {
    /// Path prefix claimed by this handler; the remainder of the path is
    /// the system ID.
    pub request_path: String,
    /// Path of the SQLite database file.
    pub db_file: PathBuf,
    /// Action to apply.
    pub action: UpdateAction,
    /// Key the action works on; required for everything but `delete_data`.
    #[serde(default)]
    pub key: Option<String>,
    /// Value stored by `set_value`.
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
    /// Key into the system data holding the allowed client address(es).
    #[serde(default)]
    pub client_address_key: Option<String>,
    /// Static list of allowed client addresses or subnets.
    #[serde(default)]
    pub client_address_list: Vec<String>,
}

/// HTTP handler applying updates to the SQLite state store.
pub struct HttpSqliteUpdateHandler {
    request_prefix: String,
    store: Arc<DataStore>,
    action: UpdateAction,
    key: Option<String>,
    value: Option<Value>,
    data_source: Arc<dyn DataSource>,
    client_address_key: Option<String>,
    client_address_list: Vec<String>,
}

impl HttpSqliteUpdateHandler {
    /// Builds the handler and opens its store.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBuildError`] for inconsistent configuration or an
    /// unopenable database.
    pub fn new(
        config: &SqliteUpdateConfig,
        data_source: Arc<dyn DataSource>,
    ) -> Result<Self, SourceBuildError> {
        if !config.request_path.starts_with('/') {
            return Err(SourceBuildError::Invalid(format!(
                "Invalid request path \"{}\": must start with \"/\"",
                config.request_path
            )));
        }
        let needs_key = config.action != UpdateAction::DeleteData;
        if needs_key && config.key.is_none() {
            return Err(SourceBuildError::Invalid(format!(
                "Action {:?} requires the key option",
                config.action
            )));
        }
        if config.action == UpdateAction::SetValue && config.value.is_none() {
            return Err(SourceBuildError::Invalid(
                "Action set_value requires the value option".to_string(),
            ));
        }
        let mut request_prefix = config.request_path.clone();
        if !request_prefix.ends_with('/') {
            request_prefix.push('/');
        }
        Ok(Self {
            request_prefix,
            store: Arc::new(DataStore::open(&config.db_file)?),
            action: config.action,
            key: config.key.clone(),
            value: config.value.clone().map(Value::from),
            data_source,
            client_address_key: config.client_address_key.clone(),
            client_address_list: config.client_address_list.clone(),
        })
    }

    /// Extracts the system ID from a request target.
    fn system_id(&self, uri: &str) -> Option<String> {
        let path = decode_request_path(uri)?;
        let system_id = path.strip_prefix(&self.request_prefix)?;
        if system_id.is_empty() {
            return None;
        }
        Some(system_id.to_string())
    }

    fn check_access(&self, system_id: &str, client: &HttpRequest) -> Result<(), HandlerError> {
        let Some(address_key) = &self.client_address_key else {
            // Without an address key the static list alone decides, and an
            // empty list means unrestricted access.
            if self.client_address_list.is_empty() {
                return Ok(());
            }
            if client_address_allowed(&self.client_address_list, client.client_address.ip()) {
                return Ok(());
            }
            return Err(HandlerError::AccessDenied);
        };
        let (data, _) = self
            .data_source
            .get_data(system_id, &Value::empty_mapping(), 0)
            .map_err(|err| HandlerError::Internal(err.to_string()))?;
        let allowed = allowed_addresses(
            Some(&data),
            Some(address_key.as_str()),
            &self.client_address_list,
        )
        .unwrap_or_default();
        // A system without a stored client address cannot be authorized at
        // all; report it as unknown rather than forbidden.
        if allowed.is_empty() {
            return Err(HandlerError::NotFound);
        }
        if client_address_allowed(&allowed, client.client_address.ip()) {
            Ok(())
        } else {
            Err(HandlerError::AccessDenied)
        }
    }

    fn apply(&self, system_id: &str, request: &HttpRequest) -> Result<(), HandlerError> {
        let key = self.key.as_deref();
        let result = match self.action {
            UpdateAction::DeleteData => self.store.delete_data(system_id),
            UpdateAction::DeleteValue => {
                self.store
                    .delete_value(system_id, key.expect("key checked at build time"))
            }
            UpdateAction::SetValue => self.store.set_value(
                system_id,
                key.expect("key checked at build time"),
                self.value.as_ref().expect("value checked at build time"),
            ),
            UpdateAction::SetJsonValueFromRequestBody => {
                let json: serde_json::Value = serde_json::from_slice(&request.body)
                    .map_err(|err| {
                        HandlerError::BadRequest(format!("request body is not valid JSON: {err}"))
                    })?;
                self.store.set_value(
                    system_id,
                    key.expect("key checked at build time"),
                    &Value::from(json),
                )
            }
            UpdateAction::SetTextValueFromRequestBody => {
                let text = String::from_utf8(request.body.clone()).map_err(|_| {
                    HandlerError::BadRequest("request body is not valid UTF-8".to_string())
                })?;
                self.store.set_value(
                    system_id,
                    key.expect("key checked at build time"),
                    &Value::String(text),
                )
            }
        };
        result.map_err(|err| HandlerError::Internal(err.to_string()))
    }
}

impl HttpHandler for HttpSqliteUpdateHandler {
    fn can_handle(&self, uri: &str) -> bool {
        self.system_id(uri).is_some()
    }

    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, HandlerError> {
        if request.method != Method::POST {
            return Err(HandlerError::MethodNotAllowed);
        }
        let system_id = self
            .system_id(&request.uri)
            .ok_or(HandlerError::NotFound)?;
        self.check_access(&system_id, request)?;
        self.apply(&system_id, request)?;
        Ok(HttpResponse::empty(StatusCode::NO_CONTENT))
    }
}
