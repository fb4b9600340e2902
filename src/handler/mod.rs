//! Request handlers shared by the HTTP and TFTP servers.
//!
//! Handlers are registered per protocol in an ordered list. For every
//! incoming request the servers offer the request to each handler in
//! declared order; the first handler that claims it owns it, with no
//! fallback to later handlers.

pub mod file;
pub mod sqlite_update;


pub use file::{FileHandlerConfig, HttpFileHandler, TftpFileHandler};
pub use sqlite_update::{HttpSqliteUpdateHandler, SqliteUpdateConfig, UpdateAction};

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use http::{HeaderMap, Method, StatusCode};
use ipnet::IpNet;
use percent_encoding::percent_decode_str;
use thiserror::Error;

use crate::data::Value;

/// Error raised by a request handler.
///
/// Variants map onto protocol responses: HTTP status codes on one side,
/// TFTP error codes on the other.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The requested file or system does not exist (404, TFTP error 1).
    #[error("Not found")]
    NotFound,

    /// The client address failed the access check (403, TFTP error 2).
    #[error("Access denied")]
    AccessDenied,

    /// The request was malformed (400).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The HTTP method is not supported by this handler (405).
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Anything else (500, TFTP error 0).
    #[error("{0}")]
    Internal(String),
}

/// An HTTP request as seen by a handler.
#[derive(Debug)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Raw request target, still percent-encoded.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Peer address of the connection.
    pub client_address: SocketAddr,
    /// Local address of the connection.
    pub server_address: SocketAddr,
    /// Request body; empty unless the client sent one.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Serializes the request metadata for template contexts.
    #[must_use]
    pub fn request_info(&self) -> serde_json::Value {
        let headers: serde_json::Map<String, serde_json::Value> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    serde_json::Value::String(
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    ),
                )
            })
            .collect();
        serde_json::json!({
            "protocol": "http",
            "method": self.method.as_str(),
            "uri": self.uri,
            "headers": headers,
            "client_address": self.client_address.to_string(),
            "server_address": self.server_address.to_string(),
        })
    }
}

/// Body of an HTTP response.
#[derive(Debug)]
pub enum ResponseBody {
    /// No body.
    Empty,
    /// An in-memory buffer (templated output, error pages).
    Bytes(Vec<u8>),
    /// A file streamed from disk with a known length.
    File {
        /// Path of the file to stream.
        path: PathBuf,
        /// File size, used for `Content-Length`.
        length: u64,
    },
}

/// An HTTP response produced by a handler.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code.
    pub status: StatusCode,
    /// `Content-Type` header value, if any.
    pub content_type: Option<String>,
    /// Response body.
    pub body: ResponseBody,
}

impl HttpResponse {
    /// A response with no body.
    #[must_use]
    pub const fn empty(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: ResponseBody::Empty,
        }
    }
}

/// Content produced by a TFTP handler.
#[derive(Debug)]
pub enum TftpContent {
    /// An in-memory buffer (templated output).
    Bytes(Vec<u8>),
    /// A file streamed from disk.
    File {
        /// Path of the file to stream.
        path: PathBuf,
        /// File size, reported through the `tsize` option.
        length: u64,
    },
}

/// A handler serving HTTP requests.
pub trait HttpHandler: Send + Sync {
    /// Tells whether this handler claims the given request target.
    fn can_handle(&self, uri: &str) -> bool;

    /// Handles a claimed request.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`]; the server maps it to a status code.
    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, HandlerError>;
}

/// A handler serving TFTP read requests.
pub trait TftpHandler: Send + Sync {
    /// Tells whether this handler claims the given file name.
    fn can_handle(&self, filename: &str) -> bool;

    /// Handles a claimed read request.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`]; the server maps it to a TFTP error code.
    fn handle(
        &self,
        filename: &str,
        client_address: SocketAddr,
        server_address: SocketAddr,
    ) -> Result<TftpContent, HandlerError>;
}

/// Decodes and sanitizes a request target into a clean path.
///
/// Strips the query string, percent-decodes, and rejects null bytes and
/// backslashes. Returns `None` for paths no handler should ever match.
#[must_use]
pub fn decode_request_path(uri: &str) -> Option<String> {
    let path = uri.split('?').next().unwrap_or(uri);
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return None;
    }
    Some(decoded.into_owned())
}

/// A compiled `request_path` pattern.
///
/// The configured path is a prefix that may end in a `...` placeholder
/// segment marking the spot of the lookup value. Matching splits a request
/// path into the lookup value (if a placeholder is configured) and the
/// remaining subpath.
#[derive(Debug)]
pub struct RequestPath {
    prefix_segments: Vec<String>,
    has_placeholder: bool,
}

/// Result of matching a request path.
#[derive(Debug, PartialEq, Eq)]
pub struct PathMatch {
    /// Raw lookup value extracted from the placeholder segment.
    pub lookup_value: Option<String>,
    /// Path remainder after the prefix (and placeholder), without a
    /// leading slash.
    pub subpath: String,
}

impl RequestPath {
    /// Compiles a configured request path.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the path does not start
    /// with `/`, ends with `/`, or uses the placeholder anywhere but in
    /// the final segment.
    pub fn parse(request_path: &str) -> Result<Self, String> {
        if !request_path.starts_with('/') {
            return Err(format!(
                "Invalid request path \"{request_path}\": must start with \"/\""
            ));
        }
        if request_path.len() > 1 && request_path.ends_with('/') {
            return Err(format!(
                "Invalid request path \"{request_path}\": must not end with \"/\""
            ));
        }
        let mut segments: Vec<String> = request_path
            .split('/')
            .map(str::to_string)
            .collect();
        // The placeholder may be spelled "..." or with the single
        // ellipsis character.
        let is_placeholder = |segment: &str| segment == "..." || segment == "\u{2026}";
        let has_placeholder = segments.last().is_some_and(|last| is_placeholder(last));
        if has_placeholder {
            segments.pop();
        }
        if segments.iter().any(|segment| is_placeholder(segment)) {
            return Err(format!(
                "Invalid request path \"{request_path}\": the placeholder must be the \
                 final segment"
            ));
        }
        // "/" splits into two empty segments; keep only the leading one so
        // that everything past the root becomes the subpath.
        if request_path == "/" {
            segments.pop();
        }
        Ok(Self {
            prefix_segments: segments,
            has_placeholder,
        })
    }

    /// Returns `true` if the path carries a lookup-value placeholder.
    #[must_use]
    pub const fn has_placeholder(&self) -> bool {
        self.has_placeholder
    }

    /// Matches a decoded request path against this pattern.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<PathMatch> {
        let mut segments = path.split('/');
        for expected in &self.prefix_segments {
            if segments.next()? != expected {
                return None;
            }
        }
        let lookup_value = if self.has_placeholder {
            let value = segments.next()?;
            if value.is_empty() {
                return None;
            }
            Some(value.to_string())
        } else {
            None
        };
        let subpath = segments.collect::<Vec<_>>().join("/");
        Some(PathMatch {
            lookup_value,
            subpath,
        })
    }
}

/// Checks a client address against a list of allowed addresses.
///
/// Every entry is either a single IP address (exact match after
/// normalization) or a subnet in `addr/len` form (membership test).
/// Entries that do not parse as either never match. An IPv4-mapped IPv6
/// client address is compared as the plain IPv4 address.
#[must_use]
pub fn client_address_allowed(allowed: &[String], client: IpAddr) -> bool {
    let client = unwrap_mapped(client);
    allowed.iter().any(|entry| {
        if entry.contains('/') {
            entry
                .parse::<IpNet>()
                .is_ok_and(|net| net.contains(&client))
        } else {
            entry
                .parse::<IpAddr>()
                .is_ok_and(|addr| unwrap_mapped(addr) == client)
        }
    })
}

/// Collects the allowed client addresses from the system data and the
/// static list.
///
/// The union of both is used: either source matching admits the client.
#[must_use]
pub fn allowed_addresses(
    data: Option<&Value>,
    client_address_key: Option<&str>,
    client_address_list: &[String],
) -> Option<Vec<String>> {
    let mut allowed: Option<Vec<String>> = None;
    if let Some(key) = client_address_key {
        let mut from_data = Vec::new();
        if let Some(value) = data.and_then(|data| data.lookup(key)) {
            match value {
                Value::Sequence(entries) => {
                    from_data.extend(entries.iter().map(Value::to_plain_string));
                }
                other => from_data.push(other.to_plain_string()),
            }
        }
        allowed = Some(from_data);
    }
    if !client_address_list.is_empty() {
        allowed
            .get_or_insert_with(Vec::new)
            .extend(client_address_list.iter().cloned());
    }
    allowed
}

fn unwrap_mapped(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}
