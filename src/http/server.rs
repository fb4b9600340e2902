//! HTTP/1.1 server dispatching to the handler pipeline.
//!
//! The server accepts GET, HEAD, and POST, offers every request to the
//! configured handlers in order, and streams the response of the first
//! handler that claims it. `Content-Length` is always emitted: file
//! responses carry the stat-ed size, buffer responses the buffer length.
//! Persistent connections follow RFC 7230; a failure while streaming a
//! response body closes the connection, since the response cannot be
//! completed correctly anymore.

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Duration};

use crate::handler::{HandlerError, HttpHandler, HttpRequest, ResponseBody};

use super::date::format_http_date;

/// Upper bound for the request line plus all headers.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// How long a connection may sit idle between requests.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long [`BoundHttpServer::run`] waits for in-flight responses after
/// the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration of the HTTP server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Port the listener binds to.
    pub bind_port: u16,
    /// Largest accepted request body in bytes.
    pub max_request_body_size: usize,
    /// Connections served concurrently; further connections queue in the
    /// accept backlog.
    pub max_concurrent_connections: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0_u16; 8]),
            bind_port: 80,
            max_request_body_size: 1024 * 1024,
            max_concurrent_connections: 128,
        }
    }
}

/// The HTTP server.
pub struct HttpServer {
    handlers: Vec<Arc<dyn HttpHandler>>,
    config: HttpServerConfig,
}

impl HttpServer {
    /// Creates a server over an ordered handler pipeline.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn HttpHandler>>, config: HttpServerConfig) -> Self {
        Self { handlers, config }
    }

    /// Binds the listener.
    ///
    /// Binding is separate from [`BoundHttpServer::run`] so that bind
    /// errors surface during startup.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(self) -> std::io::Result<BoundHttpServer> {
        let listener =
            TcpListener::bind((self.config.bind_address, self.config.bind_port)).await?;
        tracing::info!(
            "HTTP server is listening on {}",
            listener.local_addr().map_or_else(
                |_| self.config.bind_address.to_string(),
                |addr| addr.to_string()
            )
        );
        Ok(BoundHttpServer {
            listener,
            handlers: Arc::new(self.handlers),
            config: self.config,
        })
    }
}

/// An HTTP server with its listener bound.
pub struct BoundHttpServer {
    listener: TcpListener,
    handlers: Arc<Vec<Arc<dyn HttpHandler>>>,
    config: HttpServerConfig,
}

impl BoundHttpServer {
    /// Returns the bound address of the listener.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` flips to `true`, then waits a
    /// bounded grace period for in-flight responses.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_connections));
        loop {
            let accepted = tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                accepted = self.listener.accept() => accepted,
            };
            let (stream, client) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("Accepting an HTTP connection failed: {err}");
                    continue;
                }
            };
            let connection = Connection {
                handlers: Arc::clone(&self.handlers),
                config: self.config.clone(),
                client,
            };
            let limit_for_task = Arc::clone(&limit);
            let shutdown_for_task = shutdown.clone();
            tokio::spawn(async move {
                let Ok(_permit) = limit_for_task.acquire().await else {
                    return;
                };
                connection.serve(stream, shutdown_for_task).await;
            });
        }
        // All permits returned means all connection tasks finished.
        let all = u32::try_from(self.config.max_concurrent_connections).unwrap_or(u32::MAX);
        if timeout(SHUTDOWN_GRACE, limit.acquire_many(all)).await.is_err() {
            tracing::warn!("HTTP connections still open after the shutdown grace period");
        }
        tracing::info!("HTTP server has been shut down");
    }
}

/// A response that is ready to be written.
struct Outgoing {
    status: StatusCode,
    content_type: Option<String>,
    body: ResponseBody,
    last_modified: Option<String>,
}

impl Outgoing {
    fn from_status(status: StatusCode) -> Self {
        // A tiny text body keeps command-line clients from reporting an
        // empty reply.
        let message = format!(
            "{} {}\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        Self {
            status,
            content_type: Some("text/plain; charset=UTF-8".to_string()),
            body: ResponseBody::Bytes(message.into_bytes()),
            last_modified: None,
        }
    }
}

/// Error while reading a request head or body.
enum RequestError {
    /// The connection closed cleanly between requests.
    Closed,
    /// The connection idled past the keep-alive timeout.
    IdleTimeout,
    /// Transport failure.
    Io(std::io::Error),
    /// The request was malformed; respond with the status and close.
    Bad(StatusCode),
}

struct Connection {
    handlers: Arc<Vec<Arc<dyn HttpHandler>>>,
    config: HttpServerConfig,
    client: SocketAddr,
}

impl Connection {
    async fn serve(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let server_address = stream.local_addr().unwrap_or_else(|_| {
            (self.config.bind_address, self.config.bind_port).into()
        });
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let request = tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                request = self.read_request(&mut reader, server_address) => request,
            };
            let (request, keep_alive) = match request {
                Ok(request) => request,
                Err(RequestError::Closed | RequestError::IdleTimeout) => break,
                Err(RequestError::Io(err)) => {
                    tracing::debug!("HTTP connection from {} failed: {err}", self.client);
                    break;
                }
                Err(RequestError::Bad(status)) => {
                    let outgoing = Outgoing::from_status(status);
                    let _ = write_response(&mut write_half, &outgoing, false, &Method::GET)
                        .await;
                    break;
                }
            };
            let method = request.method.clone();
            let outgoing = self.dispatch(request).await;
            match write_response(&mut write_half, &outgoing, keep_alive, &method).await {
                Ok(()) => {}
                Err(err) => {
                    // The response may be half-written; the only safe
                    // recovery is dropping the connection.
                    tracing::debug!(
                        "Writing a response to {} failed mid-stream: {err}",
                        self.client
                    );
                    break;
                }
            }
            if !keep_alive {
                break;
            }
        }
    }

    /// Reads one request from the connection.
    async fn read_request(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        server_address: SocketAddr,
    ) -> Result<(HttpRequest, bool), RequestError> {
        let request_line = match timeout(IDLE_TIMEOUT, read_head_line(reader)).await {
            Err(_) => return Err(RequestError::IdleTimeout),
            Ok(line) => line?,
        };
        if request_line.is_empty() {
            return Err(RequestError::Closed);
        }
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RequestError::Bad(StatusCode::BAD_REQUEST));
        };
        let version = match version {
            "HTTP/1.1" => Version::HTTP_11,
            "HTTP/1.0" => Version::HTTP_10,
            _ => return Err(RequestError::Bad(StatusCode::HTTP_VERSION_NOT_SUPPORTED)),
        };
        let method: Method = method
            .parse()
            .map_err(|_| RequestError::Bad(StatusCode::BAD_REQUEST))?;
        if !target.starts_with('/') || target.contains('\0') {
            return Err(RequestError::Bad(StatusCode::BAD_REQUEST));
        }

        let mut headers = HeaderMap::new();
        let mut head_size = request_line.len();
        loop {
            let line = read_head_line(reader).await?;
            if line.is_empty() {
                break;
            }
            head_size += line.len();
            if head_size > MAX_HEAD_SIZE {
                return Err(RequestError::Bad(StatusCode::BAD_REQUEST));
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(RequestError::Bad(StatusCode::BAD_REQUEST));
            };
            let name: HeaderName = name
                .trim()
                .parse()
                .map_err(|_| RequestError::Bad(StatusCode::BAD_REQUEST))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| RequestError::Bad(StatusCode::BAD_REQUEST))?;
            headers.append(name, value);
        }

        let keep_alive = match headers.get(http::header::CONNECTION) {
            Some(value) => {
                let value = value.to_str().unwrap_or("");
                if version == Version::HTTP_10 {
                    value.eq_ignore_ascii_case("keep-alive")
                } else {
                    !value.eq_ignore_ascii_case("close")
                }
            }
            None => version == Version::HTTP_11,
        };

        let body = self.read_body(reader, &method, &headers).await?;
        Ok((
            HttpRequest {
                method,
                uri: target.to_string(),
                headers,
                client_address: self.client,
                server_address,
                body,
            },
            keep_alive,
        ))
    }

    async fn read_body(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Vec<u8>, RequestError> {
        if headers.contains_key(http::header::TRANSFER_ENCODING) {
            // Chunked request bodies are not supported; RFC 7231 names 411
            // for requests that must carry a length.
            return Err(RequestError::Bad(StatusCode::LENGTH_REQUIRED));
        }
        let content_length = match headers.get(http::header::CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .ok_or(RequestError::Bad(StatusCode::BAD_REQUEST))?,
            None => {
                if method == Method::POST {
                    // POST bodies are consumed before dispatch; without a
                    // length the framing is unknowable.
                    return Err(RequestError::Bad(StatusCode::LENGTH_REQUIRED));
                }
                return Ok(Vec::new());
            }
        };
        if content_length > self.config.max_request_body_size {
            return Err(RequestError::Bad(StatusCode::PAYLOAD_TOO_LARGE));
        }
        let mut body = vec![0_u8; content_length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(RequestError::Io)?;
        Ok(body)
    }

    /// Offers the request to the handler pipeline.
    async fn dispatch(&self, request: HttpRequest) -> Outgoing {
        if !matches!(request.method, Method::GET | Method::HEAD | Method::POST) {
            return Outgoing::from_status(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(handler) = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(&request.uri))
            .cloned()
        else {
            return Outgoing::from_status(StatusCode::NOT_FOUND);
        };
        let uri = request.uri.clone();
        let method = request.method.clone();
        // Handlers block on disk, SQLite, and template rendering.
        let result =
            tokio::task::spawn_blocking(move || handler.handle(&request)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!("Handler task for {method} {uri} panicked: {join_error}");
                return Outgoing::from_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let outgoing = match outcome {
            Ok(response) => {
                let last_modified = match &response.body {
                    ResponseBody::File { path, .. } => std::fs::metadata(path)
                        .and_then(|metadata| metadata.modified())
                        .ok()
                        .map(format_http_date),
                    _ => None,
                };
                Outgoing {
                    status: response.status,
                    content_type: response.content_type,
                    body: response.body,
                    last_modified,
                }
            }
            Err(err) => {
                let status = match &err {
                    HandlerError::NotFound => StatusCode::NOT_FOUND,
                    HandlerError::AccessDenied => StatusCode::FORBIDDEN,
                    HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    HandlerError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
                    HandlerError::Internal(message) => {
                        tracing::error!("Handler for {method} {uri} failed: {message}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                Outgoing::from_status(status)
            }
        };
        tracing::info!(
            "Processed HTTP request \"{method} {uri}\" from {} with status code {}",
            self.client,
            outgoing.status.as_u16()
        );
        outgoing
    }
}

/// Reads one CRLF-terminated head line, with a line-length limit.
///
/// Returns an empty string both for an empty line and for a connection
/// that closed before sending anything; callers treat the latter as
/// [`RequestError::Closed`] via the empty request line.
async fn read_head_line(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<String, RequestError> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buffered = reader.fill_buf().await.map_err(RequestError::Io)?;
        if buffered.is_empty() {
            if line.is_empty() {
                return Ok(String::new());
            }
            return Err(RequestError::Closed);
        }
        if let Some(newline) = buffered.iter().position(|&byte| byte == b'\n') {
            line.extend_from_slice(&buffered[..newline]);
            reader.consume(newline + 1);
            break;
        }
        let chunk_length = buffered.len();
        line.extend_from_slice(buffered);
        reader.consume(chunk_length);
        if line.len() > MAX_HEAD_SIZE {
            return Err(RequestError::Bad(StatusCode::BAD_REQUEST));
        }
    }
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| RequestError::Bad(StatusCode::BAD_REQUEST))
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    outgoing: &Outgoing,
    keep_alive: bool,
    method: &Method,
) -> std::io::Result<()> {
    let content_length = match &outgoing.body {
        ResponseBody::Empty => 0,
        ResponseBody::Bytes(bytes) => bytes.len() as u64,
        ResponseBody::File { length, .. } => *length,
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {content_length}\r\n",
        outgoing.status.as_u16(),
        outgoing.status.canonical_reason().unwrap_or(""),
    );
    if let Some(content_type) = &outgoing.content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(last_modified) = &outgoing.last_modified {
        head.push_str(&format!("Last-Modified: {last_modified}\r\n"));
    }
    if !keep_alive {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;

    if method != Method::HEAD {
        match &outgoing.body {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(bytes) => writer.write_all(bytes).await?,
            ResponseBody::File { path, length } => {
                let file = tokio::fs::File::open(path).await?;
                // Cap at the advertised length so a concurrently growing
                // file cannot corrupt the framing.
                let mut limited = file.take(*length);
                let copied = tokio::io::copy(&mut limited, writer).await?;
                if copied != *length {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file shrank while streaming",
                    ));
                }
            }
        }
    }
    writer.flush().await
}
