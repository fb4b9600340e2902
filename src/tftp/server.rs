//! TFTP server serving read requests through the handler pipeline.
//!
//! A single UDP socket listens for requests. Write requests are rejected;
//! for each read request a worker task is spawned that owns a fresh
//! ephemeral socket, negotiates options (RFC 2347/2348/2349), and runs the
//! DATA/ACK state machine against the client. Packets arriving on a
//! transfer socket from anyone but the transfer's client are answered with
//! error 5 and otherwise ignored, as RFC 1350 demands.

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Duration, Instant};

use crate::handler::{HandlerError, TftpContent, TftpHandler};

use super::protocol::{
    self, decode_ack, decode_error, decode_request, ErrorCode, Opcode, Request, TransferMode,
    DEFAULT_BLOCK_SIZE, MAX_BLOCK_NUMBER, MAX_BLOCK_SIZE, MAX_REQUEST_PACKET_SIZE, MAX_TIMEOUT,
    MIN_BLOCK_SIZE, MIN_TIMEOUT, OPTION_BLOCK_SIZE, OPTION_TIMEOUT, OPTION_TRANSFER_SIZE,
};

/// Configuration of the TFTP server.
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    /// Address the request socket binds to.
    pub bind_address: IpAddr,
    /// Port the request socket binds to.
    pub bind_port: u16,
    /// Per-wait timeout in seconds when the client did not negotiate one.
    pub default_timeout: u64,
    /// Retransmissions of a packet before the transfer is given up.
    pub max_retries: u32,
    /// Upper bound accepted for the `blksize` option.
    pub max_block_size: u16,
    /// Value the block counter wraps to after 65535 (0 or 1).
    pub block_counter_wrap_value: u16,
    /// Transfers running concurrently; further requests queue.
    pub max_concurrent_transfers: usize,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0_u16; 8]),
            bind_port: 69,
            default_timeout: 5,
            max_retries: 5,
            max_block_size: MAX_BLOCK_SIZE,
            block_counter_wrap_value: 0,
            max_concurrent_transfers: 64,
        }
    }
}

/// The TFTP server.
pub struct TftpServer {
    handlers: Vec<Arc<dyn TftpHandler>>,
    config: TftpServerConfig,
}

impl TftpServer {
    /// Creates a server over an ordered handler pipeline.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn TftpHandler>>, config: TftpServerConfig) -> Self {
        Self { handlers, config }
    }

    /// Binds the request socket.
    ///
    /// Binding is separate from [`BoundTftpServer::run`] so that bind
    /// errors surface during startup.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(self) -> std::io::Result<BoundTftpServer> {
        let socket =
            UdpSocket::bind((self.config.bind_address, self.config.bind_port)).await?;
        tracing::info!(
            "TFTP server is listening on {}",
            socket.local_addr().map_or_else(
                |_| self.config.bind_address.to_string(),
                |addr| addr.to_string()
            )
        );
        Ok(BoundTftpServer {
            socket: Arc::new(socket),
            handlers: Arc::new(self.handlers),
            config: self.config,
        })
    }
}

/// A TFTP server with its request socket bound.
pub struct BoundTftpServer {
    socket: Arc<UdpSocket>,
    handlers: Arc<Vec<Arc<dyn TftpHandler>>>,
    config: TftpServerConfig,
}

impl BoundTftpServer {
    /// Returns the bound address of the request socket.
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves requests until `shutdown` flips to `true`.
    ///
    /// In-flight transfers observe the same signal and abort with error
    /// code 0.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_transfers));
        let mut buffer = vec![0_u8; MAX_REQUEST_PACKET_SIZE];
        loop {
            let received = tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                received = self.socket.recv_from(&mut buffer) => received,
            };
            let (length, client) = match received {
                Ok(received) => received,
                Err(err) => {
                    tracing::warn!("Receiving a TFTP request failed: {err}");
                    continue;
                }
            };
            self.dispatch(&buffer[..length], client, &limit, &shutdown)
                .await;
        }
        tracing::info!("TFTP server has been shut down");
    }

    async fn dispatch(
        &self,
        packet: &[u8],
        client: SocketAddr,
        limit: &Arc<Semaphore>,
        shutdown: &watch::Receiver<bool>,
    ) {
        // Packets with a short or unrecognized opcode are ignored: RFC 1350
        // does not define a response on the request port, and answering
        // garbage would only invite reflection.
        match Opcode::from_packet(packet) {
            Some(Opcode::ReadRequest) => {}
            Some(Opcode::WriteRequest) => {
                tracing::info!("Rejecting write request from {client}");
                self.send_error(
                    client,
                    ErrorCode::AccessViolation,
                    "Write requests are not allowed by this server.",
                )
                .await;
                return;
            }
            Some(opcode) => {
                tracing::debug!("Ignoring {opcode:?} packet on the request port from {client}");
                return;
            }
            None => {
                tracing::debug!("Ignoring unrecognized packet from {client}");
                return;
            }
        }
        let request = match decode_request(packet) {
            Ok(request) => request,
            Err(err) => {
                tracing::info!("Malformed read request from {client}: {err}");
                self.send_error(client, ErrorCode::IllegalOperation, "Malformed read request.")
                    .await;
                return;
            }
        };
        if request.mode == TransferMode::Mail {
            tracing::info!("Read request from {client} uses unsupported mode mail");
            self.send_error(
                client,
                ErrorCode::IllegalOperation,
                "Transfer mode mail is not allowed for read requests.",
            )
            .await;
            return;
        }
        let Some(handler) = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(&request.filename))
            .cloned()
        else {
            tracing::info!(
                "No handler can fulfill the request for \"{}\" from {client}",
                request.filename
            );
            self.send_error(
                client,
                ErrorCode::FileNotFound,
                "The requested file does not exist.",
            )
            .await;
            return;
        };
        tracing::info!(
            "Handling read request for \"{}\" from {client}",
            request.filename
        );
        let transfer = Transfer {
            request,
            client,
            server_address: self.socket.local_addr().ok(),
            handler,
            config: self.config.clone(),
        };
        let limit = Arc::clone(limit);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            // Queue behind the concurrency cap; a closed semaphore cannot
            // happen because the server owns it.
            let Ok(_permit) = limit.acquire().await else {
                return;
            };
            transfer.run(shutdown).await;
        });
    }

    async fn send_error(&self, client: SocketAddr, code: ErrorCode, message: &str) {
        let packet = protocol::error_packet(code, message);
        if let Err(err) = self.socket.send_to(&packet, client).await {
            tracing::debug!("Sending an error packet to {client} failed: {err}");
        }
    }
}

/// Why a transfer ended before the final ACK.
enum TransferAbort {
    /// All retries were used up without the expected ACK.
    Timeout,
    /// The client aborted the negotiation (error code 8).
    NegotiationAborted,
    /// The client reported an error.
    ClientError(ErrorCode, String),
    /// The client sent something that is not a valid ACK or ERROR.
    InvalidPacket(String),
    /// The transferred file exhausted the block counter with wrapping
    /// disabled by configuration.
    BlockCounterOverflow,
    /// Server shutdown.
    Shutdown,
    /// Socket I/O failed.
    Io(std::io::Error),
}

/// One in-flight read request.
struct Transfer {
    request: Request,
    client: SocketAddr,
    server_address: Option<SocketAddr>,
    handler: Arc<dyn TftpHandler>,
    config: TftpServerConfig,
}

impl Transfer {
    async fn run(self, shutdown: watch::Receiver<bool>) {
        // The transfer owns a fresh ephemeral socket; its port is the
        // server-side transfer ID.
        let bind_address: SocketAddr = if self.client.is_ipv4() {
            (IpAddr::from([0_u8; 4]), 0).into()
        } else {
            (IpAddr::from([0_u16; 8]), 0).into()
        };
        let socket = match UdpSocket::bind(bind_address).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::error!(
                    "Creating the transfer socket for {} failed: {err}",
                    self.client
                );
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        let filename = self.request.filename.clone();
        let client = self.client;
        let server_address = self
            .server_address
            .unwrap_or_else(|| (bind_address.ip(), 0).into());
        // Handlers block on disk, SQLite, and template rendering.
        let content = tokio::task::spawn_blocking(move || {
            handler.handle(&filename, client, server_address)
        })
        .await;
        let content = match content {
            Ok(Ok(content)) => content,
            Ok(Err(err)) => {
                let (code, message) = match &err {
                    HandlerError::NotFound => {
                        (ErrorCode::FileNotFound, "File not found.".to_string())
                    }
                    HandlerError::AccessDenied => {
                        (ErrorCode::AccessViolation, "Access denied.".to_string())
                    }
                    other => {
                        tracing::error!(
                            "Handler for \"{}\" from {} failed: {other}",
                            self.request.filename,
                            self.client
                        );
                        (
                            ErrorCode::NotDefined,
                            "An internal error occurred while trying to fulfill the request."
                                .to_string(),
                        )
                    }
                };
                tracing::info!(
                    "Request for \"{}\" from {} ends with {code}: {message}",
                    self.request.filename,
                    self.client
                );
                self.send(&socket, &protocol::error_packet(code, &message))
                    .await;
                return;
            }
            Err(join_error) => {
                tracing::error!(
                    "Handler task for \"{}\" from {} panicked: {join_error}",
                    self.request.filename,
                    self.client
                );
                self.send(
                    &socket,
                    &protocol::error_packet(
                        ErrorCode::NotDefined,
                        "An internal error occurred while trying to fulfill the request.",
                    ),
                )
                .await;
                return;
            }
        };

        match self.serve_content(&socket, content, shutdown).await {
            Ok(()) => {}
            Err(TransferAbort::Timeout) => {
                tracing::info!(
                    "Request for \"{}\" from {} timed out",
                    self.request.filename,
                    self.client
                );
            }
            Err(TransferAbort::NegotiationAborted) => {
                // A client declining the offered options is not an error.
                tracing::debug!(
                    "Client {} aborted the transfer of \"{}\" during option negotiation",
                    self.client,
                    self.request.filename
                );
            }
            Err(TransferAbort::ClientError(code, message)) => {
                tracing::info!(
                    "Transfer of \"{}\" to {} aborted by client, {code}: {message}",
                    self.request.filename,
                    self.client
                );
            }
            Err(TransferAbort::InvalidPacket(message)) => {
                tracing::info!(
                    "Transfer of \"{}\" to {} aborted, invalid packet: {message}",
                    self.request.filename,
                    self.client
                );
                self.send(
                    &socket,
                    &protocol::error_packet(ErrorCode::NotDefined, &message),
                )
                .await;
            }
            Err(TransferAbort::BlockCounterOverflow) => {
                tracing::error!(
                    "Transfer of \"{}\" to {} aborted, file too large without block \
                     counter wrapping",
                    self.request.filename,
                    self.client
                );
                self.send(
                    &socket,
                    &protocol::error_packet(
                        ErrorCode::NotDefined,
                        "File is too large to complete the transfer.",
                    ),
                )
                .await;
            }
            Err(TransferAbort::Shutdown) => {
                self.send(
                    &socket,
                    &protocol::error_packet(ErrorCode::NotDefined, "Server is shutting down."),
                )
                .await;
            }
            Err(TransferAbort::Io(err)) => {
                tracing::warn!(
                    "Transfer of \"{}\" to {} failed: {err}",
                    self.request.filename,
                    self.client
                );
            }
        }
    }

    async fn serve_content(
        &self,
        socket: &UdpSocket,
        content: TftpContent,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransferAbort> {
        let netascii = self.request.mode == TransferMode::Netascii;
        let total_size = match &content {
            TftpContent::Bytes(bytes) => Some(bytes.len() as u64),
            TftpContent::File { length, .. } => Some(*length),
        };
        let mut reader = BlockReader::new(content, netascii).await?;

        // Accept the supported subset of the requested options, in request
        // order.
        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut wait = Duration::from_secs(self.config.default_timeout.max(MIN_TIMEOUT));
        let mut accepted: Vec<(String, String)> = Vec::new();
        for (name, value) in &self.request.options {
            match name.as_str() {
                OPTION_BLOCK_SIZE => {
                    if let Ok(requested) = value.parse::<u16>() {
                        if requested >= MIN_BLOCK_SIZE {
                            block_size = requested.min(self.config.max_block_size);
                            accepted
                                .push((OPTION_BLOCK_SIZE.to_string(), block_size.to_string()));
                        }
                    }
                }
                OPTION_TIMEOUT => {
                    // The negotiated timeout may only be accepted verbatim
                    // or rejected, never changed.
                    if let Ok(requested) = value.parse::<u64>() {
                        if (MIN_TIMEOUT..=MAX_TIMEOUT).contains(&requested) {
                            wait = Duration::from_secs(requested);
                            accepted.push((OPTION_TIMEOUT.to_string(), requested.to_string()));
                        }
                    }
                }
                OPTION_TRANSFER_SIZE => {
                    // The size of a netascii transfer depends on the
                    // conversion, so it is only reported for octet mode.
                    if value == "0" && !netascii {
                        if let Some(size) = total_size {
                            accepted
                                .push((OPTION_TRANSFER_SIZE.to_string(), size.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }

        if !accepted.is_empty() {
            let oack = protocol::options_ack_packet(&accepted);
            self.send_and_await_ack(socket, &oack, 0, wait, &mut shutdown, true)
                .await?;
        }

        // DATA blocks count from 1; the ACK of the final short (possibly
        // empty) block ends the transfer.
        let mut block_number: u16 = 0;
        loop {
            let data = reader.read_block(block_size as usize).await?;
            block_number = self.next_block_number(block_number)?;
            let packet = protocol::data_packet(block_number, &data);
            self.send_and_await_ack(socket, &packet, block_number, wait, &mut shutdown, false)
                .await?;
            if data.len() < block_size as usize {
                return Ok(());
            }
        }
    }

    fn next_block_number(&self, block_number: u16) -> Result<u16, TransferAbort> {
        if block_number == MAX_BLOCK_NUMBER {
            // Wrapping to anything above 1 would be nonsense; the config
            // layer validates the value, this just keeps the invariant.
            if self.config.block_counter_wrap_value > 1 {
                return Err(TransferAbort::BlockCounterOverflow);
            }
            Ok(self.config.block_counter_wrap_value)
        } else {
            Ok(block_number + 1)
        }
    }

    /// Sends a packet and waits for the matching ACK, retransmitting on
    /// timeout.
    async fn send_and_await_ack(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        expected_block: u16,
        wait: Duration,
        shutdown: &mut watch::Receiver<bool>,
        negotiating: bool,
    ) -> Result<(), TransferAbort> {
        let mut tries_left = self.config.max_retries + 1;
        while tries_left > 0 {
            tries_left -= 1;
            socket
                .send_to(packet, self.client)
                .await
                .map_err(TransferAbort::Io)?;
            let deadline = Instant::now() + wait;
            match self
                .await_ack(socket, expected_block, deadline, shutdown, negotiating)
                .await
            {
                Ok(()) => return Ok(()),
                Err(TransferAbort::Timeout) => continue,
                Err(abort) => return Err(abort),
            }
        }
        Err(TransferAbort::Timeout)
    }

    /// Waits for an ACK with the expected block number until the deadline.
    async fn await_ack(
        &self,
        socket: &UdpSocket,
        expected_block: u16,
        deadline: Instant,
        shutdown: &mut watch::Receiver<bool>,
        negotiating: bool,
    ) -> Result<(), TransferAbort> {
        let mut buffer = vec![0_u8; MAX_REQUEST_PACKET_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransferAbort::Timeout);
            }
            let received = tokio::select! {
                biased;

                _ = shutdown.changed() => return Err(TransferAbort::Shutdown),

                received = timeout(remaining, socket.recv_from(&mut buffer)) => received,
            };
            let (length, from) = match received {
                Err(_) => return Err(TransferAbort::Timeout),
                Ok(Err(err)) => return Err(TransferAbort::Io(err)),
                Ok(Ok(received)) => received,
            };
            // RFC 1350 TID check: answer strangers with error 5 and keep
            // waiting for the real client.
            if from != self.client {
                tracing::debug!(
                    "Unexpected packet from {from} on the transfer socket for {}",
                    self.client
                );
                let rejection = protocol::error_packet(
                    ErrorCode::UnknownTransferId,
                    "This port is associated with a different client connection.",
                );
                let _ = socket.send_to(&rejection, from).await;
                continue;
            }
            let packet = &buffer[..length];
            match Opcode::from_packet(packet) {
                Some(Opcode::Ack) => {
                    let block = decode_ack(packet).map_err(|err| {
                        TransferAbort::InvalidPacket(format!("Malformed ACK packet: {err}"))
                    })?;
                    if block == expected_block {
                        return Ok(());
                    }
                    // An ACK for an older block is a duplicate; keep
                    // waiting for the right one.
                }
                Some(Opcode::Error) => {
                    let (code, message) = decode_error(packet);
                    if negotiating && code == ErrorCode::TransferAborted {
                        return Err(TransferAbort::NegotiationAborted);
                    }
                    return Err(TransferAbort::ClientError(code, message));
                }
                Some(other) => {
                    return Err(TransferAbort::InvalidPacket(format!(
                        "Received unexpected {other:?} packet"
                    )));
                }
                None => {
                    return Err(TransferAbort::InvalidPacket(
                        "Received packet with an invalid opcode".to_string(),
                    ));
                }
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, packet: &[u8]) {
        if let Err(err) = socket.send_to(packet, self.client).await {
            tracing::debug!("Sending a packet to {} failed: {err}", self.client);
        }
    }
}

/// Source the DATA blocks are read from.
enum ContentReader {
    File(tokio::fs::File),
    Bytes { data: Vec<u8>, position: usize },
}

impl ContentReader {
    async fn read_chunk(&mut self, size: usize) -> std::io::Result<Vec<u8>> {
        match self {
            Self::File(file) => {
                let mut chunk = vec![0_u8; size];
                let length = file.read(&mut chunk).await?;
                chunk.truncate(length);
                Ok(chunk)
            }
            Self::Bytes { data, position } => {
                let end = (*position + size).min(data.len());
                let chunk = data[*position..end].to_vec();
                *position = end;
                Ok(chunk)
            }
        }
    }
}

/// Assembles fixed-size blocks, optionally converting to netascii.
///
/// Netascii conversion expands lone CR and lone LF bytes to CR LF;
/// existing CR LF pairs pass through unchanged.
struct BlockReader {
    inner: ContentReader,
    netascii: bool,
    buffered: Vec<u8>,
    last_byte_was_cr: bool,
    eof: bool,
}

impl BlockReader {
    async fn new(content: TftpContent, netascii: bool) -> Result<Self, TransferAbort> {
        let inner = match content {
            TftpContent::Bytes(data) => ContentReader::Bytes { data, position: 0 },
            TftpContent::File { path, .. } => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(TransferAbort::Io)?;
                ContentReader::File(file)
            }
        };
        Ok(Self {
            inner,
            netascii,
            buffered: Vec::new(),
            last_byte_was_cr: false,
            eof: false,
        })
    }

    /// Reads the next block; a block shorter than `size` (possibly empty)
    /// signals end of file.
    async fn read_block(&mut self, size: usize) -> Result<Vec<u8>, TransferAbort> {
        while self.buffered.len() < size && !self.eof {
            let chunk = self
                .inner
                .read_chunk(size - self.buffered.len())
                .await
                .map_err(TransferAbort::Io)?;
            if chunk.is_empty() {
                self.eof = true;
                break;
            }
            if self.netascii {
                self.convert_chunk(&chunk);
            } else {
                self.buffered.extend_from_slice(&chunk);
            }
        }
        let take = size.min(self.buffered.len());
        Ok(self.buffered.drain(..take).collect())
    }

    fn convert_chunk(&mut self, chunk: &[u8]) {
        const CR: u8 = b'\r';
        const LF: u8 = b'\n';
        for &byte in chunk {
            if self.last_byte_was_cr {
                self.last_byte_was_cr = false;
                if byte == LF {
                    // The LF completing a CR LF pair was already emitted
                    // with the CR.
                    continue;
                }
            }
            match byte {
                CR => {
                    self.buffered.extend_from_slice(b"\r\n");
                    self.last_byte_was_cr = true;
                }
                LF => self.buffered.extend_from_slice(b"\r\n"),
                other => self.buffered.push(other),
            }
        }
    }
}
