//! TFTP protocol definitions and packet codecs (RFC 1350, 2347, 2348,
//! 2349).

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;

use std::fmt;

use thiserror::Error;

/// Block size used when the client does not negotiate one.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size a client may negotiate (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size a client may negotiate (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Smallest timeout interval in seconds (RFC 2349).
pub const MIN_TIMEOUT: u64 = 1;

/// Largest timeout interval in seconds (RFC 2349).
pub const MAX_TIMEOUT: u64 = 255;

/// Highest block number; the counter wraps beyond it.
pub const MAX_BLOCK_NUMBER: u16 = 65535;

/// Requests never legitimately exceed this size.
pub const MAX_REQUEST_PACKET_SIZE: usize = 512;

/// Name of the block-size option.
pub const OPTION_BLOCK_SIZE: &str = "blksize";

/// Name of the timeout-interval option.
pub const OPTION_TIMEOUT: &str = "timeout";

/// Name of the transfer-size option.
pub const OPTION_TRANSFER_SIZE: &str = "tsize";

/// Error raised when a packet cannot be decoded.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProtocolError(pub String);

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// Client request for reading a file.
    ReadRequest = 1,
    /// Client request for writing a file.
    WriteRequest = 2,
    /// One block of transferred data.
    Data = 3,
    /// Acknowledgement of a received block.
    Ack = 4,
    /// Error message.
    Error = 5,
    /// Acknowledgement of accepted options (RFC 2347).
    OptionsAck = 6,
}

impl Opcode {
    /// Decodes the opcode from the first two bytes of a packet.
    #[must_use]
    pub fn from_packet(data: &[u8]) -> Option<Self> {
        match read_u16(data, 0)? {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::OptionsAck),
            _ => None,
        }
    }
}

/// Error codes carried in ERROR packets.
///
/// The receive path accepts any 16-bit value; codes outside the well-known
/// range are preserved as [`ErrorCode::Unknown`] so they can be logged
/// without aborting the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Error does not fall into any of the other categories.
    NotDefined,
    /// Requested file could not be found.
    FileNotFound,
    /// Access to the requested file is forbidden.
    AccessViolation,
    /// The disk is full (write requests).
    DiskFull,
    /// The operation is not allowed here by the protocol.
    IllegalOperation,
    /// The packet came from an unexpected address or port.
    UnknownTransferId,
    /// The file already exists (write requests).
    FileAlreadyExists,
    /// The user is not known (write requests in mail mode).
    NoSuchUser,
    /// Transfer aborted during option negotiation (RFC 2347).
    TransferAborted,
    /// Any code this implementation does not know.
    Unknown(u16),
}

impl ErrorCode {
    /// Returns the wire value of this code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::NotDefined => 0,
            Self::FileNotFound => 1,
            Self::AccessViolation => 2,
            Self::DiskFull => 3,
            Self::IllegalOperation => 4,
            Self::UnknownTransferId => 5,
            Self::FileAlreadyExists => 6,
            Self::NoSuchUser => 7,
            Self::TransferAborted => 8,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::NotDefined,
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::TransferAborted,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown error code {code}"),
            known => write!(f, "error code {}", known.code()),
        }
    }
}

/// Transfer mode requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Line breaks are expanded to CR LF on the wire.
    Netascii,
    /// Bytes are sent without conversion.
    Octet,
    /// Deprecated mail mode; rejected by this server.
    Mail,
}

impl TransferMode {
    /// Parses the mode string of a request (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for anything but the three RFC 1350
    /// modes.
    pub fn parse(mode: &str) -> Result<Self, ProtocolError> {
        match mode.to_ascii_lowercase().as_str() {
            "netascii" => Ok(Self::Netascii),
            "octet" => Ok(Self::Octet),
            "mail" => Ok(Self::Mail),
            other => Err(ProtocolError(format!("Unsupported transfer mode: {other}"))),
        }
    }
}

/// A decoded read or write request.
#[derive(Debug)]
pub struct Request {
    /// Requested opcode; always `ReadRequest` or `WriteRequest`.
    pub opcode: Opcode,
    /// Requested file name.
    pub filename: String,
    /// Requested transfer mode.
    pub mode: TransferMode,
    /// Options in request order, names lower-cased.
    pub options: Vec<(String, String)>,
}

/// Decodes an RRQ or WRQ packet.
///
/// # Errors
///
/// Returns [`ProtocolError`] for packets that are not well-formed
/// requests.
pub fn decode_request(data: &[u8]) -> Result<Request, ProtocolError> {
    let opcode = Opcode::from_packet(data)
        .filter(|opcode| matches!(opcode, Opcode::ReadRequest | Opcode::WriteRequest))
        .ok_or_else(|| ProtocolError("Packet is not a read or write request".to_string()))?;
    let mut parts = data[2..].split(|&byte| byte == 0);
    let filename = parts
        .next()
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ProtocolError("Request has no filename".to_string()))?;
    let mode_text = parts
        .next()
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .ok_or_else(|| ProtocolError("Request has no transfer mode".to_string()))?;
    let mode = TransferMode::parse(&mode_text)?;
    let mut remaining: Vec<String> = parts
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    // The trailing null byte of the last option value produces one empty
    // trailing element.
    match remaining.pop() {
        Some(ref last) if last.is_empty() => {}
        _ => return Err(ProtocolError("Request is not null-terminated".to_string())),
    }
    if remaining.len() % 2 != 0 {
        return Err(ProtocolError(
            "Request carries an option name without a value".to_string(),
        ));
    }
    let options = remaining
        .chunks(2)
        .map(|pair| (pair[0].to_ascii_lowercase(), pair[1].clone()))
        .collect();
    Ok(Request {
        opcode,
        filename,
        mode,
        options,
    })
}

/// Decodes an ACK packet, returning the acknowledged block number.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the packet is not a well-formed ACK.
pub fn decode_ack(data: &[u8]) -> Result<u16, ProtocolError> {
    if Opcode::from_packet(data) != Some(Opcode::Ack) {
        return Err(ProtocolError("Packet is not an ACK".to_string()));
    }
    if data.len() != 4 {
        return Err(ProtocolError(
            "Packet does not have the right size for an ACK".to_string(),
        ));
    }
    read_u16(data, 2).ok_or_else(|| ProtocolError("Packet too short".to_string()))
}

/// Decodes an ERROR packet.
///
/// This never fails; it reconstructs as much of the packet as possible so
/// that even a malformed error from a client can be logged.
#[must_use]
pub fn decode_error(data: &[u8]) -> (ErrorCode, String) {
    let code = read_u16(data, 2).map_or(ErrorCode::NotDefined, ErrorCode::from);
    let message = data
        .get(4..)
        .map(|tail| {
            let end = tail
                .iter()
                .position(|&byte| byte == 0)
                .unwrap_or(tail.len());
            String::from_utf8_lossy(&tail[..end]).into_owned()
        })
        .unwrap_or_default();
    (code, message)
}

/// Encodes a DATA packet.
#[must_use]
pub fn data_packet(block: u16, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + data.len());
    packet.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
    packet.extend_from_slice(&block.to_be_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Encodes an ERROR packet.
#[must_use]
pub fn error_packet(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(5 + message.len());
    packet.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
    packet.extend_from_slice(&code.code().to_be_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet.push(0);
    packet
}

/// Encodes an OACK packet from the accepted options.
#[must_use]
pub fn options_ack_packet(options: &[(String, String)]) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&(Opcode::OptionsAck as u16).to_be_bytes());
    for (name, value) in options {
        packet.extend_from_slice(name.as_bytes());
        packet.push(0);
        packet.extend_from_slice(value.as_bytes());
        packet.push(0);
    }
    packet
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}
