//! TFTP server component (RFC 1350 with option negotiation).

pub mod protocol;
mod server;

pub use server::{BoundTftpServer, TftpServer, TftpServerConfig};
