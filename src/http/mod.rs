//! HTTP server component.

mod date;
mod server;

pub use server::{BoundHttpServer, HttpServer, HttpServerConfig};
