//! Server wiring and the main execution loop.
//!
//! Builds the composite data source, the per-protocol handler pipelines,
//! and both servers from the validated configuration, then runs until a
//! shutdown signal arrives.

use std::sync::Arc;

use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;

use vinegar::config::{HandlerConfig, SourceConfig, ValidatedConfig};
use vinegar::handler::{
    HttpFileHandler, HttpHandler, HttpSqliteUpdateHandler, TftpFileHandler, TftpHandler,
};
use vinegar::http::HttpServer;
use vinegar::source::{
    CompositeDataSource, DataSource, SourceBuildError, SqliteSource, TextFileSource,
    YamlTargetSource,
};
use vinegar::tftp::TftpServer;

/// Error type for runtime execution failures.
#[derive(Debug, Error)]
pub enum RunError {
    /// A data source or request handler could not be built.
    #[error("Failed to build server components: {0}")]
    Build(#[from] SourceBuildError),

    /// A listener socket could not be bound.
    #[error("Failed to bind server socket: {0}")]
    Bind(#[from] std::io::Error),

    /// A server task ended unexpectedly.
    #[error("Server task terminated unexpectedly")]
    ServerTerminated,
}

/// Builds the composite data source from the declared stack.
fn build_data_source(config: &ValidatedConfig) -> Result<Arc<dyn DataSource>, RunError> {
    let mut sources: Vec<Arc<dyn DataSource>> = Vec::with_capacity(config.data_sources.len());
    for source in &config.data_sources {
        let built: Arc<dyn DataSource> = match source {
            SourceConfig::TextFile(config) => Arc::new(TextFileSource::new(config)?),
            SourceConfig::YamlTarget(config) => Arc::new(YamlTargetSource::new(config)?),
            SourceConfig::Sqlite(config) => Arc::new(SqliteSource::new(config)?),
        };
        sources.push(built);
    }
    Ok(Arc::new(CompositeDataSource::new(
        sources,
        config.data_sources_merge_lists,
    )))
}

fn build_http_handlers(
    configs: &[HandlerConfig],
    data_source: &Arc<dyn DataSource>,
) -> Result<Vec<Arc<dyn HttpHandler>>, RunError> {
    let mut handlers: Vec<Arc<dyn HttpHandler>> = Vec::with_capacity(configs.len());
    for config in configs {
        let built: Arc<dyn HttpHandler> = match config {
            HandlerConfig::File(config) => {
                Arc::new(HttpFileHandler::new(config, Arc::clone(data_source))?)
            }
            HandlerConfig::SqliteUpdate(config) => {
                Arc::new(HttpSqliteUpdateHandler::new(config, Arc::clone(data_source))?)
            }
        };
        handlers.push(built);
    }
    Ok(handlers)
}

fn build_tftp_handlers(
    configs: &[HandlerConfig],
    data_source: &Arc<dyn DataSource>,
) -> Result<Vec<Arc<dyn TftpHandler>>, RunError> {
    let mut handlers: Vec<Arc<dyn TftpHandler>> = Vec::with_capacity(configs.len());
    for config in configs {
        let built: Arc<dyn TftpHandler> = match config {
            HandlerConfig::File(config) => {
                Arc::new(TftpFileHandler::new(config, Arc::clone(data_source))?)
            }
            // The config layer rejects this combination up front.
            HandlerConfig::SqliteUpdate(_) => {
                return Err(RunError::Build(SourceBuildError::Invalid(
                    "the sqlite_update handler is HTTP-only".to_string(),
                )))
            }
        };
        handlers.push(built);
    }
    Ok(handlers)
}

/// Executes the server until interrupted.
///
/// # Errors
///
/// Returns [`RunError`] if components cannot be built, sockets cannot be
/// bound, or a server task dies.
pub async fn execute(config: ValidatedConfig) -> Result<(), RunError> {
    let data_source = build_data_source(&config)?;
    let http_handlers = build_http_handlers(&config.http_handlers, &data_source)?;
    let tftp_handlers = build_tftp_handlers(&config.tftp_handlers, &data_source)?;

    // Bind before spawning so that startup failures reach the exit code.
    let http_server = HttpServer::new(http_handlers, config.http).bind().await?;
    let tftp_server = TftpServer::new(tftp_handlers, config.tftp).bind().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx.clone()));
    let mut tftp_task = tokio::spawn(tftp_server.run(shutdown_rx));

    let result = tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping...");
            Ok(())
        }
        _ = &mut http_task => Err(RunError::ServerTerminated),
        _ = &mut tftp_task => Err(RunError::ServerTerminated),
    };

    // Both servers drain their in-flight work before their task ends. A
    // handle that already reported completion through the select must not
    // be polled again.
    let _ = shutdown_tx.send(true);
    if !http_task.is_finished() {
        let _ = http_task.await;
    }
    if !tftp_task.is_finished() {
        let _ = tftp_task.await;
    }
    result
}

/// Completes when a shutdown signal (Ctrl+C or SIGTERM) is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
