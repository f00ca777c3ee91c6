// src/logger.rs

use crate::config::{Config, Settings};
use crate::error::{GatewayError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initialize tracing. stdout carries the MCP protocol, so log output goes
/// to stderr or to the configured log file, never stdout. Returns the
/// appender guard which must stay alive for the life of the process.
pub fn init(settings: &Settings, config: &Config) -> Result<Option<WorkerGuard>> {
    let directive = if settings.debug {
        "debug".to_string()
    } else if settings.quiet {
        "error".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_from_env("FUNNEL_LOG")
        .or_else(|_| EnvFilter::try_new(&directive))
        .map_err(|e| GatewayError::InvalidRequest(format!("bad log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .ok_or_else(|| {
                    GatewayError::InvalidRequest(format!("log file {} has no name", path.display()))
                })?
                .to_owned();
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| GatewayError::Internal(format!("logger init: {e}")))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .with_ansi(settings.color)
                .try_init()
                .map_err(|e| GatewayError::Internal(format!("logger init: {e}")))?;
            Ok(None)
        }
    }
}
