//! Tracing initialization.
//!
//! One subscriber for the whole process: a console layer for interactive
//! use and an optional file appender under the configured log directory.
//! `RUST_LOG` overrides the configured level.

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::settings::LogSettings;
use crate::defaults;

#[derive(Error, Debug)]
pub enum TracingError {
    #[error("could not create log directory `{0}`")]
    LogDir(String),

    #[error("could not initialize tracing: {0}")]
    Init(String),
}

/// Initializes the global subscriber. The returned guard must be kept
/// alive for the lifetime of the process so buffered file output is
/// flushed.
pub fn try_init_tracing(
    settings: &LogSettings,
    log_dir: &Path,
) -> Result<Option<WorkerGuard>, TracingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    let console_layer = settings.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    });

    let (file_layer, guard) = if settings.file {
        std::fs::create_dir_all(log_dir)
            .map_err(|_| TracingError::LogDir(log_dir.display().to_string()))?;
        let appender = tracing_appender::rolling::never(log_dir, defaults::LOG_FILENAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| TracingError::Init(err.to_string()))?;

    Ok(guard)
}
