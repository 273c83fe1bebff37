//! Tracing setup and the mirror from preview telemetry into the log.

use preview_core_types::{LogLevel, PreviewEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;
use crate::errors::PreviewError;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level. The returned
/// guard flushes the file sink and must be kept alive.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>, PreviewError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|err| PreviewError::config(format!("log level {}: {err}", config.level)))?;

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|err| PreviewError::io(directory, err))?;
            let appender = tracing_appender::rolling::daily(directory, "extension-preview.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json).then(|| tracing_subscriber::fmt::layer()))
        .with(file_layer)
        .try_init()
        .map_err(|err| PreviewError::config(format!("tracing already initialised: {err}")))?;
    Ok(guard)
}

/// Writes every preview event to the log until the stream closes.
pub fn spawn_event_logger(mut events: broadcast::Receiver<PreviewEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "preview-events", skipped, "event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn log_event(event: &PreviewEvent) {
    let name = event.name();
    match event {
        PreviewEvent::InjectionAttempted {
            target,
            strategy,
            world,
            success,
            detail,
        } => {
            if *success {
                info!(target: "preview-events", event = name, page = %target, %strategy, %world, "injection attempt succeeded");
            } else {
                warn!(target: "preview-events", event = name, page = %target, %strategy, %world, %detail, "injection attempt failed");
            }
        }
        PreviewEvent::InjectionBlocked {
            target,
            attempts,
            known_restricted,
            explanation,
        } => {
            warn!(target: "preview-events", event = name, page = %target, attempts, known_restricted, "{explanation}");
        }
        PreviewEvent::ContextError {
            context, message, ..
        } => {
            warn!(target: "preview-events", event = name, %context, "{message}");
        }
        PreviewEvent::CapabilityFailed {
            context,
            capability,
            method,
            code,
            message,
        } => {
            debug!(target: "preview-events", event = name, %context, call = %format!("{capability}.{method}"), %code, "{message}");
        }
        PreviewEvent::Log {
            context,
            level,
            message,
        } => match level {
            LogLevel::Debug => debug!(target: "preview-events", %context, "{message}"),
            LogLevel::Info => info!(target: "preview-events", %context, "{message}"),
            LogLevel::Warn => warn!(target: "preview-events", %context, "{message}"),
            LogLevel::Error => error!(target: "preview-events", %context, "{message}"),
        },
        other => match serde_json::to_string(other) {
            Ok(json) => debug!(target: "preview-events", event = name, "{json}"),
            Err(_) => debug!(target: "preview-events", event = name),
        },
    }
}
