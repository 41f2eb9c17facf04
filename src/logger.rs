// ============================================================================
// logger.rs
// ============================================================================
//! Global `tracing` subscriber setup.
//!
//! [`LoggerManager`] validates the `[logger]` section and installs a registry
//! with a console layer and, on systemd hosts, an optional journald layer.
//! Each layer gets its own `EnvFilter`: `RUST_LOG` when it is set, the
//! configured level otherwise.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, JournaldConfig, LogFormat, LoggerConfig},
    print_info, print_warn,
};

/// A type-erased output layer, so console and journald can share one `Vec`.
type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while validating the `[logger]` section or installing the
/// global subscriber.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// The registry refused the layers, most often because a global
    /// subscriber was already installed.
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    /// The `[logger]` section failed validation (unknown level, empty
    /// journald identifier).
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// Typically the journald socket is missing.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Neither console nor journald output is enabled.
    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was requested next to the console and could not be opened.
    /// Journald alone falls back to nothing and reports `NoLayersConfigured`.
    #[error("Failed to initialize journald logger while console output is enabled. Please check your configuration.")]
    JournaldFailedWithConsoleEnabled,
}

/// Owns a validated `[logger]` section until the subscriber is installed.
///
/// # Typical Usage
///
/// ```ignore
/// let manager = LoggerManager::new(config.logger.clone())?;
/// manager.init()?;
/// tracing::info!("logging is up");
/// ```
pub struct LoggerManager {
    /// Validated logger section
    config: LoggerConfig,
}

impl LoggerManager {
    /// Creates a manager and validates the provided configuration.
    ///
    /// # Arguments
    /// - `config`: The `[logger]` section of the application config
    ///
    /// # Returns
    /// - `Ok(Self)`: Manager ready to `init`
    /// - `Err(LoggerError::ValidationError)`: If the section is invalid
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Must be called once, before the first
    /// `tracing` event that should be recorded.
    ///
    /// # Errors
    ///
    /// Fails if no layer could be built, if journald fails while the console
    /// is also requested, or if a global subscriber is already set.
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    /// Collects every enabled output as a boxed layer with its own filter.
    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        // Console output
        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(console_layer(console, self.filter()));
        }

        // Journald output, only available where the socket exists
        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match journald_layer(journald, self.filter()) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        Ok(layers)
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }
}

/// Builds the stdout layer in the configured format.
///
/// `show_spans` records span closes, which include the span's busy and idle
/// time. Colors follow `ansi_colors`.
fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
    let spans = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(spans)
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}

/// Fails when the journald socket cannot be opened.
fn journald_layer(config: &JournaldConfig, filter: EnvFilter) -> Result<BoxedLayer, LoggerError> {
    let layer = tracing_journald::layer()?.with_syslog_identifier(config.identifier.clone());
    Ok(layer.with_filter(filter).boxed())
}
