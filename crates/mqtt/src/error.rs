//! Unified error type for the broker connection.
//!
//! `TransferError` gathers everything that can go wrong between building the
//! client and handing a publish request to the event loop: configuration and
//! credential problems found at startup, queueing failures, connection and
//! protocol errors surfaced by the event loop, and retry exhaustion.
//!
//! Startup errors (`ClientSetup`, `ConfigError`, `Credentials`, `Io`) mean the
//! process cannot run and should exit. Runtime errors (`ClientTransfer`,
//! `ClientConnection`) are transient; the connection kernel keeps retrying on
//! its own.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// QoS outside the 0..=2 range defined by MQTT 3.1.1.
    #[error("Invalid QoS value {0}, must be 0, 1, or 2")]
    InvalidQos(u8),

    /// MQTT client initialization failed (bad TLS material, malformed options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Username/password could not be resolved from the configured sources.
    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Connection kernel error: {0}")]
    ConnectionKernel(String),

    /// `Config` failed `validator` checks.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The local client could not queue the request (channel closed, event
    /// loop gone).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level failure reported by the event loop.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(Box<rumqttc::ConnectionError>),

    #[error("Client connection state error: {0}")]
    ConnectionState(#[from] rumqttc::StateError),

    /// Reconnection attempts exhausted.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// File I/O, e.g. reading TLS material or credential files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}
