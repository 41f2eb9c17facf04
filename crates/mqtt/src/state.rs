//! Connection lifecycle published by the connection kernel.
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected ──(error)──> Reconnecting(delay)
//!     ^                                                  │
//!     └──────────────────(delay elapsed)─────────────────┘
//!
//! any state ──(fatal error / retries exhausted)──> Disconnected(reason)
//! any state ──(shutdown)──> Stopped
//! ```

use std::{fmt, time::Duration};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting(Duration),
    /// The kernel gave up. Terminal.
    Disconnected(String),
    /// Shut down on request. Terminal.
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Stopped => "Stopped",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// The kernel will not produce any further state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::Stopped
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())?;
        match self {
            ConnectionState::Reconnecting(delay) => {
                write!(f, " (in {:.1}s)", delay.as_secs_f64())
            }
            ConnectionState::Disconnected(reason) => write!(f, " ({reason})"),
            _ => Ok(()),
        }
    }
}
