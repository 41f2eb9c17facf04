//! The connection kernel: drives the `rumqttc` event loop for the lifetime of
//! the process.
//!
//! `EventLoop::poll` must be called continuously for requests queued through
//! `AsyncClient` to reach the broker. The kernel does that, reconnecting with
//! [`Backoff`] on transient errors, stopping on fatal ones, and publishing each
//! transition as a [`ConnectionState`] on a watch channel.
//!
//! With failover brokers configured, every reconnect moves on to the next
//! broker in the list and wraps around to the primary. The broker that
//! accepted the last session is kept until it fails.
//!
//! On cancellation the kernel queues a DISCONNECT and keeps polling for up to
//! the disconnect grace period so the packet (and anything queued before it)
//! is actually written to the socket.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, StateError,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, error::TransferError, state::ConnectionState};

pub struct ConnectionKernel {
    /// Used only to queue the final DISCONNECT
    client: AsyncClient,

    event_loop: EventLoop,

    /// Primary broker first, then failover brokers
    servers: Vec<MqttOptions>,

    /// Index into `servers` of the broker the event loop points at
    current_server: usize,

    backoff: Backoff,
    disconnect_grace: Duration,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        backoff: Backoff,
        disconnect_grace: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let servers = vec![event_loop.mqtt_options.clone()];
        Self {
            client,
            event_loop,
            servers,
            current_server: 0,
            backoff,
            disconnect_grace,
            cancel,
            state_tx,
        }
    }

    /// Adds brokers tried after the one the event loop was built for.
    pub fn with_failover(mut self, failover: Vec<MqttOptions>) -> Self {
        self.servers.extend(failover);
        self
    }

    /// Points the event loop at the next broker. No-op with a single broker.
    fn rotate_server(&mut self) {
        if self.servers.len() < 2 {
            return;
        }
        self.current_server = (self.current_server + 1) % self.servers.len();
        self.event_loop.mqtt_options = self.servers[self.current_server].clone();

        let (host, port) = self.event_loop.mqtt_options.broker_address();
        info!("Next connection attempt goes to {}:{}", host, port);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Runs until cancelled, a fatal error occurs or retries are exhausted.
    pub async fn run(mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting connection event loop...");
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, disconnecting from broker...");
                    self.disconnect().await;
                    self.update_state(ConnectionState::Stopped);
                    info!("Connection kernel shutdown completed");
                    return Ok(());
                }
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    if is_fatal_error(&e) {
                        error!("Fatal connection error: {}", get_error_message(&e));
                        self.update_state(ConnectionState::Disconnected(e.to_string()));
                        return Err(TransferError::from(e));
                    }

                    let delay = match self.backoff.next_sleep() {
                        Ok(delay) => delay,
                        Err(backoff_err) => {
                            error!("Giving up on broker connection: {}", backoff_err);
                            self.update_state(ConnectionState::Disconnected(
                                backoff_err.to_string(),
                            ));
                            return Err(backoff_err.into());
                        }
                    };

                    warn!(
                        "Reconnecting in {:.2} seconds due to error: {}",
                        delay.as_secs_f64(),
                        get_error_message(&e)
                    );
                    self.update_state(ConnectionState::Reconnecting(delay));
                    self.rotate_server();

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.update_state(ConnectionState::Stopped);
                            info!("Connection kernel stopped while waiting to reconnect");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {
                            self.update_state(ConnectionState::Connecting);
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connected with MQTT broker");
                    self.update_state(ConnectionState::Connected);
                    self.backoff.reset();
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Connecting);
            }
            Event::Incoming(packet) => trace!("Incoming packet: {:?}", packet),
            Event::Outgoing(outgoing) => trace!("Outgoing packet: {:?}", outgoing),
        }
    }

    /// Queues DISCONNECT and polls until it is written or the grace elapses.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Error queueing disconnect packet: {}", e);
            return;
        }

        let grace = self.disconnect_grace;
        let event_loop = &mut self.event_loop;
        let flush = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Event loop ended during disconnect: {}", e);
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(grace, flush).await.is_err() {
            warn!(
                "Disconnect was not flushed within {} ms",
                grace.as_millis()
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Reconnecting cannot help.
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // =================================================
        // Fatal errors (no point in retrying)
        // =================================================

        // Bad certificates or crypto setup.
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        // Every AsyncClient handle was dropped.
        ConnectionError::RequestsDone => Fatal,

        // =================================================
        // Recoverable errors (reconnect with backoff)
        // =================================================

        ConnectionError::MqttState(state) => classify_state_error(state),

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// Session state errors. Most of them describe a link that went bad (unacked
/// pings, stray or out of order acks) and a fresh session clears them. Only
/// undecodable traffic and requests the broker can never accept stay fatal.
fn classify_state_error(err: &StateError) -> Disposition {
    use Disposition::*;

    match err {
        StateError::Deserialization(_)
        | StateError::EmptySubscription
        | StateError::OutgoingPacketTooLarge { .. } => Fatal,

        StateError::Io(_)
        | StateError::AwaitPingResp
        | StateError::CollisionTimeout
        | StateError::Unsolicited(_)
        | StateError::WrongPacket
        | StateError::InvalidState => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost error message, without the wrapper chain.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
