//! MQTT Manager Module
//! Entry point of the crate: builds the client, spawns the connection kernel
//! and hands out a cloneable [`MqttInstance`] for publishing.
//!
//! The manager:
//! 1. Validates the `[transport]` settings
//! 2. Builds the client for the primary broker plus options for each failover broker
//! 3. Spawns the connection kernel on the runtime
//! 4. Returns an `MqttInstance` sharing the client and the kernel's state channel
//!
//! Shutdown is two-phase. [`MqttInstance::shutdown`] first waits (bounded by
//! the disconnect grace) for in-flight publishes tracked by [`PublishDrain`],
//! then cancels the kernel, which flushes a DISCONNECT and stops.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff, client::ClientBuilder, config::Config, connection::ConnectionKernel,
    error::TransferError, state::ConnectionState,
};

/// Counts publishes that have been started but not yet handed to the event
/// loop.
#[derive(Debug, Default)]
pub struct PublishDrain {
    /// Live `PublishGuard`s
    inflight: AtomicUsize,

    /// Woken when the last guard drops
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one publish as in flight until the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: Arc::clone(self),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a guard dropped in between is not missed.
            notified.as_mut().enable();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the drain on drop, whether the publish finished or was
/// abandoned.
pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Holds validated transport settings until the connection is started.
pub struct MqttManager {
    /// Configuration for the broker connection
    config: Config,
}

impl MqttManager {
    /// Creates a manager from an existing configuration struct.
    ///
    /// # Arguments
    /// - `config`: The `[transport]` section, usually loaded from TOML
    ///
    /// # Returns
    /// - `Ok(Self)`: Manager ready to build
    /// - `Err(TransferError::ConfigError)`: If the settings fail validation
    ///
    /// # Examples
    /// ```ignore
    /// let manager = MqttManager::from_config(config.transport.clone())?;
    /// ```
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        validator::Validate::validate(&config)?;
        Ok(Self { config })
    }

    /// Creates a manager for one broker with every other setting defaulted.
    ///
    /// # Arguments
    /// - `host`: Broker hostname or IP
    /// - `port`: Broker port (usually 1883 or 8883)
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TransferError> {
        Self::from_config(Config {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Builds the client and spawns the connection kernel.
    ///
    /// Returns as soon as the kernel task is running; use
    /// [`MqttInstance::wait_connected`] to wait for the first CONNACK.
    ///
    /// # Returns
    /// - `Ok(MqttInstance)`: Ready to publish; requests queue until connected
    /// - `Err(TransferError)`: If credentials or TLS material cannot be loaded
    ///
    /// # Examples
    /// ```ignore
    /// let instance = manager.build_and_start().await?;
    /// instance.wait_connected(&shutdown).await?;
    /// ```
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Building MQTT connection to {}:{} with {} failover broker(s)",
            self.config.host,
            self.config.port,
            self.config.failover.len()
        );

        // Client for the primary broker, options for the rest
        let (client, event_loop, failover) = ClientBuilder::from_config(&self.config)?.build()?;

        let backoff = Backoff::from_config(&self.config);
        debug!(
            "Reconnect backoff: {}s initial, {}s max, saturates after {} attempt(s), limit {:?}",
            self.config.reconnect_delay,
            self.config.max_reconnect_delay,
            backoff.attempts_to_saturate(),
            backoff.max_attempts()
        );

        let disconnect_grace = Duration::from_millis(self.config.disconnect_grace_ms);
        // Only `MqttInstance::shutdown` cancels this token.
        let connection_cancel = CancellationToken::new();
        let kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            backoff,
            disconnect_grace,
            connection_cancel.clone(),
        )
        .with_failover(failover);
        let state_rx = kernel.subscribe_state();

        tokio::spawn(async move {
            if let Err(e) = kernel.run().await {
                error!("MQTT connection kernel exited with error: {}", e);
            }
        });

        Ok(MqttInstance {
            client,
            state_rx,
            publish_drain: Arc::new(PublishDrain::new()),
            connection_cancel,
            disconnect_grace,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Cloneable handle to a running connection.
///
/// Every clone shares the same client, state channel and drain.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    /// Request side of the `rumqttc` client
    client: AsyncClient,

    /// Latest state reported by the connection kernel
    state_rx: watch::Receiver<ConnectionState>,

    /// Publishes not yet handed to the event loop
    publish_drain: Arc<PublishDrain>,

    /// Stops the connection kernel
    connection_cancel: CancellationToken,

    /// Upper bound for each shutdown phase
    disconnect_grace: Duration,
}

impl MqttInstance {
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Hands one PUBLISH to the event loop.
    ///
    /// Completes when the request has been accepted by the client's request
    /// channel, which waits while the channel is full (e.g. during a broker
    /// outage). Dropping the future abandons the publish.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        let _guard = self.publish_drain.enter();
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Waits for the kernel to report `Connected`.
    ///
    /// Returns `Ok(false)` if `cancel` fires first, and an error if the kernel
    /// stops without ever connecting.
    pub async fn wait_connected(&self, cancel: &CancellationToken) -> Result<bool, TransferError> {
        let mut state_rx = self.state_rx.clone();
        loop {
            {
                let state = state_rx.borrow_and_update();
                if state.is_connected() {
                    return Ok(true);
                }
                if state.is_terminal() {
                    return Err(TransferError::ConnectionKernel(state.to_string()));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransferError::ConnectionKernel(
                            "connection kernel stopped".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Waits up to the disconnect grace for in-flight publishes, then stops
    /// the connection kernel and waits for it to finish.
    pub async fn shutdown(&self) {
        let grace = self.disconnect_grace;

        if tokio::time::timeout(grace, self.publish_drain.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "{} publish(es) still in flight after {} ms, disconnecting anyway",
                self.publish_drain.inflight(),
                grace.as_millis()
            );
        }

        self.connection_cancel.cancel();

        let mut state_rx = self.state_rx.clone();
        let stopped = async {
            while !state_rx.borrow_and_update().is_terminal() {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(grace * 2, stopped).await.is_err() {
            warn!("Connection kernel did not stop within {} ms", (grace * 2).as_millis());
        }
    }

    pub fn publish_drain(&self) -> Arc<PublishDrain> {
        Arc::clone(&self.publish_drain)
    }
}
