//! Publishing scraped values to the broker.
//!
//! [`Publisher`] is the capability the ticker drives once per metric. Two
//! variants exist, picked once at startup by [`from_mode`]:
//!
//! * [`Simple`] sends the raw value to `{topic_prefix}/{name}`.
//! * [`DiscoveryPublisher`] announces each metric to Home Assistant with a
//!   retained config message before its first value.
//!
//! Both go through the [`Broker`] seam, a single best-effort publish bounded
//! by a [`Deadline`]. Nothing is retried.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use p2m_mqtt::{MqttInstance, QoS, TransferError};
use thiserror::Error;
use tracing::debug;

use super::{
    deadline::{Deadline, Interrupted},
    settings::BrokerSettings,
};
use crate::config::publish::PublishMode;

mod discovery;
mod simple;

pub use discovery::{sanitize, DiscoveryPublisher, DiscoveryRecord};
pub use simple::Simple;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing to {topic} exceeded timeout of {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("publishing to {topic} cancelled")]
    Cancelled { topic: String },

    #[error("publishing to {topic} failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransferError,
    },

    #[error("could not send configuration message for metric {name}: {source}")]
    Configure {
        name: String,
        #[source]
        source: Box<PublishError>,
    },

    #[error("could not encode discovery payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    /// True when the shutdown token interrupted the publish, including a
    /// configuration message interrupted on the way.
    pub fn is_cancelled(&self) -> bool {
        match self {
            PublishError::Cancelled { .. } => true,
            PublishError::Configure { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Broker connection as seen by the publishers.
///
/// The returned future stands for the acknowledgment handle: it resolves
/// once the publish has been handed to the connection, and dropping it
/// abandons the publish.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError>;
}

#[async_trait]
impl Broker for MqttInstance {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        MqttInstance::publish(self, topic, qos, retain, payload).await
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one scraped value for metric `name`.
    async fn publish(&self, deadline: &Deadline, name: &str, value: &str)
        -> Result<(), PublishError>;
}

pub fn from_mode(
    mode: PublishMode,
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
) -> Arc<dyn Publisher> {
    match mode {
        PublishMode::Simple => Arc::new(Simple::new(broker, settings)),
        PublishMode::Discovery => Arc::new(DiscoveryPublisher::new(broker, settings)),
    }
}

/// One publish attempt with the configured flags, bounded by `deadline` and
/// by the configured publish timeout, whichever ends first.
async fn send(
    broker: &dyn Broker,
    settings: &BrokerSettings,
    deadline: &Deadline,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), PublishError> {
    let deadline = deadline.cap(settings.publish_timeout);

    match deadline
        .run(broker.publish(topic, settings.qos, settings.retain, payload))
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(PublishError::Transport {
            topic: topic.to_string(),
            source,
        }),
        Err(Interrupted::Elapsed) => Err(PublishError::Timeout {
            topic: topic.to_string(),
            timeout: deadline.budget(),
        }),
        Err(Interrupted::Cancelled) => Err(PublishError::Cancelled {
            topic: topic.to_string(),
        }),
    }
}

async fn send_value(
    broker: &dyn Broker,
    settings: &BrokerSettings,
    deadline: &Deadline,
    topic: &str,
    value: &str,
) -> Result<(), PublishError> {
    debug!("Sending {} to {}", value, topic);
    send(broker, settings, deadline, topic, value.as_bytes().to_vec()).await
}
