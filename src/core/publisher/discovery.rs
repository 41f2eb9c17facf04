//! Home Assistant MQTT discovery.
//!
//! The first publish of a metric sends a retained config message to
//! `{discovery_prefix}/sensor/{slug}/config` describing a sensor whose state
//! topic is `{discovery_prefix}/sensor/{slug}/state`, where `slug` is
//! `{client_id}_{name}` with every `/` replaced by `_`. Values then go to the
//! state topic as plain decimal strings.
//!
//! A metric counts as configured once its config message went out. There is
//! no way back: if the broker loses its retained messages the hub will not
//! see the sensor again until this process restarts.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{send, send_value, Broker, PublishError, Publisher};
use crate::core::{deadline::Deadline, settings::BrokerSettings};

const DEVICE_NAME: &str = "prometheus2mqtt";
const DEVICE_MANUFACTURER: &str = "prometheus2mqtt";

/// Replaces every `/` with `_`, so a name stays a single topic level.
pub fn sanitize(value: &str) -> String {
    value.replace('/', "_")
}

/// CRC-32 (IEEE) of `value` as 8 lowercase hex digits.
fn short_hash(value: &str) -> String {
    format!("{:08x}", crc32fast::hash(value.as_bytes()))
}

/// Topics and identity of a metric announced to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub name: String,
    pub sensor_name: String,
    pub state_topic: String,
    pub config_topic: String,
    pub device_identifier: String,
}

impl DiscoveryRecord {
    pub fn new(settings: &BrokerSettings, name: &str) -> Self {
        let slug = sanitize(&format!("{}_{}", settings.client_id, name));
        let sensor_name = format!("{}: {}", settings.client_id, name);

        Self {
            name: name.to_string(),
            device_identifier: short_hash(&sensor_name),
            state_topic: format!("{}/sensor/{}/state", settings.discovery_prefix, slug),
            config_topic: format!("{}/sensor/{}/config", settings.discovery_prefix, slug),
            sensor_name,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, PublishError> {
        let message = ConfigMessage {
            name: &self.sensor_name,
            state_topic: &self.state_topic,
            device: Device {
                manufacturer: DEVICE_MANUFACTURER,
                name: DEVICE_NAME,
                identifiers: &self.device_identifier,
                sw_version: env!("CARGO_PKG_VERSION"),
            },
        };
        Ok(serde_json::to_vec(&message)?)
    }
}

#[derive(Serialize)]
struct ConfigMessage<'a> {
    name: &'a str,
    state_topic: &'a str,
    device: Device<'a>,
}

#[derive(Serialize)]
struct Device<'a> {
    manufacturer: &'a str,
    name: &'a str,
    identifiers: &'a str,
    sw_version: &'a str,
}

pub struct DiscoveryPublisher {
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
    /// Metrics whose config message was accepted, by name.
    configured: Mutex<HashMap<String, DiscoveryRecord>>,
}

impl DiscoveryPublisher {
    pub fn new(broker: Arc<dyn Broker>, settings: BrokerSettings) -> Self {
        Self {
            broker,
            settings,
            configured: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_configured(&self, name: &str) -> bool {
        self.configured.lock().await.contains_key(name)
    }

    async fn configure(
        &self,
        deadline: &Deadline,
        record: &DiscoveryRecord,
    ) -> Result<(), PublishError> {
        info!(
            "Configuring sensor: {} (ID: {})",
            record.sensor_name, record.device_identifier
        );

        let payload = record.payload()?;
        debug!(
            "Configuring device on topic {} with payload {}",
            record.config_topic,
            String::from_utf8_lossy(&payload)
        );

        send(
            self.broker.as_ref(),
            &self.settings,
            deadline,
            &record.config_topic,
            payload,
        )
        .await
    }
}

#[async_trait]
impl Publisher for DiscoveryPublisher {
    /// Configures `name` first if needed, then sends `value` to its state
    /// topic. The two sends get a deadline each. A failed configuration is
    /// returned as [`PublishError::Configure`] and leaves `name` unconfigured,
    /// so the next call tries again.
    async fn publish(
        &self,
        deadline: &Deadline,
        name: &str,
        value: &str,
    ) -> Result<(), PublishError> {
        // Held across both sends so one name is never configured twice.
        let mut configured = self.configured.lock().await;

        let (state_topic, deadline) = match configured.get(name) {
            Some(record) => (record.state_topic.clone(), deadline.clone()),
            None => {
                let record = DiscoveryRecord::new(&self.settings, name);
                self.configure(deadline, &record)
                    .await
                    .map_err(|source| PublishError::Configure {
                        name: name.to_string(),
                        source: Box::new(source),
                    })?;

                let state_topic = record.state_topic.clone();
                configured.insert(name.to_string(), record);
                (state_topic, deadline.renew())
            }
        };

        send_value(
            self.broker.as_ref(),
            &self.settings,
            &deadline,
            &state_topic,
            value,
        )
        .await
    }
}
