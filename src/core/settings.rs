//! Immutable runtime settings handed to the publisher and the ticker.
//!
//! Built once from [`crate::config::Config`] at startup.

use std::time::Duration;

use p2m_mqtt::QoS;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub client_id: String,
    pub qos: QoS,
    pub retain: bool,
    pub publish_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            topic_prefix: "p2m".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            client_id: "Prometheus2MQTT".to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBudget {
    pub interval: Duration,
    /// Shared by all queries of one cycle.
    pub scrape_timeout: Duration,
    /// Applied to each publish separately.
    pub publish_timeout: Duration,
}

impl Default for CycleBudget {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            scrape_timeout: Duration::from_secs(3),
            publish_timeout: Duration::from_secs(5),
        }
    }
}
