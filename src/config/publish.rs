//! `[publish]` section: topic layout and delivery flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Wire format of published values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Raw value on `{topic_prefix}/{name}`.
    Simple,
    /// Home Assistant MQTT discovery: one retained config message per metric,
    /// then values on the sensor state topic.
    #[default]
    #[serde(alias = "homeassistant")]
    Discovery,
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishMode::Simple => write!(f, "simple"),
            PublishMode::Discovery => write!(f, "discovery"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PublishConfig {
    pub mode: PublishMode,

    #[validate(length(min = 1, message = "Topic prefix must not be empty"))]
    pub topic_prefix: String,

    #[validate(length(min = 1, message = "Discovery prefix must not be empty"))]
    pub discovery_prefix: String,

    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    pub retain: bool,

    /// Budget for a single publish, in milliseconds.
    #[validate(range(min = 1, message = "Publish timeout must be at least 1 ms"))]
    pub publish_timeout_ms: u64,
}

impl PublishConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            mode: PublishMode::default(),
            topic_prefix: "p2m".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            qos: 1,
            retain: true,
            publish_timeout_ms: 5_000,
        }
    }
}
