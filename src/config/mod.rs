//! Application configuration loading and validation.
//!
//! The top-level [`Config`] aggregates the logger, Prometheus source,
//! metric queries, publishing layout and broker transport sections of a
//! single TOML file. It is loaded once at startup and never changes.
//!
//! ```toml
//! [prometheus]
//! url = "http://prometheus:9090"
//!
//! [metrics]
//! interval_secs = 15
//! scrape_timeout_ms = 3000
//!
//! [metrics.queries]
//! disks_flushes = "node_disk_flush_requests_total{device='sda'}"
//!
//! [publish]
//! mode = "discovery"
//!
//! [transport]
//! host = "mqtt"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use self::{
    logger::LoggerConfig,
    metrics::MetricsConfig,
    prometheus::PrometheusConfig,
    publish::{PublishConfig, PublishMode},
};
use crate::core::settings::{BrokerSettings, CycleBudget};

pub mod logger;
pub mod metrics;
pub mod prometheus;
pub mod publish;

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "P2M_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/prometheus2mqtt/config.toml";

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::now_rfc3339()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[doc(hidden)]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Transport configuration error: {0}")]
    Transport(#[from] p2m_mqtt::TransferError),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
#[validate(schema(function = "validate_discovery_identity"))]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub prometheus: PrometheusConfig,

    #[validate(nested)]
    pub metrics: MetricsConfig,

    #[validate(nested)]
    pub publish: PublishConfig,

    #[validate(nested)]
    pub transport: TransportConfig,
}

pub type TransportConfig = p2m_mqtt::Config;

/// Discovery topics and sensor names are derived from the client id, so it
/// must be stable across restarts.
fn validate_discovery_identity(config: &Config) -> Result<(), ValidationError> {
    if config.publish.mode == PublishMode::Discovery && config.transport.client_id.is_empty() {
        return Err(ValidationError::new("empty_client_id").with_message(
            "transport.client_id must be set when publish.mode is \"discovery\"".into(),
        ));
    }
    Ok(())
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it cannot be read,
    /// parsed or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `P2M_CONFIG` if set, else `/etc/prometheus2mqtt/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {} or create {}",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        Ok(BrokerSettings {
            topic_prefix: self.publish.topic_prefix.clone(),
            discovery_prefix: self.publish.discovery_prefix.clone(),
            client_id: self.transport.client_id.clone(),
            qos: p2m_mqtt::qos_from_u8(self.publish.qos)?,
            retain: self.publish.retain,
            publish_timeout: self.publish.publish_timeout(),
        })
    }

    pub fn cycle_budget(&self) -> CycleBudget {
        CycleBudget {
            interval: self.metrics.interval(),
            scrape_timeout: self.metrics.scrape_timeout(),
            publish_timeout: self.publish.publish_timeout(),
        }
    }
}
