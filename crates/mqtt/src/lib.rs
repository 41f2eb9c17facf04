//! # p2m-mqtt: broker connection for prometheus2mqtt
//!
//! A thin layer over `rumqttc` that owns the MQTT connection for the whole
//! process lifetime:
//!
//! - **Connection kernel** polling the event loop and reconnecting with
//!   exponential backoff
//! - **Connection state** published on a watch channel
//! - **Credentials** inline or from mounted secret files, optional TLS
//! - **Graceful disconnect** that waits for in-flight publishes
//!
//! # Quick Start
//!
//! ```ignore
//! let instance = p2m_mqtt::MqttManager::from_config(config)?
//!     .build_and_start()
//!     .await?;
//!
//! instance.wait_connected(&shutdown).await?;
//! instance
//!     .publish("p2m/up", rumqttc::QoS::AtLeastOnce, true, b"1".to_vec())
//!     .await?;
//!
//! instance.shutdown().await;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod state;

pub use client::qos_from_u8;
pub use config::{Config, CredentialsConfig, TlsConfig};
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager, PublishDrain};
pub use rumqttc::QoS;
pub use state::ConnectionState;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, TransferError>;
