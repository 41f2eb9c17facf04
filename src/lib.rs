//! prometheus2mqtt: republishes Prometheus query results over MQTT.
//!
//! A fixed set of named PromQL queries is evaluated on an interval and each
//! result is published to its own MQTT topic, either as a raw value or in
//! the Home Assistant discovery format.
//!
//! ## Modules
//!
//! * `config`: TOML configuration, defaults and validation.
//! * `core`: the scraper, the publisher variants and the ticker that drives
//!   them.
//! * `logger`: `tracing` subscriber setup (console and journald).
//!
//! The broker connection lives in the `p2m-mqtt` crate.

pub mod config;
pub mod core;
pub mod logger;
