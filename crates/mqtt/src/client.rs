//! `rumqttc` client construction.
//!
//! `ClientBuilder` turns a validated [`Config`] into an `AsyncClient` /
//! `EventLoop` pair, resolving credentials and loading TLS material on the
//! way. Failover brokers get their own `MqttOptions` sharing every other
//! setting with the primary. Nothing here touches the network; the
//! connection is opened by the first `EventLoop::poll`.

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};
use tracing::debug;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

pub struct ClientBuilder {
    opts: MqttOptions,
    failover: Vec<(String, u16)>,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Applies every transport setting, including credentials and TLS.
    ///
    /// # Errors
    ///
    /// `ConfigError` if the settings fail validation, `Credentials`/`Io` if a
    /// credential file cannot be read.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        validator::Validate::validate(config)?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };
        debug!("MQTT client id: {}", client_id);

        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);

        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        if let Some(credentials) = &config.credentials {
            if let Some((username, password)) = credentials.resolve()? {
                debug!("Using credentials for user '{}'", username);
                opts.set_credentials(username, password);
            }
        }

        let cap = config.request_channel_capacity.unwrap_or(10) as usize;

        let tls_config = config.tls.clone().filter(TlsConfig::is_enabled);

        Ok(Self {
            opts,
            failover: config.servers().into_iter().skip(1).collect(),
            cap,
            tls_config,
        })
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {}", e)))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("CA certificate path is not set".into()))?;
        let ca = fs::read(ca_path)?;

        let client_auth = match (&tls_config.client_cert_path, &tls_config.client_key_path) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Builds the client for the primary broker and returns the options for
    /// each failover broker alongside it.
    pub fn build(self) -> Result<(AsyncClient, EventLoop, Vec<MqttOptions>), TransferError> {
        let mut opts = self.opts;
        if let Some(tls_config) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls_config)?);
        }

        let failover = self
            .failover
            .iter()
            .map(|(host, port)| options_for(&opts, host, *port))
            .collect();
        let (client, event_loop) = AsyncClient::new(opts, self.cap);

        Ok((client, event_loop, failover))
    }
}

/// Copies every session setting of `template` onto a different broker.
fn options_for(template: &MqttOptions, host: &str, port: u16) -> MqttOptions {
    let mut opts = MqttOptions::new(template.client_id(), host, port);
    opts.set_keep_alive(template.keep_alive());
    opts.set_clean_session(template.clean_session());
    opts.set_inflight(template.inflight());
    opts.set_max_packet_size(template.max_packet_size(), template.max_packet_size());
    opts.set_transport(template.transport());
    if let Some((username, password)) = template.credentials() {
        opts.set_credentials(username, password);
    }
    opts
}

/// Maps the numeric QoS level from configuration onto `rumqttc::QoS`.
pub fn qos_from_u8(qos: u8) -> Result<QoS, TransferError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::InvalidQos(other)),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;
    use crate::config::CredentialsConfig;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
        password: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;

            let path = |name: &str| temp_dir.path().join(name);
            File::create(path("ca.crt"))?.write_all(b"ca certificate content")?;
            File::create(path("client.crt"))?.write_all(b"client certificate content")?;
            File::create(path("client.key"))?.write_all(b"client key content")?;
            File::create(path("password"))?.write_all(b"hunter2\n")?;

            let lossy = |name: &str| path(name).to_string_lossy().into_owned();
            Ok(TestFiles {
                ca_cert: lossy("ca.crt"),
                client_cert: lossy("client.crt"),
                client_key: lossy("client.key"),
                password: lossy("password"),
                _temp_dir: temp_dir,
            })
        }
    }

    fn tls_config(tls: TlsConfig) -> Config {
        Config {
            port: 8883,
            tls: Some(tls),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_tcp_client() {
        let builder = ClientBuilder::from_config(&Config::default()).unwrap();
        assert_eq!(builder.cap, 10);
        assert!(builder.tls_config.is_none());
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_tls_client_with_client_auth() {
        let files = TestFiles::new().expect("Failed to create test files");
        let config = tls_config(TlsConfig::new(
            &files.ca_cert,
            &files.client_cert,
            &files.client_key,
        ));

        let builder = ClientBuilder::from_config(&config).unwrap();
        assert!(builder.tls_config.as_ref().is_some_and(TlsConfig::has_client_auth));
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_tls_material_removed_after_validation() {
        let files = TestFiles::new().expect("Failed to create test files");
        let builder =
            ClientBuilder::from_config(&tls_config(TlsConfig::with_ca_only(&files.ca_cert)))
                .unwrap();
        drop(files);

        assert!(matches!(builder.build(), Err(TransferError::ClientSetup(_))));
    }

    #[test]
    fn test_missing_ca_is_rejected() {
        let config = tls_config(TlsConfig::with_ca_only("/nonexistent/ca.crt"));
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_config_resolves_credential_files() {
        let files = TestFiles::new().expect("Failed to create test files");
        let config = Config {
            credentials: Some(CredentialsConfig {
                username: Some("p2m".into()),
                password_file: Some(files.password.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.opts.credentials(),
            Some(("p2m".to_string(), "hunter2".to_string()))
        );
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_failover_options_share_session_settings() {
        let config = Config {
            host: "mqtt-a.lan".into(),
            keep_alive: 30,
            failover: vec![crate::config::BrokerAddress {
                host: "mqtt-b.lan".into(),
                port: 1884,
            }],
            credentials: Some(CredentialsConfig {
                username: Some("p2m".into()),
                password: Some("secret".into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (_client, event_loop, failover) =
            ClientBuilder::from_config(&config).unwrap().build().unwrap();

        assert_eq!(
            event_loop.mqtt_options.broker_address(),
            ("mqtt-a.lan".to_string(), 1883)
        );
        assert_eq!(failover.len(), 1);
        let backup = &failover[0];
        assert_eq!(backup.broker_address(), ("mqtt-b.lan".to_string(), 1884));
        assert_eq!(backup.client_id(), "Prometheus2MQTT");
        assert_eq!(backup.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            backup.credentials(),
            Some(("p2m".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_from_config_generates_client_id_when_empty() {
        let config = Config {
            client_id: String::new(),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.opts.client_id().len(), 36);
    }

    #[test]
    fn test_from_config_invalid() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_u8(3), Err(TransferError::InvalidQos(3))));
    }
}
