//! Broker connection settings.
//!
//! Deserialized from the `[transport]` table of the application config and
//! validated with `validator` before the client is built, so bad values fail
//! at load time rather than on the first connect.
//!
//! ```toml
//! [transport]
//! host = "mqtt.example.com"
//! port = 8883
//! client_id = "Prometheus2MQTT"
//! reconnect_delay = 1
//! max_reconnect_attempts = 0  # unlimited
//!
//! # Tried in order after `host` fails, then back to `host`.
//! [[transport.failover]]
//! host = "mqtt-backup.example.com"
//! port = 8883
//!
//! [transport.credentials]
//! username = "p2m"
//! password_file = "/run/secrets/mqtt_password"
//!
//! [transport.tls]
//! ca_cert_path = "/etc/mqtt/ca.pem"
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::TransferError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Additional brokers, rotated through on reconnect.
    #[validate(nested)]
    pub failover: Vec<BrokerAddress>,

    /// Empty means a random UUID is generated at startup.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Capacity of the request channel between `AsyncClient` and the event
    /// loop. A full channel makes publishes wait.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: Option<u8>,

    /// Initial reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Upper bound for the reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Max reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub max_reconnect_delay: u64,

    /// 0 retries forever.
    #[validate(range(
        max = 1000,
        message = "Max reconnect attempts must be between 0 and 1000"
    ))]
    pub max_reconnect_attempts: u32,

    #[validate(range(
        min = 1.0,
        max = 30.0,
        message = "Reconnect backoff multiplier must be between 1 and 30"
    ))]
    pub reconnect_backoff_multiplier: f64,

    /// How long a graceful disconnect waits for in-flight publishes, in
    /// milliseconds.
    #[validate(range(
        max = 60000,
        message = "Disconnect grace must not exceed 60000 ms"
    ))]
    pub disconnect_grace_ms: u64,

    #[validate(nested)]
    pub credentials: Option<CredentialsConfig>,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            failover: Vec::new(),
            client_id: "Prometheus2MQTT".to_string(),
            clean_session: true,
            max_inflight: 10,
            keep_alive: 60,
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(10),
            reconnect_delay: 5,
            max_reconnect_delay: 60,
            max_reconnect_attempts: 0,
            reconnect_backoff_multiplier: 2.0,
            disconnect_grace_ms: 50,
            credentials: None,
            tls: None,
        }
    }
}

impl Config {
    /// Every configured broker, primary first.
    pub fn servers(&self) -> Vec<(String, u16)> {
        std::iter::once((self.host.clone(), self.port))
            .chain(
                self.failover
                    .iter()
                    .map(|server| (server.host.clone(), server.port)),
            )
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BrokerAddress {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Failover host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(
        min = 1,
        max = 65535,
        message = "Failover port must be between 1 and 65535"
    ))]
    pub port: u16,
}

/// Username and password for the CONNECT packet.
///
/// `*_file` entries take precedence over the inline values and are meant for
/// mounted secrets; one trailing newline is stripped from the file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: Option<String>,

    pub password: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Username file does not exist"
    ))]
    pub username_file: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Password file does not exist"
    ))]
    pub password_file: Option<String>,
}

impl CredentialsConfig {
    /// Resolves the effective `(username, password)` pair.
    ///
    /// Returns `Ok(None)` when no username is configured at all. A username
    /// without any password source yields an empty password.
    pub fn resolve(&self) -> Result<Option<(String, String)>, TransferError> {
        let username = read_secret(self.username_file.as_deref(), self.username.as_deref())?;
        let password = read_secret(self.password_file.as_deref(), self.password.as_deref())?;

        match (username, password) {
            (Some(user), password) => Ok(Some((user, password.unwrap_or_default()))),
            (None, Some(_)) => Err(TransferError::Credentials(
                "password is configured without a username".into(),
            )),
            (None, None) => Ok(None),
        }
    }
}

fn read_secret(file: Option<&str>, inline: Option<&str>) -> Result<Option<String>, TransferError> {
    match file {
        Some(path) => {
            let contents = fs::read_to_string(path)?;
            Ok(Some(strip_trailing_newline(contents)))
        }
        None => Ok(inline.map(str::to_string)),
    }
}

fn strip_trailing_newline(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    value
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Cross-field checks the derive cannot express.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let ca = self.ca_cert_path.as_deref().ok_or_else(|| {
            ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into())
        })?;
        validate_file_path(ca)?;

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }

        Ok(())
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn secret_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_id, "Prometheus2MQTT");
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[test]
    fn test_empty_host_is_rejected() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiplier_below_one_is_rejected() {
        let config = Config {
            reconnect_backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_table_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            host = "broker.lan"
            port = 8883
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "broker.lan");
        assert_eq!(config.port, 8883);
        assert_eq!(config.keep_alive, 60);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_failover_servers_follow_primary() {
        let config: Config = toml::from_str(
            r#"
            host = "mqtt-a.lan"

            [[failover]]
            host = "mqtt-b.lan"
            port = 1884

            [[failover]]
            host = "mqtt-c.lan"
            port = 8883
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(
            config.servers(),
            vec![
                ("mqtt-a.lan".to_string(), 1883),
                ("mqtt-b.lan".to_string(), 1884),
                ("mqtt-c.lan".to_string(), 8883),
            ]
        );
    }

    #[test]
    fn test_invalid_failover_entry_is_rejected() {
        let config = Config {
            failover: vec![BrokerAddress {
                host: String::new(),
                port: 1883,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_inline() {
        let creds = CredentialsConfig {
            username: Some("user".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        assert_eq!(
            creds.resolve().unwrap(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_credentials_files_take_precedence_and_strip_newline() {
        let user = secret_file("file-user\n");
        let pass = secret_file("file-pass\r\n");
        let creds = CredentialsConfig {
            username: Some("inline-user".into()),
            password: Some("inline-pass".into()),
            username_file: Some(user.path().to_string_lossy().into_owned()),
            password_file: Some(pass.path().to_string_lossy().into_owned()),
        };

        assert!(creds.validate().is_ok());
        assert_eq!(
            creds.resolve().unwrap(),
            Some(("file-user".to_string(), "file-pass".to_string()))
        );
    }

    #[test]
    fn test_password_file_yields_password_not_username() {
        let pass = secret_file("only-the-password\n");
        let creds = CredentialsConfig {
            username: Some("user".into()),
            password_file: Some(pass.path().to_string_lossy().into_owned()),
            ..Default::default()
        };

        let (user, password) = creds.resolve().unwrap().unwrap();
        assert_eq!(user, "user");
        assert_eq!(password, "only-the-password");
    }

    #[test]
    fn test_credentials_without_username() {
        assert_eq!(CredentialsConfig::default().resolve().unwrap(), None);

        let creds = CredentialsConfig {
            password: Some("orphan".into()),
            ..Default::default()
        };
        assert!(matches!(
            creds.resolve(),
            Err(TransferError::Credentials(_))
        ));
    }

    #[test]
    fn test_missing_secret_file_fails_validation() {
        let creds = CredentialsConfig {
            username: Some("user".into()),
            password_file: Some("/nonexistent/secret".into()),
            ..Default::default()
        };
        assert!(creds.validate().is_err());
        assert!(matches!(creds.resolve(), Err(TransferError::Io(_))));
    }

    #[test]
    fn test_tls_incomplete_client_auth() {
        let ca = secret_file("ca");
        let cert = secret_file("cert");
        let tls = TlsConfig {
            ca_cert_path: Some(ca.path().to_string_lossy().into_owned()),
            client_cert_path: Some(cert.path().to_string_lossy().into_owned()),
            client_key_path: None,
        };
        assert!(tls.validate_config().is_err());
    }

    #[test]
    fn test_tls_ca_only_is_valid() {
        let ca = secret_file("ca");
        let tls = TlsConfig::with_ca_only(ca.path().to_string_lossy());
        assert!(tls.is_enabled());
        assert!(!tls.has_client_auth());
        assert!(tls.validate_config().is_ok());
    }
}
