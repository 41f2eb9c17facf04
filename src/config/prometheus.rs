//! `[prometheus]` section: where the queries are evaluated.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus server, e.g. `http://prometheus:9090`.
    #[validate(custom(function = "validate_http_url"))]
    pub url: String,

    #[validate(range(min = 1, message = "Connect timeout must be at least 1 ms"))]
    pub connect_timeout_ms: u64,

    /// HTTP basic auth, for servers behind a reverse proxy.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl PrometheusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            connect_timeout_ms: 5_000,
            username: None,
            password: None,
        }
    }
}

fn validate_http_url(url: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| {
        ValidationError::new("invalid_url")
            .with_message(format!("Invalid Prometheus URL '{}': {}", url, reason).into())
    };

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("no host".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PrometheusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_url_validation() {
        for good in ["http://prometheus:9090", "https://prom.example.com/prefix/"] {
            assert!(validate_http_url(good).is_ok(), "{good}");
        }
        for bad in ["", "prometheus:9090", "ftp://prom", "http://", "https:///"] {
            assert!(validate_http_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_unparseable_url_fails_validation() {
        for bad in ["http://host:notaport", "http://exa mple:9090", "http://[::1"] {
            let config = PrometheusConfig {
                url: bad.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{bad}");
        }
    }
}
