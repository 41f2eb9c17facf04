//! Prometheus instant queries.
//!
//! [`QueryEngine`] is the seam the scraper evaluates queries through;
//! [`HttpQueryEngine`] implements it over the Prometheus HTTP API
//! (`GET /api/v1/query`). Deadlines are applied by the caller: dropping the
//! returned future aborts the request.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::prometheus::PrometheusConfig;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prometheus responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Prometheus query failed ({error_type}): {message}")]
    Api { error_type: String, message: String },

    #[error("Unexpected Prometheus response: {0}")]
    Decode(String),
}

/// One point of an instant vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    /// `(timestamp, value)` pairs.
    pub points: Vec<(f64, f64)>,
}

/// Result of an instant query, by Prometheus result type.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Vector(Vec<Sample>),
    Matrix(Vec<Series>),
    Scalar(Sample),
    String(String),
}

impl QueryValue {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryValue::Vector(_) => "vector",
            QueryValue::Matrix(_) => "matrix",
            QueryValue::Scalar(_) => "scalar",
            QueryValue::String(_) => "string",
        }
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Evaluates `query` at the current server time.
    async fn query(&self, query: &str) -> Result<QueryValue, QueryError>;
}

pub struct HttpQueryEngine {
    client: Client,
    endpoint: String,
    auth: Option<(String, Option<String>)>,
}

impl HttpQueryEngine {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, QueryError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/query", base_url.trim_end_matches('/')),
            auth: None,
        })
    }

    pub fn from_config(config: &PrometheusConfig) -> Result<Self, QueryError> {
        let mut engine = Self::new(&config.url, config.connect_timeout())?;
        if let Some(username) = &config.username {
            engine = engine.with_basic_auth(username, config.password.as_deref());
        }
        Ok(engine)
    }

    pub fn with_basic_auth(mut self, username: &str, password: Option<&str>) -> Self {
        self.auth = Some((username.to_string(), password.map(str::to_string)));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl QueryEngine for HttpQueryEngine {
    async fn query(&self, query: &str) -> Result<QueryValue, QueryError> {
        trace!("Querying {} for {}", self.endpoint, query);

        let mut request = self.client.get(&self.endpoint).query(&[("query", query)]);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        // Prometheus returns a JSON error envelope with 400/422/503.
        let envelope: ApiResponse = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(QueryError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(e) => return Err(QueryError::Decode(e.to_string())),
        };

        for warning in &envelope.warnings {
            warn!("Prometheus warning for query '{}': {}", query, warning);
        }

        envelope.into_value()
    }
}

/// Formats a sample value as the shortest plain decimal that round-trips.
/// Non-finite values use the Prometheus spelling.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{}", value)
    }
}

fn parse_value(raw: &str) -> Result<f64, QueryError> {
    match raw {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| QueryError::Decode(format!("invalid sample value '{}'", other))),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<QueryData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorEntry>),
    Matrix(Vec<MatrixEntry>),
    Scalar((f64, String)),
    String((f64, String)),
}

#[derive(Debug, Deserialize)]
struct VectorEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// Absent for native histogram samples, which carry `histogram` instead.
    value: Option<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl ApiResponse {
    fn into_value(self) -> Result<QueryValue, QueryError> {
        if self.status != "success" {
            return Err(QueryError::Api {
                error_type: self.error_type.unwrap_or_else(|| "unknown".to_string()),
                message: self.error.unwrap_or_default(),
            });
        }

        let data = self
            .data
            .ok_or_else(|| QueryError::Decode("missing data in success response".into()))?;

        Ok(match data {
            QueryData::Vector(entries) => {
                let mut samples = Vec::with_capacity(entries.len());
                for entry in entries {
                    let Some((timestamp, raw)) = entry.value else {
                        continue;
                    };
                    samples.push(Sample {
                        labels: entry.metric,
                        value: parse_value(&raw)?,
                        timestamp,
                    });
                }
                QueryValue::Vector(samples)
            }
            QueryData::Matrix(entries) => QueryValue::Matrix(
                entries
                    .into_iter()
                    .map(|entry| {
                        let points = entry
                            .values
                            .iter()
                            .map(|(ts, raw)| parse_value(raw).map(|v| (*ts, v)))
                            .collect::<Result<_, _>>()?;
                        Ok(Series {
                            labels: entry.metric,
                            points,
                        })
                    })
                    .collect::<Result<_, QueryError>>()?,
            ),
            QueryData::Scalar((timestamp, raw)) => QueryValue::Scalar(Sample {
                labels: BTreeMap::new(),
                value: parse_value(&raw)?,
                timestamp,
            }),
            QueryData::String((_, value)) => QueryValue::String(value),
        })
    }
}
