//! `[metrics]` section: which queries to evaluate and how often.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Metric name to PromQL expression. Ordered so each cycle visits metrics in
/// the same order.
pub type MetricQueries = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between two cycles.
    #[validate(range(min = 1, message = "Interval must be at least 1 second"))]
    pub interval_secs: u64,

    /// Budget for evaluating the whole batch of queries, in milliseconds.
    #[validate(range(min = 1, message = "Scrape timeout must be at least 1 ms"))]
    pub scrape_timeout_ms: u64,

    #[validate(custom(function = "validate_queries"))]
    pub queries: MetricQueries,
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_millis(self.scrape_timeout_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            scrape_timeout_ms: 3_000,
            queries: BTreeMap::from([(
                "disks_flushes".to_string(),
                "node_disk_flush_requests_total{device='sda'}".to_string(),
            )]),
        }
    }
}

fn validate_queries(queries: &MetricQueries) -> Result<(), ValidationError> {
    if queries.is_empty() {
        return Err(ValidationError::new("no_queries")
            .with_message("At least one metric query must be configured".into()));
    }

    for (name, query) in queries {
        if name.trim().is_empty() {
            return Err(ValidationError::new("empty_metric_name")
                .with_message("Metric names must not be empty".into()));
        }
        if query.trim().is_empty() {
            return Err(ValidationError::new("empty_query")
                .with_message(format!("Query for metric '{}' is empty", name).into()));
        }
    }

    Ok(())
}
