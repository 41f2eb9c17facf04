//! Evaluates the configured queries and turns each into one value string.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

use super::{
    deadline::{Deadline, Interrupted},
    prometheus::{format_value, QueryEngine, QueryError, QueryValue},
};
use crate::config::metrics::MetricQueries;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scraping exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("scraping cancelled")]
    Cancelled,

    #[error("query for metric {name} failed: {source}")]
    Transport {
        name: String,
        #[source]
        source: QueryError,
    },
}

/// Values gathered before the batch ended, plus the error that ended it
/// early, if any. Values are usable even when `error` is set.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub values: BTreeMap<String, String>,
    pub error: Option<ScrapeError>,
}

pub struct Scraper {
    engine: Arc<dyn QueryEngine>,
}

impl Scraper {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self { engine }
    }

    /// Runs the queries one after another under a single `deadline` for the
    /// whole batch and stops at the first query Prometheus could not answer.
    ///
    /// A query yielding an empty vector, a non-vector result or an unreadable
    /// result is left out of the values and does not fail the batch. Of
    /// several samples only the first is used.
    pub async fn scrape(&self, deadline: &Deadline, queries: &MetricQueries) -> ScrapeReport {
        let mut report = ScrapeReport::default();

        for (name, query) in queries {
            let result = match deadline.run(self.engine.query(query)).await {
                Ok(result) => result,
                Err(Interrupted::Elapsed) => {
                    report.error = Some(ScrapeError::Timeout(deadline.budget()));
                    return report;
                }
                Err(Interrupted::Cancelled) => {
                    report.error = Some(ScrapeError::Cancelled);
                    return report;
                }
            };

            match result {
                Ok(QueryValue::Vector(samples)) => match samples.first() {
                    Some(sample) => {
                        report
                            .values
                            .insert(name.clone(), format_value(sample.value));
                    }
                    None => debug!("Metric {} returned no samples. Skipping it", name),
                },
                Ok(other) => warn!(
                    "Metric {} is {} result, not a vector. Skipping it",
                    name,
                    other.kind()
                ),
                Err(QueryError::Decode(reason)) => warn!(
                    "Metric {} returned an unreadable result: {}. Skipping it",
                    name, reason
                ),
                Err(source) => {
                    report.error = Some(ScrapeError::Transport {
                        name: name.clone(),
                        source,
                    });
                    return report;
                }
            }
        }

        report
    }
}
