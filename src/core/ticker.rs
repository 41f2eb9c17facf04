//! The scrape and publish loop.
//!
//! Every `interval` the [`Ticker`] scrapes all queries under one deadline,
//! then publishes whatever values came back, one metric at a time with a
//! fresh deadline each. Failures stay with the metric they happened to and
//! a panic stays with the cycle it happened in.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    deadline::Deadline,
    publisher::Publisher,
    scraper::{ScrapeError, Scraper},
    settings::CycleBudget,
};
use crate::config::metrics::MetricQueries;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("unexpected fault: {0}")]
    Fault(String),
}

/// Outcome counters of one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub scraped: usize,
    pub published: usize,
    pub failed: usize,
    /// Scraped but not attempted because the stop signal arrived.
    pub skipped: usize,
}

pub struct Ticker {
    scraper: Scraper,
    publisher: Arc<dyn Publisher>,
    queries: Arc<MetricQueries>,
    budget: CycleBudget,
}

impl Ticker {
    pub fn new(
        scraper: Scraper,
        publisher: Arc<dyn Publisher>,
        queries: Arc<MetricQueries>,
        budget: CycleBudget,
    ) -> Self {
        Self {
            scraper,
            publisher,
            queries,
            budget,
        }
    }

    /// Runs cycles until `cancel` fires. The first cycle starts one interval
    /// after the call. A cycle that overruns the interval delays the next
    /// one; missed ticks are not replayed.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.budget.interval.max(Duration::from_millis(1));
        info!(
            "Starting scraping for {} metric(s) every {:?}",
            self.queries.len(),
            period
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Received signal to stop");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_guarded(&cancel).await {
                        Ok(summary) => debug!("Cycle finished: {:?}", summary),
                        Err(e) => error!("Metrics cycle aborted: {}", e),
                    }
                }
            }
        }
    }

    /// One cycle with panics turned into [`CycleError::Fault`].
    pub async fn run_guarded(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, CycleError> {
        AssertUnwindSafe(self.run_cycle(cancel))
            .catch_unwind()
            .await
            .map_err(|panic| CycleError::Fault(panic_message(panic.as_ref())))
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();
        if cancel.is_cancelled() {
            return summary;
        }

        let deadline = Deadline::after(self.budget.scrape_timeout, cancel);
        let report = self.scraper.scrape(&deadline, &self.queries).await;

        match &report.error {
            None => {}
            Some(ScrapeError::Timeout(timeout)) => {
                warn!("Scraping metrics exceeded timeout of {:?}", timeout)
            }
            Some(ScrapeError::Cancelled) => debug!("Scraping cancelled"),
            Some(e @ ScrapeError::Transport { .. }) => {
                error!("Error occurred when scraping metrics: {}", e)
            }
        }

        summary.scraped = report.values.len();

        for (index, (name, value)) in report.values.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.skipped = summary.scraped - index;
                debug!("Stop requested, skipping {} metric(s)", summary.skipped);
                break;
            }

            let deadline = Deadline::after(self.budget.publish_timeout, cancel);
            match self.publisher.publish(&deadline, name, value).await {
                Ok(()) => summary.published += 1,
                Err(e) if e.is_cancelled() => {
                    summary.failed += 1;
                    debug!("Publishing metric {} cancelled: {}", name, e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("Error occurred when publishing metric {}: {}", name, e);
                }
            }
        }

        summary
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        publisher::{
            tests::{settings, MockBroker},
            DiscoveryPublisher, PublishError,
        },
        scraper::tests::{vector, MockEngine},
    };

    /// Records `(name, value)` pairs. Names in `failing` return an error,
    /// names in `panicking` panic, and `cancel_after` fires the given token
    /// once a publish has been recorded.
    #[derive(Default)]
    struct MockPublisher {
        published: Mutex<Vec<(String, String)>>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        cancel_after: Option<CancellationToken>,
    }

    impl MockPublisher {
        fn names(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        async fn publish(
            &self,
            _deadline: &Deadline,
            name: &str,
            value: &str,
        ) -> Result<(), PublishError> {
            if self.panicking.contains(name) {
                panic!("publisher exploded on {}", name);
            }
            self.published
                .lock()
                .unwrap()
                .push((name.to_string(), value.to_string()));
            if let Some(cancel) = &self.cancel_after {
                cancel.cancel();
            }
            if self.failing.contains(name) {
                return Err(PublishError::Timeout {
                    topic: format!("p2m/{}", name),
                    timeout: Duration::from_millis(1),
                });
            }
            Ok(())
        }
    }

    fn engine() -> MockEngine {
        MockEngine::default()
            .with("a", Ok(vector(&[1.0])))
            .with("b", Ok(vector(&[2.0])))
            .with("c", Ok(vector(&[3.0])))
    }

    fn queries() -> Arc<MetricQueries> {
        Arc::new(
            [("a", "a"), ("b", "b"), ("c", "c")]
                .into_iter()
                .map(|(name, query)| (name.to_string(), query.to_string()))
                .collect(),
        )
    }

    fn budget() -> CycleBudget {
        CycleBudget {
            interval: Duration::from_secs(10),
            scrape_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(1),
        }
    }

    fn ticker(engine: MockEngine, publisher: Arc<dyn Publisher>) -> Ticker {
        Ticker::new(
            Scraper::new(Arc::new(engine)),
            publisher,
            queries(),
            budget(),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_failure_does_not_block_other_metrics() {
        let publisher = Arc::new(MockPublisher {
            failing: HashSet::from(["a".to_string()]),
            ..Default::default()
        });
        let ticker = ticker(engine(), publisher.clone());

        let summary = ticker.run_guarded(&CancellationToken::new()).await.unwrap();

        assert_eq!(publisher.names(), vec!["a", "b", "c"]);
        assert_eq!(
            summary,
            CycleSummary {
                scraped: 3,
                published: 2,
                failed: 1,
                skipped: 0,
            }
        );
        assert!(logs_contain("Error occurred when publishing metric a"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_partial_scrape_is_still_published() {
        let engine = engine().with("b", Err("connection refused".into()));
        let publisher = Arc::new(MockPublisher::default());
        let ticker = ticker(engine, publisher.clone());

        let summary = ticker.run_guarded(&CancellationToken::new()).await.unwrap();

        assert_eq!(publisher.names(), vec!["a"]);
        assert_eq!(summary.published, 1);
        assert!(logs_contain("Error occurred when scraping metrics"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_scrape_timeout_is_logged_distinctly() {
        let engine = engine().delayed(Duration::from_millis(400));
        let publisher = Arc::new(MockPublisher::default());
        let ticker = ticker(engine, publisher.clone());

        let summary = ticker.run_guarded(&CancellationToken::new()).await.unwrap();

        assert_eq!(publisher.names(), vec!["a", "b"]);
        assert_eq!(summary.scraped, 2);
        assert!(logs_contain("Scraping metrics exceeded timeout"));
        assert!(!logs_contain("Error occurred when scraping metrics"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_is_contained_to_the_cycle() {
        let publisher = Arc::new(MockPublisher {
            panicking: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        let ticker = ticker(engine(), publisher.clone());

        let err = ticker
            .run_guarded(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CycleError::Fault(ref msg) if msg == "publisher exploded on b"));
        assert_eq!(publisher.names(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_loop_survives_panicking_cycles() {
        let publisher = Arc::new(MockPublisher {
            panicking: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        let ticker = Arc::new(ticker(engine(), publisher.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let ticker = ticker.clone();
            let cancel = cancel.clone();
            async move { ticker.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Ticks at 10s, 20s and 30s, each reaching "a" before the panic.
        assert_eq!(publisher.names(), vec!["a", "a", "a"]);
        assert!(logs_contain("Metrics cycle aborted"));
        assert!(logs_contain("Received signal to stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_runs_after_one_interval() {
        let publisher = Arc::new(MockPublisher::default());
        let ticker = Arc::new(ticker(engine(), publisher.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let ticker = ticker.clone();
            let cancel = cancel.clone();
            async move { ticker.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(publisher.names().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(publisher.names().len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_delays_next_tick() {
        // Each query takes 8s against a 10s interval and a 30s scrape budget.
        let engine = engine().delayed(Duration::from_secs(8));
        let publisher = Arc::new(MockPublisher::default());
        let ticker = Arc::new(Ticker::new(
            Scraper::new(Arc::new(engine)),
            publisher.clone(),
            queries(),
            CycleBudget {
                scrape_timeout: Duration::from_secs(30),
                ..budget()
            },
        ));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let ticker = ticker.clone();
            let cancel = cancel.clone();
            async move { ticker.run(cancel).await }
        });

        // First cycle runs 10s..34s, the missed ticks collapse into one at 34s.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(publisher.names().len(), 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(publisher.names().len(), 6);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_cycle_stops_before_next_metric() {
        let cancel = CancellationToken::new();
        let publisher = Arc::new(MockPublisher {
            cancel_after: Some(cancel.clone()),
            ..Default::default()
        });
        let ticker = ticker(engine(), publisher.clone());

        let summary = ticker.run_guarded(&cancel).await.unwrap();

        assert_eq!(publisher.names(), vec!["a"]);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_cancelled_configure_is_not_reported_as_failure() {
        let broker = Arc::new(MockBroker::default());
        broker.stall("homeassistant/sensor/p2m_a/config");
        let publisher = Arc::new(DiscoveryPublisher::new(broker, settings()));
        let ticker = ticker(engine(), publisher.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let summary = ticker.run_guarded(&cancel).await.unwrap();

        assert_eq!((summary.failed, summary.skipped), (1, 2));
        assert!(!publisher.is_configured("a").await);
        assert!(logs_contain("Publishing metric a cancelled"));
        assert!(!logs_contain("Error occurred when publishing metric a"));
    }

    #[tokio::test]
    async fn test_cancelled_before_cycle_does_nothing() {
        let publisher = Arc::new(MockPublisher::default());
        let engine = Arc::new(engine());
        let ticker = Ticker::new(
            Scraper::new(engine.clone()),
            publisher.clone(),
            queries(),
            budget(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = ticker.run_guarded(&cancel).await.unwrap();

        assert_eq!(summary, CycleSummary::default());
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_promptly_on_cancel() {
        let ticker = ticker(engine(), Arc::new(MockPublisher::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        ticker.run(cancel).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_discovery_cycles_configure_once_and_isolate_failures() {
        let broker = Arc::new(MockBroker::default());
        broker.fail("homeassistant/sensor/p2m_a/config");
        let publisher = Arc::new(DiscoveryPublisher::new(broker.clone(), settings()));
        let ticker = ticker(engine(), publisher.clone());
        let cancel = CancellationToken::new();

        let first = ticker.run_guarded(&cancel).await.unwrap();
        assert_eq!((first.published, first.failed), (2, 1));
        assert!(logs_contain(
            "could not send configuration message for metric a"
        ));

        broker.recover("homeassistant/sensor/p2m_a/config");
        let second = ticker.run_guarded(&cancel).await.unwrap();
        assert_eq!((second.published, second.failed), (3, 0));

        let topics = broker.topics();
        let count = |topic: &str| topics.iter().filter(|t| *t == topic).count();
        assert_eq!(count("homeassistant/sensor/p2m_a/config"), 2);
        assert_eq!(count("homeassistant/sensor/p2m_a/state"), 1);
        assert_eq!(count("homeassistant/sensor/p2m_b/config"), 1);
        assert_eq!(count("homeassistant/sensor/p2m_b/state"), 2);
    }
}
