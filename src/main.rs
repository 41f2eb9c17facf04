use std::{
    process,
    sync::{Arc, OnceLock},
};

use p2m_mqtt::MqttManager;
use prometheus2mqtt::{
    config::Config,
    core::{
        prometheus::HttpQueryEngine,
        publisher::{self, Broker},
        scraper::Scraper,
        ticker::Ticker,
    },
    logger::LoggerManager,
    print_error,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Cancels `shutdown` on Ctrl+C, or SIGTERM on Unix.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown"),
                    _ = terminate.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    ctrl_c().await;
    info!("Received Ctrl+C, initiating graceful shutdown");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() {
    let cfg = config();

    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });

    info!("Starting prometheus2mqtt version {}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.transport);

    let settings = cfg.broker_settings().unwrap_or_else(|e| {
        error!("Invalid publish settings: {}", e);
        process::exit(1);
    });

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!("Starting MQTT client...");
    let manager = MqttManager::from_config(cfg.transport.clone()).unwrap_or_else(|e| {
        error!("Failed to create MqttManager: {}", e);
        process::exit(1);
    });
    let instance = manager.build_and_start().await.unwrap_or_else(|e| {
        error!("Failed to build and start MQTT kernel: {}", e);
        process::exit(1);
    });

    match instance.wait_connected(&shutdown).await {
        Ok(true) => info!("Connected to MQTT broker {}:{}", cfg.transport.host, cfg.transport.port),
        Ok(false) => {
            instance.shutdown().await;
            info!("Shutdown complete");
            return;
        }
        Err(e) => {
            error!("Could not connect to MQTT broker: {}", e);
            process::exit(1);
        }
    }

    let engine = HttpQueryEngine::from_config(&cfg.prometheus).unwrap_or_else(|e| {
        error!("Failed to create Prometheus client: {}", e);
        process::exit(1);
    });
    info!("Querying Prometheus at {}", engine.endpoint());

    let broker: Arc<dyn Broker> = Arc::new(instance.clone());
    info!("Publishing in {} mode", cfg.publish.mode);
    let publisher = publisher::from_mode(cfg.publish.mode, broker, settings);

    let ticker = Ticker::new(
        Scraper::new(Arc::new(engine)),
        publisher,
        Arc::new(cfg.metrics.queries.clone()),
        cfg.cycle_budget(),
    );

    ticker.run(shutdown).await;

    debug!("Disconnecting from MQTT broker...");
    instance.shutdown().await;
    info!("Shutdown complete");
}
