//! MedQ Worker - main entry point.
//!
//! Connects to the broker, builds the queue registry from the shipped job
//! definitions, and runs the worker runtime until a shutdown signal arrives.

use std::sync::Arc;

use medq_core::config::Config;
use medq_core::jobs::{
    default_definitions, LoggingGateway, QueueRegistry, RedisBroker, WorkerConfig, WorkerRuntime,
};
use medq_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize logging
    telemetry::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MedQ worker"
    );

    // Connect to the broker, retrying with capped backoff. Jobs already
    // durable in the broker are delayed by an outage, never dropped.
    let broker = {
        let mut attempt: u32 = 0;
        loop {
            match RedisBroker::connect(&config.broker).await {
                Ok(broker) => break Arc::new(broker),
                Err(e) => {
                    attempt += 1;
                    let delay = config.broker.reconnect.delay_for_attempt(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };

    // Build the registry from the static job definition list. The gateway is
    // injected by the host deployment; the logging gateway stands in here.
    let registry = Arc::new(QueueRegistry::register(
        broker,
        default_definitions(Arc::new(LoggingGateway)),
    )?);
    tracing::info!(queues = registry.len(), "Queue registry built");

    // Start processing
    let worker_config =
        WorkerConfig::from_settings(&config.worker, config.broker.reconnect.clone());
    let runtime = WorkerRuntime::start(registry, worker_config);

    shutdown_signal().await;

    runtime.shutdown();
    runtime.join().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
