mod config;
mod consumer;
mod sender;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use config::{Config, DedupBackend, parse_config};
use consumer::MessageConsumer;
use herald_broker::{Broker, BrokerBackend};
use herald_database::PgDeviceStore;
use herald_dedup::{DedupGuard, InMemoryDedupGuard, RedisDedupGuard};
use herald_gateway::HttpProtocolClient;
use herald_models::errors::{RuntimeError, SendableError};
use herald_utilities::startup;
use log::{error, info};
use sender::MessageSender;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup(
        "Herald Worker",
        config.log_level,
        config.log_file.as_deref(),
    )?;

    if let Err(err) = run(config).await {
        error!("Worker stopped: {}", err);
        return Err(err);
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), SendableError> {
    let broker = BrokerBackend::from_settings(&config.broker)
        .map_err(|err| RuntimeError::boxed("worker.broker.backend", err.to_string()))?;
    broker
        .connect()
        .await
        .map_err(|err| RuntimeError::boxed("worker.broker.connect", err.to_string()))?;
    info!("Broker backend: {}", config.broker_kind);

    let consumer = Arc::new(build_consumer(&config).await?);
    broker
        .consume(&config.broker.topic, consumer)
        .await
        .map_err(|err| RuntimeError::boxed("worker.broker.consume", err.to_string()))?;
    info!("Consuming work messages from '{}'", config.broker.topic);

    let stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Draining in-flight deliveries...");
            signal.map_err(|err| RuntimeError::boxed("worker.signal", err.to_string()))
        }
        topic = broker.subscription_lost() => {
            error!("Lost the subscription to '{}'. Shutting down.", topic);
            Err(RuntimeError::boxed(
                "worker.broker.subscription_lost",
                format!("delivery stream for '{topic}' ended"),
            ))
        }
    };

    broker
        .close()
        .await
        .map_err(|err| RuntimeError::boxed("worker.broker.close", err.to_string()))?;
    if stopped.is_ok() {
        info!("Worker stopped cleanly");
    }
    stopped
}

async fn build_consumer(config: &Config) -> Result<MessageConsumer, SendableError> {
    let guard = build_guard(config).await?;

    let store = Arc::new(
        PgDeviceStore::connect(&config.postgres_dsn, config.postgres_max_connections).await?,
    );

    let gateway = HttpProtocolClient::new(&config.gateway_url, config.send_timeout)
        .map_err(|err| RuntimeError::boxed("worker.gateway.client", err.to_string()))?;
    let sender = MessageSender::new(Arc::new(gateway), config.send_timeout);

    Ok(MessageConsumer::new(guard, store.clone(), store, sender)
        .with_contention_backoff(config.contention_backoff))
}

async fn build_guard(config: &Config) -> Result<Arc<dyn DedupGuard>, SendableError> {
    match config.dedup_backend {
        DedupBackend::Memory => {
            info!("Using in-process dedup guard");
            Ok(Arc::new(InMemoryDedupGuard::new()))
        }
        DedupBackend::Redis => {
            let guard = RedisDedupGuard::connect(&config.redis_dsn, config.dedup_ttl)
                .await
                .map_err(|err| RuntimeError::boxed("worker.dedup.connect", err.to_string()))?;
            Ok(Arc::new(guard))
        }
    }
}
