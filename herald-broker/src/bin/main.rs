use std::path::PathBuf;

use clap::Parser;
use herald_broker::{Broker, BrokerBackend, BrokerSettings};
use herald_models::{
    errors::{RuntimeError, SendableError},
    IdempotencyKey, WorkMessage,
};
use herald_utilities::{logger::parse_level, startup};
use log::info;

/// Serialize one work message and publish it on the configured topic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(flatten)]
    broker: BrokerSettings,

    #[arg(long)]
    idempotency_key: String,

    #[arg(long)]
    recipient: String,

    #[arg(long)]
    payload: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    startup::startup(
        "Herald Publish",
        parse_level(&args.log_level)?,
        args.log_file.as_deref(),
    )?;

    let key = IdempotencyKey::new(args.idempotency_key)
        .map_err(|err| RuntimeError::boxed("publish.message.key", err.to_string()))?;
    let body = WorkMessage::new(key, args.recipient, args.payload)
        .to_json()
        .map_err(|err| RuntimeError::boxed("publish.message.encode", err.to_string()))?;

    let broker = BrokerBackend::from_settings(&args.broker)
        .map_err(|err| RuntimeError::boxed("publish.broker.backend", err.to_string()))?;
    broker
        .connect()
        .await
        .map_err(|err| RuntimeError::boxed("publish.broker.connect", err.to_string()))?;

    let published = broker.publish(&args.broker.topic, body.as_bytes()).await;
    let closed = broker.close().await;
    published.map_err(|err| RuntimeError::boxed("publish.broker.publish", err.to_string()))?;
    closed.map_err(|err| RuntimeError::boxed("publish.broker.close", err.to_string()))?;

    info!(
        "Published work message to '{}' via {}",
        args.broker.topic,
        broker.kind()
    );
    Ok(())
}
