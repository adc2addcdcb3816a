use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    adapters::{nats::NatsBroker, rabbitmq::RabbitMqBroker},
    config::{BrokerKind, BrokerSettings},
    in_memory::InMemoryBroker,
    Broker, BrokerError, MessageHandler,
};

/// The backend chosen at startup. Fixed for the life of the process.
pub enum BrokerBackend {
    RabbitMq(RabbitMqBroker),
    Nats(NatsBroker),
    InMemory(InMemoryBroker),
}

impl BrokerBackend {
    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let backend = match settings.validate()? {
            BrokerKind::RabbitMq => BrokerBackend::RabbitMq(RabbitMqBroker::new(
                settings.rabbitmq_dsn.clone(),
                settings.max_in_flight,
            )),
            BrokerKind::Nats => BrokerBackend::Nats(NatsBroker::new(
                settings.nats_dsn.clone(),
                settings.nats_stream.clone(),
                settings.nats_durable.clone(),
                usize::from(settings.max_in_flight),
            )),
            BrokerKind::InMemory => {
                BrokerBackend::InMemory(InMemoryBroker::new(usize::from(settings.max_in_flight)))
            }
        };
        Ok(backend)
    }

    pub fn kind(&self) -> BrokerKind {
        match self {
            BrokerBackend::RabbitMq(_) => BrokerKind::RabbitMq,
            BrokerBackend::Nats(_) => BrokerKind::Nats,
            BrokerBackend::InMemory(_) => BrokerKind::InMemory,
        }
    }

    fn inner(&self) -> &dyn Broker {
        match self {
            BrokerBackend::RabbitMq(broker) => broker,
            BrokerBackend::Nats(broker) => broker,
            BrokerBackend::InMemory(broker) => broker,
        }
    }
}

#[async_trait]
impl Broker for BrokerBackend {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.inner().connect().await
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.inner().publish(topic, body).await
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        self.inner().consume(topic, handler).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner().close().await
    }

    async fn subscription_lost(&self) -> String {
        self.inner().subscription_lost().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        broker: BrokerSettings,
    }

    #[test]
    fn builds_the_selected_variant() {
        let cli = Cli::try_parse_from(["herald", "--driver", "Nats"]).unwrap();
        let backend = BrokerBackend::from_settings(&cli.broker).unwrap();
        assert_eq!(backend.kind(), BrokerKind::Nats);
    }

    #[test]
    fn unknown_driver_fails_construction() {
        let cli = Cli::try_parse_from(["herald", "--driver", "kafka"]).unwrap();
        assert!(matches!(
            BrokerBackend::from_settings(&cli.broker),
            Err(BrokerError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_variant_round_trips_through_the_enum() {
        let cli = Cli::try_parse_from(["herald", "--driver", "InMemory"]).unwrap();
        let backend = BrokerBackend::from_settings(&cli.broker).unwrap();
        backend.connect().await.unwrap();
        backend.publish("herald.messages", b"{}").await.unwrap();

        let BrokerBackend::InMemory(memory) = &backend else {
            panic!("expected the in-memory variant");
        };
        assert_eq!(memory.pending("herald.messages"), 1);
        backend.close().await.unwrap();
    }
}
