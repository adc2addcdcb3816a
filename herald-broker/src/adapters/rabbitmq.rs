use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    dispatch::{LostSubscriptions, Subscription}, types::Acknowledger, Broker, BrokerError, BrokerMessage,
    MessageHandler,
};

const BACKEND: &str = "rabbitmq";
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

struct RabbitState {
    connection: Connection,
    publisher: Channel,
}

struct RabbitSubscription {
    subscription: Subscription,
    channel: Channel,
}

/// Classic-queue backend. Queues are declared durable, messages are published
/// persistent with publisher confirms, and consumption uses manual acknowledgement
/// with a prefetch equal to the in-flight limit.
pub struct RabbitMqBroker {
    uri: String,
    max_in_flight: u16,
    state: Mutex<Option<RabbitState>>,
    subscriptions: Mutex<Vec<RabbitSubscription>>,
    lost: LostSubscriptions,
}

impl RabbitMqBroker {
    pub fn new(uri: impl Into<String>, max_in_flight: u16) -> Self {
        Self {
            uri: uri.into(),
            max_in_flight: max_in_flight.max(1),
            state: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            lost: LostSubscriptions::default(),
        }
    }

    async fn publisher(&self) -> Result<Channel, BrokerError> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| state.publisher.clone())
            .ok_or(BrokerError::NotConnected)
    }

    async fn open_channel(&self, topic: &str) -> Result<Channel, BrokerError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(BrokerError::NotConnected)?;
        state
            .connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.connection.status().connected() {
                return Ok(());
            }
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::connection(BACKEND, err))?;
        let publisher = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::connection(BACKEND, err))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| BrokerError::connection(BACKEND, err))?;

        info!("Connected to RabbitMQ");
        *guard = Some(RabbitState {
            connection,
            publisher,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        let channel = self.publisher().await?;
        declare_queue(&channel, topic)
            .await
            .map_err(|err| BrokerError::publish(topic, err))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        let confirmation = channel
            .basic_publish("", topic, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|err| BrokerError::publish(topic, err))?
            .await
            .map_err(|err| BrokerError::publish(topic, err))?;

        if confirmation.is_nack() {
            return Err(BrokerError::publish(
                topic,
                "broker negatively acknowledged the message",
            ));
        }
        debug!("Published {} bytes to queue '{}'", body.len(), topic);
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let channel = self.open_channel(topic).await?;
        channel
            .basic_qos(self.max_in_flight, BasicQosOptions::default())
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?;
        declare_queue(&channel, topic)
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?;

        let consumer_tag = format!("herald-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                topic,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?;

        let deliveries = consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(BrokerMessage::new(
                    delivery.data,
                    delivery.redelivered,
                    Acknowledger::RabbitMq(delivery.acker),
                )),
                Err(err) => Err(BrokerError::Delivery(err.to_string())),
            })
            .boxed();

        info!("Registered consumer {} on queue '{}'", consumer_tag, topic);
        let subscription = Subscription::spawn(
            topic,
            deliveries,
            handler,
            usize::from(self.max_in_flight),
            self.lost.reporter(),
        );
        self.subscriptions.lock().await.push(RabbitSubscription {
            subscription,
            channel,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        let mut errors = Vec::new();

        for RabbitSubscription {
            subscription,
            channel,
        } in subscriptions
        {
            if let Err(err) = subscription.drain().await {
                errors.push(err);
            }
            if let Err(err) = channel.close(REPLY_SUCCESS, "consumer shutdown").await {
                errors.push(BrokerError::close_resource("consumer channel", err));
            }
        }

        if let Some(state) = self.state.lock().await.take() {
            if let Err(err) = state.publisher.close(REPLY_SUCCESS, "shutdown").await {
                errors.push(BrokerError::close_resource("channel", err));
            }
            if let Err(err) = state.connection.close(REPLY_SUCCESS, "shutdown").await {
                errors.push(BrokerError::close_resource("connection", err));
            }
        }

        if errors.is_empty() {
            info!("RabbitMQ connection closed");
        }
        BrokerError::from_close_errors(errors)
    }

    async fn subscription_lost(&self) -> String {
        self.lost.next().await
    }
}
