use std::sync::Arc;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::{
    dispatch::{LostSubscriptions, Subscription}, types::Acknowledger, Broker, BrokerError, BrokerMessage,
    MessageHandler,
};

const BACKEND: &str = "nats";

struct NatsState {
    client: async_nats::Client,
    context: jetstream::Context,
}

/// JetStream subject backend. Each consumed subject is bound to a stream (created on
/// demand) and read through a durable pull consumer with explicit acknowledgement.
pub struct NatsBroker {
    url: String,
    stream_name: Option<String>,
    durable_name: String,
    max_in_flight: usize,
    state: Mutex<Option<NatsState>>,
    subscriptions: Mutex<Vec<Subscription>>,
    lost: LostSubscriptions,
}

impl NatsBroker {
    pub fn new(
        url: impl Into<String>,
        stream_name: Option<String>,
        durable_name: impl Into<String>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            url: url.into(),
            stream_name,
            durable_name: durable_name.into(),
            max_in_flight: max_in_flight.max(1),
            state: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            lost: LostSubscriptions::default(),
        }
    }

    async fn context(&self) -> Result<jetstream::Context, BrokerError> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| state.context.clone())
            .ok_or(BrokerError::NotConnected)
    }

    fn stream_for(&self, subject: &str) -> String {
        self.stream_name
            .clone()
            .unwrap_or_else(|| stream_name_for_subject(subject))
    }
}

/// Stream names may not contain subject tokens, so derive one from the subject.
pub(crate) fn stream_name_for_subject(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let client = async_nats::connect(self.url.as_str())
            .await
            .map_err(|err| BrokerError::connection(BACKEND, err))?;
        let context = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");
        *guard = Some(NatsState { client, context });
        Ok(())
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        let context = self.context().await?;
        context
            .publish(topic.to_string(), body.to_vec().into())
            .await
            .map_err(|err| BrokerError::publish(topic, err))?
            .await
            .map_err(|err| BrokerError::publish(topic, err))?;
        debug!("Published {} bytes to subject '{}'", body.len(), topic);
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let context = self.context().await?;
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream_for(topic),
                subjects: vec![topic.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &self.durable_name,
                pull::Config {
                    durable_name: Some(self.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: topic.to_string(),
                    max_ack_pending: self.max_in_flight as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?;

        let deliveries = consumer
            .messages()
            .await
            .map_err(|err| BrokerError::subscribe(topic, err))?
            .map(|message| match message {
                Ok(message) => {
                    let redelivered = message
                        .info()
                        .map(|info| info.delivered > 1)
                        .unwrap_or(false);
                    Ok(BrokerMessage::new(
                        message.payload.to_vec(),
                        redelivered,
                        Acknowledger::Nats(Box::new(message)),
                    ))
                }
                Err(err) => Err(BrokerError::Delivery(err.to_string())),
            })
            .boxed();

        info!(
            "Registered durable consumer '{}' on subject '{}'",
            self.durable_name, topic
        );
        let subscription = Subscription::spawn(
            topic,
            deliveries,
            handler,
            self.max_in_flight,
            self.lost.reporter(),
        );
        self.subscriptions.lock().await.push(subscription);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        let mut errors = Vec::new();

        for subscription in subscriptions {
            if let Err(err) = subscription.drain().await {
                errors.push(err);
            }
        }

        if let Some(state) = self.state.lock().await.take() {
            if let Err(err) = state.client.flush().await {
                errors.push(BrokerError::close_resource("connection", err));
            }
        }

        if errors.is_empty() {
            info!("NATS connection closed");
        }
        BrokerError::from_close_errors(errors)
    }

    async fn subscription_lost(&self) -> String {
        self.lost.next().await
    }
}
