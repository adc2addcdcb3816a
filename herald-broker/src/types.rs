use std::{fmt, time::Duration};

use async_nats::jetstream::{self, AckKind};
use lapin::options::{BasicAckOptions, BasicNackOptions};

use crate::{in_memory::InMemoryAcker, BrokerError};

/// How a delivery left the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Dropped,
}

pub(crate) enum Acknowledger {
    RabbitMq(lapin::acker::Acker),
    Nats(Box<jetstream::Message>),
    InMemory(InMemoryAcker),
}

/// Envelope handed to a [`crate::MessageHandler`]: the raw body plus the capability
/// to settle it. `ack` and `nack` consume the message, so each can be issued at most
/// once and never both.
pub struct BrokerMessage {
    body: Vec<u8>,
    redelivered: bool,
    acknowledger: Acknowledger,
}

impl BrokerMessage {
    pub(crate) fn new(body: Vec<u8>, redelivered: bool, acknowledger: Acknowledger) -> Self {
        Self {
            body,
            redelivered,
            acknowledger,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when the backend reports this is not the first delivery attempt.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Remove the message from the queue permanently.
    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acknowledger {
            Acknowledger::RabbitMq(acker) => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|err| BrokerError::Acknowledge(err.to_string())),
            Acknowledger::Nats(message) => message
                .ack()
                .await
                .map_err(|err| BrokerError::Acknowledge(err.to_string())),
            Acknowledger::InMemory(acker) => {
                acker.settle(Settlement::Acked);
                Ok(())
            }
        }
    }

    /// Return the message to the queue (`requeue = true`) or drop it for good.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        match self.acknowledger {
            Acknowledger::RabbitMq(acker) => acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
                .map_err(|err| BrokerError::Acknowledge(err.to_string())),
            Acknowledger::Nats(message) => {
                let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
                message
                    .ack_with(kind)
                    .await
                    .map_err(|err| BrokerError::Acknowledge(err.to_string()))
            }
            Acknowledger::InMemory(acker) => {
                acker.settle(if requeue {
                    Settlement::Requeued
                } else {
                    Settlement::Dropped
                });
                Ok(())
            }
        }
    }
}

impl BrokerMessage {
    /// Return the message to the queue, asking the backend to hold it back for
    /// `delay` first. JetStream honours the delay; AMQP classic queues have no
    /// per-message delay, so there this is a plain requeue.
    pub async fn requeue_after(self, delay: Duration) -> Result<(), BrokerError> {
        match self.acknowledger {
            Acknowledger::Nats(message) => message
                .ack_with(AckKind::Nak(Some(delay)))
                .await
                .map_err(|err| BrokerError::Acknowledge(err.to_string())),
            acknowledger => {
                Self {
                    acknowledger,
                    ..self
                }
                .nack(true)
                .await
            }
        }
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match self.acknowledger {
            Acknowledger::RabbitMq(_) => "rabbitmq",
            Acknowledger::Nats(_) => "nats",
            Acknowledger::InMemory(_) => "in-memory",
        };
        f.debug_struct("BrokerMessage")
            .field("backend", &backend)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
