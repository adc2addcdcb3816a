use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    dispatch::{LostSubscriptions, Subscription},
    types::{Acknowledger, Settlement},
    Broker, BrokerError, BrokerMessage, MessageHandler,
};

struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct InFlight {
    topic: String,
    body: Vec<u8>,
}

/// One settled delivery, in the order the consumer settled them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub topic: String,
    pub body: Vec<u8>,
    pub settlement: Settlement,
}

type SettlementObserver = Arc<dyn Fn(&SettlementRecord) + Send + Sync>;

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    inflight: HashMap<Uuid, InFlight>,
    dead_letters: Vec<(String, Vec<u8>)>,
    settlements: Vec<SettlementRecord>,
    observers: Vec<SettlementObserver>,
}

/// Process-local broker with manual acknowledgement. Requeued messages go to the tail
/// of their topic; dropped messages are kept as dead letters.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    subscriptions: Arc<tokio::sync::Mutex<Vec<Subscription>>>,
    lost: Arc<LostSubscriptions>,
    max_in_flight: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryBroker {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            state: Arc::default(),
            notify: Arc::new(Notify::new()),
            subscriptions: Arc::default(),
            lost: Arc::default(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Pull one delivery from `topic` without a subscription.
    pub fn try_take(&self, topic: &str) -> Option<BrokerMessage> {
        let mut guard = self.state.lock();
        let queued = guard.queues.get_mut(topic)?.pop_front()?;
        let delivery_id = Uuid::new_v4();
        guard.inflight.insert(
            delivery_id,
            InFlight {
                topic: topic.to_string(),
                body: queued.body.clone(),
            },
        );
        drop(guard);

        let acker = InMemoryAcker {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            delivery_id,
            settled: false,
        };
        Some(BrokerMessage::new(
            queued.body,
            queued.redelivered,
            Acknowledger::InMemory(acker),
        ))
    }

    async fn next_delivery(&self, topic: &str) -> BrokerMessage {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take(topic) {
                return message;
            }

            notified.await;
        }
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state.lock().settlements.clone()
    }

    /// Call `observer` with every settlement from now on, at the moment it is applied
    /// and outside the broker lock.
    pub fn observe_settlements(
        &self,
        observer: impl Fn(&SettlementRecord) + Send + Sync + 'static,
    ) {
        self.state.lock().observers.push(Arc::new(observer));
    }

    pub fn dead_letters(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .filter(|(dead_topic, _)| dead_topic == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.state
            .lock()
            .queues
            .entry(topic.to_string())
            .or_default()
            .push_back(QueuedMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        self.notify.notify_waiters();
        debug!("Queued {} bytes on '{}'", body.len(), topic);
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let broker = self.clone();
        let owned_topic = topic.to_string();
        let deliveries = stream::unfold((broker, owned_topic), |(broker, topic)| async move {
            let message = broker.next_delivery(&topic).await;
            Some((Ok(message), (broker, topic)))
        })
        .boxed();

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
            let topic = subscription.topic().to_string();
            if let Err(err) = subscription.drain().await {
                errors.push(err);
            } else {
                info!("Drained in-memory subscription '{}'", topic);
            }
        }
        BrokerError::from_close_errors(errors)
    }

    async fn subscription_lost(&self) -> String {
        self.lost.next().await
    }
}

/// Settlement capability for one in-memory delivery. Dropping it unsettled puts the
/// message back on its queue, as a broker does when a consumer channel goes away.
pub(crate) struct InMemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    delivery_id: Uuid,
    settled: bool,
}

impl InMemoryAcker {
    pub(crate) fn settle(mut self, settlement: Settlement) {
        self.settled = true;
        self.apply(Some(settlement));
    }

    fn apply(&self, settlement: Option<Settlement>) {
        let mut guard = self.state.lock();
        let Some(delivery) = guard.inflight.remove(&self.delivery_id) else {
            return;
        };

        match settlement {
            Some(Settlement::Acked) => {}
            Some(Settlement::Dropped) => {
                guard
                    .dead_letters
                    .push((delivery.topic.clone(), delivery.body.clone()));
            }
            Some(Settlement::Requeued) | None => {
                guard
                    .queues
                    .entry(delivery.topic.clone())
                    .or_default()
                    .push_back(QueuedMessage {
                        body: delivery.body.clone(),
                        redelivered: true,
                    });
            }
        }

        let record = settlement.map(|settlement| SettlementRecord {
            topic: delivery.topic,
            body: delivery.body,
            settlement,
        });
        if let Some(record) = &record {
            guard.settlements.push(record.clone());
        }
        let observers = guard.observers.clone();
        drop(guard);

        if let Some(record) = &record {
            for observer in &observers {
                observer(record);
            }
        }
        self.notify.notify_waiters();
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled {
            self.apply(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct AckEverything {
        seen: Mutex<Vec<Vec<u8>>>,
        delay: Duration,
    }

    #[async_trait]
    impl MessageHandler for AckEverything {
        async fn handle(&self, message: BrokerMessage) {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().push(message.body().to_vec());
            message.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn nack_requeues_to_tail_or_drops() {
        let broker = InMemoryBroker::default();
        broker.publish("sends", b"first").await.unwrap();
        broker.publish("sends", b"second").await.unwrap();

        let first = broker.try_take("sends").unwrap();
        assert!(!first.redelivered());
        first.nack(true).await.unwrap();

        let second = broker.try_take("sends").unwrap();
        assert_eq!(second.body(), b"second");
        second.nack(false).await.unwrap();

        let again = broker.try_take("sends").unwrap();
        assert_eq!(again.body(), b"first");
        assert!(again.redelivered());
        again.ack().await.unwrap();

        assert_eq!(broker.pending("sends"), 0);
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(broker.dead_letters("sends"), vec![b"second".to_vec()]);
        let settlements: Vec<_> = broker
            .settlements()
            .into_iter()
            .map(|record| record.settlement)
            .collect();
        assert_eq!(
            settlements,
            vec![Settlement::Requeued, Settlement::Dropped, Settlement::Acked]
        );
    }

    #[tokio::test]
    async fn delayed_requeue_returns_the_message() {
        let broker = InMemoryBroker::default();
        broker.publish("sends", b"busy").await.unwrap();

        broker
            .try_take("sends")
            .unwrap()
            .requeue_after(Duration::from_secs(2))
            .await
            .unwrap();

        let again = broker.try_take("sends").unwrap();
        assert!(again.redelivered());
        assert_eq!(broker.settlements()[0].settlement, Settlement::Requeued);
    }

    #[tokio::test]
    async fn observers_see_each_settlement_once() {
        let broker = InMemoryBroker::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        broker.observe_settlements(move |record| recorder.lock().push(record.settlement));

        broker.publish("sends", b"a").await.unwrap();
        broker.publish("sends", b"b").await.unwrap();
        broker.publish("sends", b"c").await.unwrap();
        broker.try_take("sends").unwrap().ack().await.unwrap();
        broker.try_take("sends").unwrap().nack(false).await.unwrap();
        drop(broker.try_take("sends").unwrap());

        assert_eq!(*seen.lock(), vec![Settlement::Acked, Settlement::Dropped]);
    }

    #[tokio::test]
    async fn dropping_an_unsettled_delivery_returns_it() {
        let broker = InMemoryBroker::default();
        broker.publish("sends", b"lost").await.unwrap();

        drop(broker.try_take("sends").unwrap());

        assert_eq!(broker.pending("sends"), 1);
        assert!(broker.settlements().is_empty());
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_handlers() {
        let broker = InMemoryBroker::new(4);
        let handler = Arc::new(AckEverything {
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
        });

        broker.consume("sends", handler.clone()).await.unwrap();
        for body in [b"a", b"b", b"c"] {
            broker.publish("sends", body).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close().await.unwrap();

        assert_eq!(handler.seen.lock().len(), 3);
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(broker.settlements().len(), 3);
    }

    #[tokio::test]
    async fn consume_only_sees_its_topic() {
        let broker = InMemoryBroker::default();
        let handler = Arc::new(AckEverything {
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        });

        broker.consume("sends", handler.clone()).await.unwrap();
        broker.publish("other", b"ignored").await.unwrap();
        broker.publish("sends", b"wanted").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.settlements().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        broker.close().await.unwrap();

        assert_eq!(*handler.seen.lock(), vec![b"wanted".to_vec()]);
        assert_eq!(broker.pending("other"), 1);
    }
}
