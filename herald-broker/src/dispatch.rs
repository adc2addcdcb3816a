use std::sync::Arc;

use futures_util::{stream::BoxStream, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, watch, Mutex, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};

use crate::{BrokerError, BrokerMessage, MessageHandler};

pub(crate) type DeliveryStream = BoxStream<'static, Result<BrokerMessage, BrokerError>>;

/// Topics whose delivery stream ended without a shutdown request, typically because
/// the broker connection dropped.
pub(crate) struct LostSubscriptions {
    reporter: mpsc::UnboundedSender<String>,
    lost: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Default for LostSubscriptions {
    fn default() -> Self {
        let (reporter, lost) = mpsc::unbounded_channel();
        Self {
            reporter,
            lost: Mutex::new(lost),
        }
    }
}

impl LostSubscriptions {
    pub(crate) fn reporter(&self) -> mpsc::UnboundedSender<String> {
        self.reporter.clone()
    }

    /// Wait for the next lost topic. Never resolves while every subscription is live.
    pub(crate) async fn next(&self) -> String {
        match self.lost.lock().await.recv().await {
            Some(topic) => topic,
            None => std::future::pending().await,
        }
    }
}

/// A running consume registration: one task pulling deliveries off a backend stream
/// and running the handler for each of them, at most `max_in_flight` at a time.
pub(crate) struct Subscription {
    topic: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn(
        topic: &str,
        deliveries: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        max_in_flight: usize,
        lost: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(dispatch_loop(
            topic.to_string(),
            deliveries,
            handler,
            max_in_flight.max(1),
            signal,
            lost,
        ));
        Self {
            topic: topic.to_string(),
            shutdown,
            task,
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop taking new deliveries, then wait until every handler already started
    /// has settled its message.
    pub(crate) async fn drain(self) -> Result<(), BrokerError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|err| BrokerError::close_resource("subscription", err))
    }
}

async fn dispatch_loop(
    topic: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    max_in_flight: usize,
    mut shutdown: watch::Receiver<bool>,
    lost: mpsc::UnboundedSender<String>,
) {
    let limiter = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();
    info!("Consuming '{}' with up to {} in-flight deliveries", topic, max_in_flight);

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    handler.handle(message).await;
                    drop(permit);
                });
            }
            Some(Err(err)) => {
                warn!("Delivery error on '{}': {}", topic, err);
            }
            None => {
                error!("Delivery stream for '{}' ended unexpectedly", topic);
                let _ = lost.send(topic.clone());
                break;
            }
        }

        while let Some(joined) = in_flight.join_next().now_or_never().flatten() {
            report_handler_exit(&topic, joined);
        }
    }

    debug!("Draining {} in-flight deliveries on '{}'", in_flight.len(), topic);
    while let Some(joined) = in_flight.join_next().await {
        report_handler_exit(&topic, joined);
    }
    info!("Subscription to '{}' stopped", topic);
}

fn report_handler_exit(topic: &str, joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!("Message handler for '{}' panicked: {}", topic, err);
        } else {
            warn!("Message handler for '{}' was cancelled: {}", topic, err);
        }
    }
}
