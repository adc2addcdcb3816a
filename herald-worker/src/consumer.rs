use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::FutureExt;
use herald_broker::{BrokerMessage, MessageHandler};
use herald_dedup::DedupGuard;
use herald_interfaces::{DeviceResolver, ResolveError, SessionCleanup};
use herald_models::{DeliveryOutcome, FailureKind, IdempotencyKey, WorkMessage};
use log::{debug, error, info, warn};
use tokio::time::{Instant, timeout_at};

use crate::sender::MessageSender;

/// Pause before a contended message comes back, on brokers that support it.
pub const DEFAULT_CONTENTION_BACKOFF: Duration = Duration::from_secs(1);

/// Broker call that ends a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    /// Requeue after the contention backoff.
    Defer,
    Drop,
}

impl Disposition {
    pub fn for_outcome(outcome: &DeliveryOutcome) -> Self {
        let Some(failure) = outcome.failure() else {
            return Disposition::Ack;
        };
        match failure.kind {
            // The message is consumed once its orphaned session is cleaned up.
            FailureKind::NotFound => Disposition::Ack,
            FailureKind::Malformed | FailureKind::SendPermanent => Disposition::Drop,
            FailureKind::Contention => Disposition::Defer,
            FailureKind::LookupError
            | FailureKind::SendTransient
            | FailureKind::Unknown => Disposition::Requeue,
        }
    }
}

/// Handler registered on the work topic. Holds no per-message state, so the broker
/// may run it for several deliveries at once.
pub struct MessageConsumer {
    guard: Arc<dyn DedupGuard>,
    resolver: Arc<dyn DeviceResolver>,
    cleanup: Arc<dyn SessionCleanup>,
    sender: MessageSender,
    contention_backoff: Duration,
}

impl MessageConsumer {
    pub fn new(
        guard: Arc<dyn DedupGuard>,
        resolver: Arc<dyn DeviceResolver>,
        cleanup: Arc<dyn SessionCleanup>,
        sender: MessageSender,
    ) -> Self {
        Self {
            guard,
            resolver,
            cleanup,
            sender,
            contention_backoff: DEFAULT_CONTENTION_BACKOFF,
        }
    }

    pub fn with_contention_backoff(mut self, backoff: Duration) -> Self {
        self.contention_backoff = backoff;
        self
    }

    /// Run one delivery attempt to its outcome. A key acquired here is released
    /// before this returns, on every path. Lookup, cleanup and send all share one
    /// deadline, so a key is held for at most the send timeout plus the disconnect
    /// grace.
    pub async fn process(&self, body: &[u8]) -> DeliveryOutcome {
        let work = match WorkMessage::from_slice(body) {
            Ok(work) => work,
            Err(err) => {
                warn!("Dropping malformed message ({} bytes): {}", body.len(), err);
                return DeliveryOutcome::failed(FailureKind::Malformed, err.to_string());
            }
        };
        let key = &work.idempotency_key;

        match self.guard.acquire(key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Session {} already has a delivery in flight", key);
                return DeliveryOutcome::failed(FailureKind::Contention, "key already held");
            }
            Err(err) => {
                warn!("Dedup guard unavailable for session {}: {}", key, err);
                return DeliveryOutcome::failed(FailureKind::Contention, err.to_string());
            }
        }

        let deadline = self.sender.deadline();
        let outcome = AssertUnwindSafe(self.deliver(&work, deadline))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                DeliveryOutcome::failed(FailureKind::Unknown, panic_message(panic.as_ref()))
            });

        if let Err(err) = self.guard.release(key).await {
            error!("Failed to release session {}: {}", key, err);
        }
        outcome
    }

    async fn deliver(&self, work: &WorkMessage, deadline: Instant) -> DeliveryOutcome {
        let key = &work.idempotency_key;
        let device = match timeout_at(deadline, self.resolver.resolve_device(key)).await {
            Ok(Ok(device)) => device,
            Ok(Err(ResolveError::NotFound(reason))) => {
                self.remove_orphaned_session(key, deadline).await;
                return DeliveryOutcome::failed(FailureKind::NotFound, reason);
            }
            Ok(Err(ResolveError::Lookup(reason))) => {
                return DeliveryOutcome::failed(FailureKind::LookupError, reason);
            }
            Err(_) => {
                return DeliveryOutcome::failed(
                    FailureKind::LookupError,
                    "device lookup ran past the attempt deadline",
                );
            }
        };

        match self
            .sender
            .send(&device, &work.recipient_address(), &work.payload, deadline)
            .await
        {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(err) if err.is_permanent() => {
                DeliveryOutcome::failed(FailureKind::SendPermanent, err.to_string())
            }
            Err(err) => DeliveryOutcome::failed(FailureKind::SendTransient, err.to_string()),
        }
    }

    async fn remove_orphaned_session(&self, key: &IdempotencyKey, deadline: Instant) {
        match timeout_at(deadline, self.cleanup.remove_orphaned_session(key)).await {
            Ok(Ok(true)) => info!("Removed orphaned session {} and its account", key),
            Ok(Ok(false)) => info!("No session records left to remove for {}", key),
            Ok(Err(err)) => warn!("Cleanup of orphaned session {} failed: {}", key, err),
            Err(_) => warn!("Cleanup of orphaned session {} ran past the deadline", key),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

fn log_outcome(outcome: &DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Delivered => info!("Message delivered"),
        DeliveryOutcome::PermanentFailure(failure) => match failure.kind {
            FailureKind::NotFound => info!("Device not found, message consumed: {}", failure),
            _ => warn!("Permanent failure, message dropped: {}", failure),
        },
        DeliveryOutcome::TransientFailure(failure) => match failure.kind {
            FailureKind::Contention => debug!("Requeued: {}", failure),
            FailureKind::Unknown => error!("Unclassified failure, requeued: {}", failure),
            _ => warn!("Transient failure, requeued: {}", failure),
        },
    }
}

#[async_trait]
impl MessageHandler for MessageConsumer {
    async fn handle(&self, message: BrokerMessage) {
        let outcome = self.process(message.body()).await;
        log_outcome(&outcome);

        let disposition = Disposition::for_outcome(&outcome);
        let settled = match disposition {
            Disposition::Ack => message.ack().await,
            Disposition::Requeue => message.nack(true).await,
            Disposition::Defer => message.requeue_after(self.contention_backoff).await,
            Disposition::Drop => message.nack(false).await,
        };
        if let Err(err) = settled {
            error!("Failed to settle delivery ({:?}): {}", disposition, err);
        }
    }
}
