use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_broker::{Broker, MessageHandler, Settlement, in_memory::InMemoryBroker};
use herald_dedup::{DedupError, DedupGuard, InMemoryDedupGuard};
use herald_interfaces::{
    CleanupError, Device, DeviceResolver, ProtocolClient, ProtocolSession, ResolveError,
    SendError, SessionCleanup,
};
use herald_models::{IdempotencyKey, Recipient};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{consumer::MessageConsumer, sender::MessageSender};

pub const TOPIC: &str = "herald.messages";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    Acquire(String, bool),
    Release(String),
}

/// One entry in the order guard calls and settlements happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Guard(GuardEvent),
    Settled(Settlement),
}

pub type Timeline = Arc<Mutex<Vec<Step>>>;

/// In-memory guard that records every call made against it.
#[derive(Default)]
pub struct RecordingGuard {
    inner: InMemoryDedupGuard,
    timeline: Timeline,
    unavailable: bool,
}

impl RecordingGuard {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<GuardEvent> {
        self.timeline
            .lock()
            .iter()
            .filter_map(|step| match step {
                Step::Guard(event) => Some(event.clone()),
                Step::Settled(_) => None,
            })
            .collect()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.inner.is_held(&IdempotencyKey::new(key).unwrap())
    }
}

#[async_trait]
impl DedupGuard for RecordingGuard {
    async fn acquire(&self, key: &IdempotencyKey) -> Result<bool, DedupError> {
        if self.unavailable {
            return Err(DedupError::Unavailable("connection refused".into()));
        }
        let acquired = self.inner.acquire(key).await?;
        self.timeline
            .lock()
            .push(Step::Guard(GuardEvent::Acquire(key.to_string(), acquired)));
        Ok(acquired)
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<(), DedupError> {
        let released = self.inner.release(key).await;
        self.timeline
            .lock()
            .push(Step::Guard(GuardEvent::Release(key.to_string())));
        released
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ResolveBehavior {
    Found,
    NotFound,
    LookupFails,
    Panics,
}

pub struct FakeResolver {
    behavior: ResolveBehavior,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeResolver {
    pub fn new(behavior: ResolveBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every lookup sleeps for `delay` before answering.
    pub fn slow(behavior: ResolveBehavior, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(behavior)
        }
    }
}

#[async_trait]
impl DeviceResolver for FakeResolver {
    async fn resolve_device(&self, key: &IdempotencyKey) -> Result<Device, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            ResolveBehavior::Found => Ok(Device {
                session_id: key.clone(),
                jid: format!("{}@s.whatsapp.net", key),
            }),
            ResolveBehavior::NotFound => Err(ResolveError::NotFound(key.to_string())),
            ResolveBehavior::LookupFails => Err(ResolveError::Lookup("pool timed out".into())),
            ResolveBehavior::Panics => panic!("device table is corrupt"),
        }
    }
}

#[derive(Default)]
pub struct FakeCleanup {
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionCleanup for FakeCleanup {
    async fn remove_orphaned_session(&self, key: &IdempotencyKey) -> Result<bool, CleanupError> {
        self.removed.lock().push(key.to_string());
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SendBehavior {
    Deliver,
    Transport,
    LoggedOut,
    Disconnected,
    Hang,
}

#[derive(Default)]
pub struct ProtocolLog {
    pub opened: AtomicUsize,
    pub disconnected: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

/// Protocol fake. With a gate installed, every send announces itself on
/// `entered` and then waits for the gate before completing.
pub struct FakeProtocol {
    behavior: SendBehavior,
    pub log: Arc<ProtocolLog>,
    pub gate: Option<Arc<Notify>>,
    pub entered: Arc<Notify>,
    stuck_disconnect: bool,
}

impl FakeProtocol {
    pub fn new(behavior: SendBehavior) -> Self {
        Self {
            behavior,
            log: Arc::default(),
            gate: None,
            entered: Arc::new(Notify::new()),
            stuck_disconnect: false,
        }
    }

    /// Sessions whose `disconnect` never returns.
    pub fn stuck_on_disconnect(behavior: SendBehavior) -> Self {
        Self {
            stuck_disconnect: true,
            ..Self::new(behavior)
        }
    }

    pub fn gated(behavior: SendBehavior) -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new(behavior)
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn open_session(&self, _device: &Device) -> Result<Box<dyn ProtocolSession>, SendError> {
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            behavior: self.behavior,
            log: Arc::clone(&self.log),
            gate: self.gate.clone(),
            entered: Arc::clone(&self.entered),
            stuck_disconnect: self.stuck_disconnect,
        }))
    }
}

struct FakeSession {
    behavior: SendBehavior,
    log: Arc<ProtocolLog>,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
    stuck_disconnect: bool,
}

#[async_trait]
impl ProtocolSession for FakeSession {
    fn is_connected(&self) -> bool {
        !matches!(self.behavior, SendBehavior::Disconnected)
    }

    async fn send_text(&self, recipient: &Recipient, body: &str) -> Result<(), SendError> {
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match self.behavior {
            SendBehavior::Deliver => {
                self.log
                    .sent
                    .lock()
                    .push((recipient.to_string(), body.to_string()));
                Ok(())
            }
            SendBehavior::Transport => Err(SendError::Transport("connection reset".into())),
            SendBehavior::LoggedOut => Err(SendError::LoggedOut),
            SendBehavior::Disconnected => Err(SendError::NotConnected),
            SendBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        self.log.disconnected.fetch_add(1, Ordering::SeqCst);
        if self.stuck_disconnect {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// A consumer wired to fakes, fed by an in-memory broker.
pub struct Pipeline {
    pub broker: InMemoryBroker,
    pub guard: Arc<RecordingGuard>,
    pub resolver: Arc<FakeResolver>,
    pub cleanup: Arc<FakeCleanup>,
    pub protocol: Arc<FakeProtocol>,
    pub consumer: Arc<MessageConsumer>,
}

impl Pipeline {
    pub fn new(resolve: ResolveBehavior, send: SendBehavior) -> Self {
        Self::with_parts(
            RecordingGuard::default(),
            FakeResolver::new(resolve),
            FakeProtocol::new(send),
        )
    }

    pub fn with_parts(guard: RecordingGuard, resolver: FakeResolver, protocol: FakeProtocol) -> Self {
        Self::with_deadline(
            guard,
            resolver,
            protocol,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    /// A pipeline whose sender uses the given send timeout and disconnect grace.
    pub fn with_deadline(
        guard: RecordingGuard,
        resolver: FakeResolver,
        protocol: FakeProtocol,
        timeout: Duration,
        grace: Duration,
    ) -> Self {
        let guard = Arc::new(guard);
        let resolver = Arc::new(resolver);
        let cleanup = Arc::new(FakeCleanup::default());
        let protocol = Arc::new(protocol);
        let sender =
            MessageSender::new(protocol.clone(), timeout).with_disconnect_grace(grace);
        let consumer = Arc::new(
            MessageConsumer::new(guard.clone(), resolver.clone(), cleanup.clone(), sender)
                .with_contention_backoff(Duration::from_millis(10)),
        );

        let broker = InMemoryBroker::new(4);
        let timeline = Arc::clone(&guard.timeline);
        broker.observe_settlements(move |record| {
            timeline.lock().push(Step::Settled(record.settlement));
        });

        Self {
            broker,
            guard,
            resolver,
            cleanup,
            protocol,
            consumer,
        }
    }

    pub async fn enqueue(&self, body: &str) {
        self.broker.publish(TOPIC, body.as_bytes()).await.unwrap();
    }

    /// Take the next queued delivery and run the handler on it to completion.
    pub async fn deliver_next(&self) {
        let message = self.broker.try_take(TOPIC).expect("a queued delivery");
        self.consumer.handle(message).await;
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.broker
            .settlements()
            .into_iter()
            .map(|record| record.settlement)
            .collect()
    }

    /// Guard calls and settlements in the order they happened.
    pub fn timeline(&self) -> Vec<Step> {
        self.guard.timeline.lock().clone()
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.protocol.log.sent.lock().clone()
    }
}

pub fn work(key: &str, recipient: &str, payload: &str) -> String {
    format!(r#"{{"idempotencyKey":"{key}","recipient":"{recipient}","payload":"{payload}"}}"#)
}
