pub mod adapters;
pub mod backend;
pub mod config;
mod dispatch;
mod errors;
pub mod in_memory;
mod types;

pub use backend::BrokerBackend;
pub use config::{BrokerKind, BrokerSettings};
pub use errors::BrokerError;
pub use types::{BrokerMessage, Settlement};

use std::sync::Arc;

use async_trait::async_trait;

/// Trait implemented by queue backends. Every backend uses manual acknowledgement:
/// a delivery leaves the queue only when its [`BrokerMessage`] is acked.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Establish and validate connectivity. Calling it again is a no-op.
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Register `handler` for every delivery on `topic`. Deliveries are dispatched
    /// on backend-managed tasks, possibly several at once.
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError>;

    /// Stop consuming, wait for in-flight handlers, then release channels and the
    /// connection. Every failure met on the way is reported.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Resolves with the topic of the first subscription whose delivery stream ended
    /// without `close` being called.
    async fn subscription_lost(&self) -> String;
}

/// Receives one delivery at a time and is responsible for settling it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: BrokerMessage);
}
