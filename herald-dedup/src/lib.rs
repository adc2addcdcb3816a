mod errors;
pub mod memory;
pub mod redis_guard;

pub use errors::DedupError;
pub use memory::InMemoryDedupGuard;
pub use redis_guard::RedisDedupGuard;

use async_trait::async_trait;
use herald_models::IdempotencyKey;

/// Tracks which idempotency keys currently have a delivery attempt in flight.
#[async_trait]
pub trait DedupGuard: Send + Sync + 'static {
    /// Atomically mark `key` as held. `Ok(false)` means another attempt owns it.
    async fn acquire(&self, key: &IdempotencyKey) -> Result<bool, DedupError>;

    /// Clear the held state. A key that was never acquired is a no-op.
    async fn release(&self, key: &IdempotencyKey) -> Result<(), DedupError>;
}
