use async_trait::async_trait;
use herald_models::IdempotencyKey;
use thiserror::Error;

/// A paired device able to send on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub session_id: IdempotencyKey,
    /// Protocol identity of the device, e.g. `5511999@s.whatsapp.net`.
    pub jid: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The session was never paired or its device was removed. Permanent.
    #[error("no device paired for session '{0}'")]
    NotFound(String),
    /// The store could not answer. Transient.
    #[error("device lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Error)]
#[error("session cleanup failed: {0}")]
pub struct CleanupError(pub String);

#[async_trait]
pub trait DeviceResolver: Send + Sync + 'static {
    async fn resolve_device(&self, key: &IdempotencyKey) -> Result<Device, ResolveError>;
}

/// Removes upstream records for a session whose device no longer exists.
#[async_trait]
pub trait SessionCleanup: Send + Sync + 'static {
    /// Returns whether any record was removed.
    async fn remove_orphaned_session(&self, key: &IdempotencyKey) -> Result<bool, CleanupError>;
}
