use std::time::Duration;

use async_trait::async_trait;
use herald_models::Recipient;
use thiserror::Error;

use crate::Device;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("device session is not connected")]
    NotConnected,
    #[error("device is logged out")]
    LoggedOut,
    #[error("recipient '{0}' cannot receive messages")]
    InvalidRecipient(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    /// Errors for which a retry can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SendError::LoggedOut | SendError::InvalidRecipient(_) | SendError::Rejected(_)
        )
    }
}

/// Opens protocol sessions for a resolved device.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    async fn open_session(&self, device: &Device) -> Result<Box<dyn ProtocolSession>, SendError>;
}

/// One open protocol session. Callers must `disconnect` every session they open.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn send_text(&self, recipient: &Recipient, body: &str) -> Result<(), SendError>;

    async fn disconnect(&self) -> Result<(), SendError>;
}
