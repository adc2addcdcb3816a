use std::{sync::Arc, time::Duration};

use herald_interfaces::{Device, ProtocolClient, SendError};
use herald_models::Recipient;
use log::{debug, warn};
use tokio::time::{Instant, timeout_at};

/// Time allowed for `disconnect` past the attempt deadline.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Delivers one message per call through a fresh protocol session.
///
/// Opening the session and sending must finish by the caller's deadline; running
/// past it is a [`SendError::Timeout`]. A session that was opened is always
/// disconnected before `send` returns, with at most the disconnect grace on top of
/// the deadline.
pub struct MessageSender {
    client: Arc<dyn ProtocolClient>,
    timeout: Duration,
    disconnect_grace: Duration,
}

impl MessageSender {
    pub fn new(client: Arc<dyn ProtocolClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
        }
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    /// Deadline for an attempt starting now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    pub async fn send(
        &self,
        device: &Device,
        recipient: &Recipient,
        payload: &str,
        deadline: Instant,
    ) -> Result<(), SendError> {
        if recipient.as_str().is_empty() {
            return Err(SendError::InvalidRecipient(recipient.to_string()));
        }

        let session = timeout_at(deadline, self.client.open_session(device))
            .await
            .map_err(|_| SendError::Timeout(self.timeout))??;

        let result = if session.is_connected() {
            timeout_at(deadline, session.send_text(recipient, payload))
                .await
                .unwrap_or(Err(SendError::Timeout(self.timeout)))
        } else {
            Err(SendError::NotConnected)
        };

        match timeout_at(deadline + self.disconnect_grace, session.disconnect()).await {
            Ok(Ok(())) => debug!("Disconnected session for device {}", device.jid),
            Ok(Err(err)) => warn!("Failed to disconnect device {}: {}", device.jid, err),
            Err(_) => warn!("Disconnect of device {} timed out", device.jid),
        }

        result
    }
}
