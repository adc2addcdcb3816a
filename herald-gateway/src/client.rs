use std::time::Duration;

use async_trait::async_trait;
use herald_interfaces::{Device, ProtocolClient, ProtocolSession, SendError};
use herald_models::Recipient;
use log::debug;
use reqwest::{Client, Response};
use url::Url;

use crate::{
    error::{GatewayError, Stage},
    types::{OpenSessionResponse, SendTextRequest},
};

type Result<T> = std::result::Result<T, GatewayError>;

/// Protocol client backed by an HTTP gateway that owns the device connections.
#[derive(Clone)]
pub struct HttpProtocolClient {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpProtocolClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Self::with_client(base_url, client, request_timeout)
    }

    pub fn with_client(base_url: &str, client: Client, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|source| GatewayError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::CannotBeABase(base_url));
        }
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    async fn open(&self, device: &Device) -> Result<OpenSessionResponse> {
        let url = build_url(&self.base_url, &["devices", &device.jid, "sessions"])?;
        let response = self.client.post(url.clone()).send().await?;
        let response = handle_response(url, response).await?;
        Ok(response.json::<OpenSessionResponse>().await?)
    }
}

/// Append path segments to the base URL, percent-encoding each one.
pub(crate) fn build_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| GatewayError::CannotBeABase(base.clone()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn handle_response(url: Url, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".into());
        Err(GatewayError::Http {
            status,
            url,
            message,
        })
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn open_session(
        &self,
        device: &Device,
    ) -> std::result::Result<Box<dyn ProtocolSession>, SendError> {
        let opened = self
            .open(device)
            .await
            .map_err(|err| err.into_send_error(Stage::Open, self.request_timeout))?;

        debug!(
            "Opened gateway session {} for device {} (connected: {})",
            opened.session_id, device.jid, opened.connected
        );
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            request_timeout: self.request_timeout,
            session_id: opened.session_id,
            connected: opened.connected,
        }))
    }
}

/// One gateway-side session. Dropping it without `disconnect` leaves the gateway
/// to reap it on its own schedule.
pub struct HttpSession {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
    session_id: String,
    connected: bool,
}

impl HttpSession {
    async fn post_text(&self, recipient: &Recipient, body: &str) -> Result<()> {
        let url = build_url(&self.base_url, &["sessions", &self.session_id, "messages"])?;
        let request = SendTextRequest {
            to: recipient.as_str(),
            text: body,
        };
        let response = self.client.post(url.clone()).json(&request).send().await?;
        handle_response(url, response).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let url = build_url(&self.base_url, &["sessions", &self.session_id])?;
        let response = self.client.delete(url.clone()).send().await?;
        handle_response(url, response).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolSession for HttpSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_text(
        &self,
        recipient: &Recipient,
        body: &str,
    ) -> std::result::Result<(), SendError> {
        self.post_text(recipient, body)
            .await
            .map_err(|err| err.into_send_error(Stage::Send, self.request_timeout))
    }

    async fn disconnect(&self) -> std::result::Result<(), SendError> {
        self.delete()
            .await
            .map_err(|err| err.into_send_error(Stage::Disconnect, self.request_timeout))
    }
}
