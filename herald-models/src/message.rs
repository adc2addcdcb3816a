use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-assigned identifier of one logical unit of work (the device session id).
///
/// Never empty: an empty key would serialize unrelated messages against each other
/// in the dedup guard, so it is rejected at deserialization time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(value: impl Into<String>) -> Result<Self, MalformedMessage> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(MalformedMessage::EmptyIdempotencyKey);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = MalformedMessage;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol address of the person receiving the message, with every `+` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient(String);

impl Recipient {
    pub fn parse(raw: &str) -> Self {
        Self(raw.trim().replace('+', ""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of work carried as the broker payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    #[serde(alias = "sessionId")]
    pub idempotency_key: IdempotencyKey,
    #[serde(alias = "to")]
    pub recipient: String,
    #[serde(alias = "message")]
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not a valid work message: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkMessage {
    pub fn new(
        idempotency_key: IdempotencyKey,
        recipient: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            idempotency_key,
            recipient: recipient.into(),
            payload: payload.into(),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, MalformedMessage> {
        let text = std::str::from_utf8(body).map_err(|_| MalformedMessage::NotUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn recipient_address(&self) -> Recipient {
        Recipient::parse(&self.recipient)
    }
}
