use serde::{Deserialize, Serialize};

/// Returned by the gateway after it attaches a protocol session to a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendTextRequest<'a> {
    pub to: &'a str,
    pub text: &'a str,
}
