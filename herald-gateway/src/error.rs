use std::{fmt, time::Duration};

use herald_interfaces::SendError;
use reqwest::StatusCode;
use thiserror::Error;
use url::{ParseError, Url};

/// Which gateway call failed. The same status means different things per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Open,
    Send,
    Disconnect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Open => "open session",
            Stage::Send => "send message",
            Stage::Disconnect => "disconnect",
        })
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid gateway base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: ParseError,
    },

    #[error("gateway base URL '{0}' cannot carry a path")]
    CannotBeABase(Url),

    #[error("gateway request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gateway returned {status} for {url}: {message}")]
    Http {
        status: StatusCode,
        url: Url,
        message: String,
    },
}

impl GatewayError {
    /// Map a gateway failure onto the send taxonomy. Statuses are matched one by one;
    /// anything not listed stays transient.
    pub fn into_send_error(self, stage: Stage, timeout: Duration) -> SendError {
        match self {
            GatewayError::Request(err) if err.is_timeout() => SendError::Timeout(timeout),
            GatewayError::Http { status, message, .. } => classify_status(stage, status, message),
            other => SendError::Transport(other.to_string()),
        }
    }
}

pub(crate) fn classify_status(stage: Stage, status: StatusCode, message: String) -> SendError {
    match (stage, status) {
        (_, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE) => {
            SendError::LoggedOut
        }
        (Stage::Open, StatusCode::NOT_FOUND) => SendError::LoggedOut,
        (Stage::Send, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND) => {
            SendError::InvalidRecipient(message)
        }
        (_, StatusCode::UNPROCESSABLE_ENTITY) => SendError::Rejected(message),
        (_, StatusCode::CONFLICT) => SendError::NotConnected,
        (_, status) => SendError::Transport(format!("{status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(stage: Stage, code: u16) -> SendError {
        classify_status(stage, StatusCode::from_u16(code).unwrap(), "body".into())
    }

    #[test]
    fn auth_failures_mean_the_device_logged_out() {
        for code in [401, 403, 410] {
            assert!(matches!(classify(Stage::Send, code), SendError::LoggedOut));
        }
        assert!(matches!(classify(Stage::Open, 404), SendError::LoggedOut));
    }

    #[test]
    fn send_refusals_are_permanent() {
        assert!(matches!(
            classify(Stage::Send, 404),
            SendError::InvalidRecipient(_)
        ));
        assert!(matches!(
            classify(Stage::Send, 400),
            SendError::InvalidRecipient(_)
        ));
        assert!(matches!(classify(Stage::Send, 422), SendError::Rejected(_)));
        assert!(classify(Stage::Send, 422).is_permanent());
    }

    #[test]
    fn server_errors_stay_transient() {
        for code in [500, 502, 503, 429] {
            assert!(!classify(Stage::Send, code).is_permanent());
        }
        assert!(matches!(classify(Stage::Open, 409), SendError::NotConnected));
    }
}
