use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to {backend}: {message}")]
    Connection {
        backend: &'static str,
        message: String,
    },
    #[error("broker is not connected; call connect() first")]
    NotConnected,
    #[error("failed to publish to '{topic}': {message}")]
    Publish { topic: String, message: String },
    #[error("failed to subscribe to '{topic}': {message}")]
    Subscribe { topic: String, message: String },
    #[error("failed to settle delivery: {0}")]
    Acknowledge(String),
    #[error("delivery stream error: {0}")]
    Delivery(String),
    #[error("failed to close {resource}: {message}")]
    CloseResource {
        resource: &'static str,
        message: String,
    },
    #[error("multiple errors occurred while closing: {}", join_errors(.0))]
    Close(Vec<BrokerError>),
    #[error("unknown broker backend '{0}'")]
    UnknownBackend(String),
}

impl BrokerError {
    pub(crate) fn connection(backend: &'static str, err: impl ToString) -> Self {
        BrokerError::Connection {
            backend,
            message: err.to_string(),
        }
    }

    pub(crate) fn publish(topic: &str, err: impl ToString) -> Self {
        BrokerError::Publish {
            topic: topic.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn subscribe(topic: &str, err: impl ToString) -> Self {
        BrokerError::Subscribe {
            topic: topic.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn close_resource(resource: &'static str, err: impl ToString) -> Self {
        BrokerError::CloseResource {
            resource,
            message: err.to_string(),
        }
    }

    /// Fold the failures collected while closing into one result, keeping all of them.
    pub(crate) fn from_close_errors(mut errors: Vec<BrokerError>) -> Result<(), BrokerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(BrokerError::Close(errors)),
        }
    }
}

fn join_errors(errors: &[BrokerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
