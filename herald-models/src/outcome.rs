use std::fmt;

/// Closed taxonomy of everything that can stop a message short of delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Payload could not be decoded, or its key was empty.
    Malformed,
    /// Another attempt currently holds the idempotency key.
    Contention,
    /// No live device is paired for the key.
    NotFound,
    /// The device store could not answer.
    LookupError,
    SendTransient,
    SendPermanent,
    /// Anything not classified by a collaborator, including panics.
    Unknown,
}

impl FailureKind {
    /// Retrying a permanent failure can never succeed, so it must not be requeued.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            FailureKind::Malformed | FailureKind::NotFound | FailureKind::SendPermanent
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Malformed => "malformed",
            FailureKind::Contention => "contention",
            FailureKind::NotFound => "not_found",
            FailureKind::LookupError => "lookup_error",
            FailureKind::SendTransient => "send_transient",
            FailureKind::SendPermanent => "send_permanent",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    PermanentFailure(Failure),
    TransientFailure(Failure),
}

impl DeliveryOutcome {
    /// Build the failure outcome matching the permanence of `kind`.
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        let failure = Failure {
            kind,
            reason: reason.into(),
        };
        if kind.is_permanent() {
            DeliveryOutcome::PermanentFailure(failure)
        } else {
            DeliveryOutcome::TransientFailure(failure)
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            DeliveryOutcome::Delivered => None,
            DeliveryOutcome::PermanentFailure(failure)
            | DeliveryOutcome::TransientFailure(failure) => Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_routes_by_permanence() {
        assert!(matches!(
            DeliveryOutcome::failed(FailureKind::NotFound, "gone"),
            DeliveryOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            DeliveryOutcome::failed(FailureKind::SendPermanent, "banned"),
            DeliveryOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            DeliveryOutcome::failed(FailureKind::SendTransient, "socket"),
            DeliveryOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            DeliveryOutcome::failed(FailureKind::LookupError, "db down"),
            DeliveryOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            DeliveryOutcome::failed(FailureKind::Unknown, "panic"),
            DeliveryOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn failure_display_includes_kind() {
        let outcome = DeliveryOutcome::failed(FailureKind::LookupError, "pool timed out");
        assert_eq!(
            outcome.failure().unwrap().to_string(),
            "lookup_error: pool timed out"
        );
        assert!(DeliveryOutcome::Delivered.failure().is_none());
    }
}
