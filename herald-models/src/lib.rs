pub mod errors;
pub mod message;
pub mod outcome;

pub use message::{IdempotencyKey, MalformedMessage, Recipient, WorkMessage};
pub use outcome::{DeliveryOutcome, Failure, FailureKind};
