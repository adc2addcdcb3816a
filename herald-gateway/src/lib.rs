mod client;
mod error;
mod types;

pub use client::{HttpProtocolClient, HttpSession};
pub use error::{GatewayError, Stage};
pub use types::{OpenSessionResponse, SendTextRequest};
