pub mod device;
pub mod protocol;

pub use device::{CleanupError, Device, DeviceResolver, ResolveError, SessionCleanup};
pub use protocol::{ProtocolClient, ProtocolSession, SendError};
