//! gms-core: Shared protocol library for the game manager service.
//!
//! Provides the CBOR message families and codec, packet framing, TCP/TLS
//! transport, the Connection Endpoint, the Sequential Dispatch Queue and the
//! pending-expectation table used by relay state machines.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod expectations;
pub mod message;
pub mod messages;
pub mod queue;
pub mod tls;
pub mod transport;

// Re-export commonly used items at crate root.
pub use endpoint::{ConnectionEndpoint, ConnectionId, EndpointConfig};
pub use error::{GmsError, GmsResult};
pub use expectations::{Expectation, ExpectationTable};
pub use message::Message;
pub use messages::{ClientAuthMessage, FailureReason, GameManagerMessage};
pub use queue::{ItemProcessor, QueueSender, SequentialQueue};
pub use transport::{ClientSocketConfig, HostPointer, RawConnection, ServerSocketConfig};
