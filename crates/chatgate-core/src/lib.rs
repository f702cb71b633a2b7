//! chatgate-core: Shared protocol library for the chat gateway.
//!
//! Provides the JSON message envelope, the authentication input carried by
//! the handshake, the codec, the error taxonomy, and the abstract duplex
//! message channel that sessions run over.

pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode};
pub use error::{GateError, GateResult};
pub use messages::{AuthenticationInput, Envelope, MsgType, CHALLENGE_PAYLOAD, UPDATE_PAYLOAD};
pub use transport::{MemoryChannel, MessageChannel};
