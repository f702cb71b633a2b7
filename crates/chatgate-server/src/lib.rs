//! chatgate-server: authenticated WebSocket chat gateway.
//!
//! Accepts WebSocket connections, challenges each client to authenticate
//! against the external identity service, then relays chat envelopes
//! between authenticated sessions. An admin HTTP endpoint broadcasts
//! updates to everyone connected.

pub mod admin;
pub mod config;
pub mod identity;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{RelayPolicy, ServerConfig};
pub use identity::{HttpVerifier, IdentityVerifier, VerifyError};
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::GatewayServer;
pub use session::{CloseReason, Session, SessionOptions, SessionState};
