//! Beacon Signal Server
//!
//! Lightweight signaling relay that lets browser peers find each other and
//! exchange WebRTC negotiation messages before connecting directly.
//!
//! # Protocol
//!
//! 1. Peer connects to `/ws?id=<name>`
//! 2. Peer sends `get-peers` and receives a `peer-list`
//! 3. Peers exchange `offer`, `answer` and `ice-candidate` messages through the relay
//! 4. Peers establish a direct connection
//! 5. Signal connection can be dropped

pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use error::SignalError;
pub use lifecycle::{CloseReason, Lifecycle};
pub use messages::{ErrorCode, MessageKind, SignalMessage, SERVER_ID};
pub use registry::Registry;
pub use router::{RouteOutcome, Router};
pub use server::SignalServer;
pub use session::{Session, SessionState, Transport};
