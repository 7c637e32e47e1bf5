//! Client side of the pairlink protocol.
//!
//! [`Chat::connect`] opens a websocket to the relay, announces an interest,
//! and runs the session state machine: wait for a partner, exchange X25519
//! public keys through the relay, derive the shared session key, then
//! exchange encrypted chat and typing events. When the partner leaves or the
//! transport drops, the client re-enters the pool with the same interest
//! without user action.

pub mod error;
pub mod session;
pub mod transport;

pub use error::ClientError;
pub use session::{Chat, ChatEvent, Phase};
