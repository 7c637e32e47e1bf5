//! End-to-end encryption primitives for paired chat sessions.
//!
//! Both endpoints of a session run this engine independently: each generates
//! an X25519 key pair, exchanges public keys through the relay, derives the
//! same 128-bit session key, and encrypts messages with AES-GCM. The relay
//! only ever sees public keys and ciphertext.
//!
//! All errors are local to the endpoint that hit them; nothing in this crate
//! is ever reported over the wire.

pub mod cipher;
pub mod key_exchange;

pub use cipher::{decrypt, encrypt, TAG_LEN};
pub use key_exchange::{KeyPair, SessionKey, PUBLIC_KEY_LEN, SESSION_KEY_LEN};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The peer's public key is malformed or not a usable curve point.
    /// Fatal to the handshake; the session must be abandoned.
    #[error("peer public key is not a valid curve point")]
    InvalidPeerKey,

    /// A message failed its authentication-tag check (tampered, corrupted,
    /// or encrypted under a different key). Per-message and non-fatal.
    #[error("message authentication failed")]
    AuthenticationFailure,

    /// The system entropy source failed during key generation. Fatal for
    /// the session; callers must surface this rather than retry in a loop.
    #[error("entropy source failure: {0}")]
    EntropyFailure(String),
}
