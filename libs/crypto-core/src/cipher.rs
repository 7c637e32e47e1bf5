//! AES-128-GCM message encryption under a derived session key.
//!
//! The initialization vector is a fixed all-zero 12-byte value shared by
//! every message in a session. This is the protocol's documented baseline:
//! with a static IV, equal plaintexts under the same key produce equal
//! ciphertexts, so message equality leaks to an observer. A hardened
//! deployment must generate a random IV per message and carry it in the
//! `message` wire event next to the ciphertext; that is a wire-format
//! change and is deliberately not made here.

use crate::key_exchange::SessionKey;
use crate::CryptoError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

const FIXED_IV: [u8; 12] = [0u8; 12];

/// Encrypts a plaintext under the session key, returning the ciphertext and
/// the detached 16-byte authentication tag.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> (Vec<u8>, [u8; TAG_LEN]) {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key.0));
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&FIXED_IV), plaintext)
        .expect("AES-GCM encryption of an in-memory buffer cannot fail");

    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);
    (sealed, tag)
}

/// Verifies the tag and decrypts. Fails with
/// [`CryptoError::AuthenticationFailure`] on any mismatch: tampered
/// ciphertext, tampered tag, or a different key.
pub fn decrypt(
    key: &SessionKey,
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key.0));

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(&FIXED_IV), sealed.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailure)
}
