use crate::CryptoError;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Encoded X25519 public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Symmetric session key length: the first 16 bytes of the raw X25519
/// shared secret, giving AES-128.
pub const SESSION_KEY_LEN: usize = 16;

/// One session's X25519 key pair.
///
/// Generated fresh per pairing; the private key never leaves this struct
/// and is wiped when the pair is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: [u8; 32],
    public: [u8; PUBLIC_KEY_LEN],
}

impl KeyPair {
    /// Generates a fresh key pair from system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut private = [0u8; 32];
        getrandom::getrandom(&mut private)
            .map_err(|e| CryptoError::EntropyFailure(e.to_string()))?;

        let public = x25519(private, X25519_BASEPOINT_BYTES);
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// Computes the shared secret with the peer and reduces it to a session
    /// key. Both endpoints derive byte-identical keys from the corresponding
    /// pairs; the handshake succeeding is the only confirmation.
    pub fn derive_session_key(&self, peer_public: &[u8]) -> Result<SessionKey, CryptoError> {
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidPeerKey)?;

        let mut shared = x25519(self.private, peer);
        // A low-order or otherwise degenerate peer point yields the all-zero
        // shared secret; refuse to key a session off it.
        if shared == [0u8; 32] {
            return Err(CryptoError::InvalidPeerKey);
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&shared[..SESSION_KEY_LEN]);
        shared.zeroize();
        Ok(SessionKey(key))
    }
}

/// The symmetric key both endpoints derive for one session.
///
/// Lives exactly as long as the session; wiped on drop, no rotation.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey(pub(crate) [u8; SESSION_KEY_LEN]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pairs_are_distinct() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();

        let k1 = alice.derive_session_key(bob.public_key()).unwrap();
        let k2 = bob.derive_session_key(alice.public_key()).unwrap();

        assert_eq!(k1.0, k2.0);
    }

    #[test]
    fn scalarmult_matches_rfc7748_vector() {
        // RFC 7748 section 5.2, first test vector.
        let scalar: [u8; 32] =
            hex::decode("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4")
                .unwrap()
                .try_into()
                .unwrap();
        let input: [u8; 32] =
            hex::decode("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c")
                .unwrap()
                .try_into()
                .unwrap();
        let expected =
            hex::decode("c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552")
                .unwrap();

        let out = x25519(scalar, input);
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    fn wrong_length_peer_key_is_rejected() {
        let pair = KeyPair::generate().unwrap();
        let err = pair.derive_session_key(&[0u8; 31]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPeerKey));
    }

    #[test]
    fn low_order_peer_key_is_rejected() {
        let pair = KeyPair::generate().unwrap();
        // The identity point: every scalar maps it to the all-zero output.
        let err = pair.derive_session_key(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPeerKey));
    }

    #[test]
    fn session_key_is_a_prefix_of_the_shared_secret() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();

        let shared = x25519(alice.private, *bob.public_key());
        let key = alice.derive_session_key(bob.public_key()).unwrap();
        assert_eq!(key.0, shared[..SESSION_KEY_LEN]);
    }
}
