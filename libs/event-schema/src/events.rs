use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound events from client to relay.
///
/// `public_key`, `message` and `typing` are relayed verbatim to the session
/// peer; the relay never inspects their payloads. Key and ciphertext material
/// is base64-encoded so every frame stays valid UTF-8 JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Declare an interest and enter the waiting pool.
    #[serde(rename = "announce")]
    Announce {
        interest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Own X25519 public key, forwarded to the session peer.
    #[serde(rename = "public_key")]
    PublicKey {
        /// Base64-encoded 32-byte curve point
        key: String,
    },

    /// An encrypted chat message, forwarded to the session peer.
    #[serde(rename = "message")]
    Message {
        /// Base64-encoded AES-GCM ciphertext (tag detached)
        ciphertext: String,
        /// Base64-encoded 16-byte authentication tag
        tag: String,
    },

    /// Typing-indicator state, forwarded to the session peer.
    #[serde(rename = "typing")]
    Typing { typing: bool },
}

/// Outbound events from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A partner with the same interest was found.
    ///
    /// Carries the peer's connection identifier and display name, never the
    /// matched interest string.
    #[serde(rename = "paired")]
    Paired {
        peer_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_name: Option<String>,
    },

    /// The partner's X25519 public key.
    #[serde(rename = "public_key")]
    PublicKey { key: String },

    /// An encrypted chat message from the partner.
    #[serde(rename = "message")]
    Message { ciphertext: String, tag: String },

    /// Typing-indicator state from the partner.
    #[serde(rename = "typing")]
    Typing { typing: bool },

    /// The partner disconnected; the session is gone and the relay has
    /// re-queued this connection under its original interest.
    #[serde(rename = "partner_left")]
    PartnerLeft,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_without_display_name_parses() {
        let evt: ClientEvent =
            serde_json::from_str(r#"{"type":"announce","interest":"chess"}"#).unwrap();
        match evt {
            ClientEvent::Announce {
                interest,
                display_name,
            } => {
                assert_eq!(interest, "chess");
                assert!(display_name.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn announce_omits_empty_display_name() {
        let json = serde_json::to_string(&ClientEvent::Announce {
            interest: "chess".into(),
            display_name: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"announce","interest":"chess"}"#);
    }

    #[test]
    fn paired_round_trips() {
        let peer_id = Uuid::new_v4();
        let json = serde_json::to_string(&ServerEvent::Paired {
            peer_id,
            peer_name: Some("ada".into()),
        })
        .unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        match back {
            ServerEvent::Paired {
                peer_id: id,
                peer_name,
            } => {
                assert_eq!(id, peer_id);
                assert_eq!(peer_name.as_deref(), Some("ada"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn message_keeps_payload_opaque() {
        let evt: ClientEvent = serde_json::from_str(
            r#"{"type":"message","ciphertext":"AAECAw==","tag":"BAUGBw=="}"#,
        )
        .unwrap();
        match evt {
            ClientEvent::Message { ciphertext, tag } => {
                assert_eq!(ciphertext, "AAECAw==");
                assert_eq!(tag, "BAUGBw==");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn partner_left_is_bare() {
        let json = serde_json::to_string(&ServerEvent::PartnerLeft).unwrap();
        assert_eq!(json, r#"{"type":"partner_left"}"#);
    }
}
