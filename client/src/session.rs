//! The per-connection session state machine.
//!
//! `Connecting → AwaitingPartner → KeyExchange → Secure → Ended`, with two
//! timing tolerances the handshake needs: a partner public key arriving
//! before our own `paired` notification is buffered, and a chat message
//! arriving before the session key exists is dropped — this protocol has no
//! redelivery, so such messages are lost.

use crate::error::ClientError;
use crate::transport::{self, Link};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crypto_core::{CryptoError, KeyPair, SessionKey, TAG_LEN};
use event_schema::{ClientEvent, ServerEvent};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where the session currently stands.
///
/// `Secure { confirmed }` flips to confirmed on the first successfully
/// decrypted message — the protocol has no explicit handshake ack, so that
/// decrypt is the confirmation. A failed decrypt never rolls the phase back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    AwaitingPartner,
    KeyExchange,
    Secure { confirmed: bool },
    Ended,
}

/// What the session surfaces to the caller.
#[derive(Debug)]
pub enum ChatEvent {
    /// A partner was found; key exchange is under way.
    Paired { peer_name: Option<String> },
    /// The shared session key is derived; messages can flow.
    SecureEstablished,
    /// A decrypted message from the partner.
    Message(String),
    /// A message arrived but failed authentication or decoding. The session
    /// stays secure; show a placeholder instead of the text.
    MessageUnreadable,
    PeerTyping(bool),
    /// The partner disconnected. The relay has already re-queued this
    /// connection under the original interest; a new `Paired` will follow
    /// whenever the next partner shows up.
    PartnerLeft,
    /// The transport dropped or the pairing was aborted; reconnecting with
    /// the same interest.
    Reconnecting,
    /// Unrecoverable failure; no further events will arrive.
    Failed(ClientError),
}

#[derive(Debug)]
pub(crate) enum Command {
    SendMessage(String),
    Typing(bool),
    Quit,
}

/// Why a single session run ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    TransportClosed,
    /// The partner's public key was unusable; drop the connection and start
    /// over from `Connecting`.
    PeerKeyRejected,
    UserQuit,
}

/// Handle to a running chat. Dropping it (or calling [`Chat::close`]) ends
/// the supervision loop.
pub struct Chat {
    commands: UnboundedSender<Command>,
    events: UnboundedReceiver<ChatEvent>,
    phase: watch::Receiver<Phase>,
}

impl Chat {
    /// Connects to the relay, announces the interest, and keeps the session
    /// alive across partner changes and transport drops.
    pub async fn connect(
        url: &str,
        interest: &str,
        display_name: Option<String>,
    ) -> Result<Self, ClientError> {
        let link = transport::connect(url).await?;

        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (evt_tx, evt_rx) = unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Connecting);

        tokio::spawn(supervise(
            url.to_string(),
            interest.to_string(),
            display_name,
            link,
            cmd_rx,
            evt_tx,
            phase_tx,
        ));

        Ok(Self {
            commands: cmd_tx,
            events: evt_rx,
            phase: phase_rx,
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Encrypts and sends a chat message. Only valid once the session key is
    /// derived.
    pub fn send_message(&self, text: &str) -> Result<(), ClientError> {
        match self.phase() {
            Phase::Secure { .. } => self
                .commands
                .send(Command::SendMessage(text.to_string()))
                .map_err(|_| ClientError::Closed),
            _ => Err(ClientError::NotSecure),
        }
    }

    /// Updates the typing indicator. Valid from pairing onward; the flag is
    /// relayed as plaintext state, not message content.
    pub fn set_typing(&self, typing: bool) -> Result<(), ClientError> {
        match self.phase() {
            Phase::KeyExchange | Phase::Secure { .. } => self
                .commands
                .send(Command::Typing(typing))
                .map_err(|_| ClientError::Closed),
            _ => Err(ClientError::NotSecure),
        }
    }

    /// Next user-facing event; `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Quit);
    }
}

/// Runs sessions back to back: a fresh connection and announce after every
/// transport drop or aborted pairing, with the original interest.
async fn supervise(
    url: String,
    interest: String,
    display_name: Option<String>,
    first_link: Link,
    mut commands: UnboundedReceiver<Command>,
    events: UnboundedSender<ChatEvent>,
    phase_tx: watch::Sender<Phase>,
) {
    let mut link = Some(first_link);
    loop {
        let current = match link.take() {
            Some(link) => link,
            None => match transport::connect(&url).await {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };

        let end = run_session(
            &interest,
            display_name.clone(),
            current,
            &mut commands,
            &events,
            &phase_tx,
        )
        .await;

        match end {
            Ok(SessionEnd::UserQuit) => {
                phase_tx.send_replace(Phase::Ended);
                break;
            }
            Ok(SessionEnd::TransportClosed) | Ok(SessionEnd::PeerKeyRejected) => {
                phase_tx.send_replace(Phase::Connecting);
                if events.send(ChatEvent::Reconnecting).is_err() {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(e) => {
                phase_tx.send_replace(Phase::Ended);
                let _ = events.send(ChatEvent::Failed(e));
                break;
            }
        }
    }
}

struct SessionState<'a> {
    outgoing: UnboundedSender<ClientEvent>,
    events: &'a UnboundedSender<ChatEvent>,
    phase_tx: &'a watch::Sender<Phase>,
    phase: Phase,
    key_pair: Option<KeyPair>,
    session_key: Option<SessionKey>,
    /// Partner key that arrived before our `paired` notification.
    pending_peer_key: Option<Vec<u8>>,
}

/// One connection's worth of protocol. Returns how the run ended; `Err` is
/// reserved for unrecoverable failures such as entropy loss.
pub(crate) async fn run_session(
    interest: &str,
    display_name: Option<String>,
    link: Link,
    commands: &mut UnboundedReceiver<Command>,
    events: &UnboundedSender<ChatEvent>,
    phase_tx: &watch::Sender<Phase>,
) -> Result<SessionEnd, ClientError> {
    let Link {
        outgoing,
        mut incoming,
    } = link;

    let mut state = SessionState {
        outgoing,
        events,
        phase_tx,
        phase: Phase::Connecting,
        key_pair: None,
        session_key: None,
        pending_peer_key: None,
    };

    let announce = ClientEvent::Announce {
        interest: interest.to_string(),
        display_name,
    };
    if !state.send_out(announce) {
        return Ok(SessionEnd::TransportClosed);
    }
    state.set_phase(Phase::AwaitingPartner);

    loop {
        tokio::select! {
            evt = incoming.recv() => match evt {
                Some(evt) => {
                    if let Some(end) = state.on_server_event(evt)? {
                        return Ok(end);
                    }
                }
                None => return Ok(SessionEnd::TransportClosed),
            },
            cmd = commands.recv() => match cmd {
                Some(cmd) => {
                    if let Some(end) = state.on_command(cmd) {
                        return Ok(end);
                    }
                }
                None => return Ok(SessionEnd::UserQuit),
            },
        }
    }
}

impl SessionState<'_> {
    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn send_out(&self, event: ClientEvent) -> bool {
        self.outgoing.send(event).is_ok()
    }

    fn on_server_event(&mut self, evt: ServerEvent) -> Result<Option<SessionEnd>, ClientError> {
        match evt {
            ServerEvent::Paired { peer_id, peer_name } => {
                tracing::debug!(%peer_id, "paired, starting key exchange");

                // Fresh key material per pairing; entropy failure is fatal
                // for the whole session, not retried.
                let key_pair = KeyPair::generate()?;
                let key = BASE64.encode(key_pair.public_key());
                if !self.send_out(ClientEvent::PublicKey { key }) {
                    return Ok(Some(SessionEnd::TransportClosed));
                }
                self.session_key = None;
                self.key_pair = Some(key_pair);
                self.set_phase(Phase::KeyExchange);
                self.emit(ChatEvent::Paired { peer_name });

                if let Some(peer_key) = self.pending_peer_key.take() {
                    return self.complete_key_exchange(&peer_key);
                }
                Ok(None)
            }

            ServerEvent::PublicKey { key } => {
                let bytes = match BASE64.decode(key.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        tracing::warn!("partner public key is not valid base64");
                        return Ok(Some(SessionEnd::PeerKeyRejected));
                    }
                };
                match self.phase {
                    // The partner raced ahead of our pairing notification.
                    Phase::Connecting | Phase::AwaitingPartner => {
                        self.pending_peer_key = Some(bytes);
                        Ok(None)
                    }
                    Phase::KeyExchange => self.complete_key_exchange(&bytes),
                    Phase::Secure { .. } | Phase::Ended => {
                        tracing::debug!("ignoring superfluous partner key");
                        Ok(None)
                    }
                }
            }

            ServerEvent::Message { ciphertext, tag } => self.on_message(&ciphertext, &tag),

            ServerEvent::Typing { typing } => {
                self.emit(ChatEvent::PeerTyping(typing));
                Ok(None)
            }

            ServerEvent::PartnerLeft => {
                // Key material dies with the session. The relay has already
                // re-queued us, so no new announce goes out from here.
                self.key_pair = None;
                self.session_key = None;
                self.pending_peer_key = None;
                self.set_phase(Phase::AwaitingPartner);
                self.emit(ChatEvent::PartnerLeft);
                Ok(None)
            }
        }
    }

    fn complete_key_exchange(&mut self, peer_key: &[u8]) -> Result<Option<SessionEnd>, ClientError> {
        let Some(key_pair) = self.key_pair.as_ref() else {
            tracing::warn!("partner key arrived with no local key pair, dropping");
            return Ok(None);
        };

        match key_pair.derive_session_key(peer_key) {
            Ok(session_key) => {
                self.session_key = Some(session_key);
                self.key_pair = None;
                self.set_phase(Phase::Secure { confirmed: false });
                self.emit(ChatEvent::SecureEstablished);
                Ok(None)
            }
            Err(CryptoError::InvalidPeerKey) => {
                tracing::warn!("aborting pairing: partner key is not a valid curve point");
                Ok(Some(SessionEnd::PeerKeyRejected))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_message(&mut self, ciphertext: &str, tag: &str) -> Result<Option<SessionEnd>, ClientError> {
        let Phase::Secure { confirmed } = self.phase else {
            tracing::debug!("dropping chat message received before the session key exists");
            return Ok(None);
        };
        let Some(session_key) = self.session_key.as_ref() else {
            tracing::debug!("secure phase without session key, dropping message");
            return Ok(None);
        };

        let ciphertext = match BASE64.decode(ciphertext.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.emit(ChatEvent::MessageUnreadable);
                return Ok(None);
            }
        };
        let tag: [u8; TAG_LEN] = match BASE64.decode(tag.as_bytes()) {
            Ok(bytes) => match bytes.try_into() {
                Ok(tag) => tag,
                Err(_) => {
                    self.emit(ChatEvent::MessageUnreadable);
                    return Ok(None);
                }
            },
            Err(_) => {
                self.emit(ChatEvent::MessageUnreadable);
                return Ok(None);
            }
        };

        match crypto_core::decrypt(session_key, &ciphertext, &tag) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(text) => {
                    if !confirmed {
                        tracing::debug!("handshake confirmed by first decrypted message");
                        self.set_phase(Phase::Secure { confirmed: true });
                    }
                    self.emit(ChatEvent::Message(text));
                    Ok(None)
                }
                Err(_) => {
                    self.emit(ChatEvent::MessageUnreadable);
                    Ok(None)
                }
            },
            // Per-message failure: surface it and keep the session alive.
            Err(CryptoError::AuthenticationFailure) => {
                self.emit(ChatEvent::MessageUnreadable);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_command(&mut self, cmd: Command) -> Option<SessionEnd> {
        match cmd {
            Command::SendMessage(text) => {
                let Some(session_key) = self.session_key.as_ref() else {
                    tracing::debug!("not secure yet, dropping outbound message");
                    return None;
                };
                let (ciphertext, tag) = crypto_core::encrypt(session_key, text.as_bytes());
                let event = ClientEvent::Message {
                    ciphertext: BASE64.encode(ciphertext),
                    tag: BASE64.encode(tag),
                };
                if !self.send_out(event) {
                    return Some(SessionEnd::TransportClosed);
                }
                None
            }
            Command::Typing(typing) => {
                if matches!(self.phase, Phase::KeyExchange | Phase::Secure { .. })
                    && !self.send_out(ClientEvent::Typing { typing })
                {
                    return Some(SessionEnd::TransportClosed);
                }
                None
            }
            Command::Quit => Some(SessionEnd::UserQuit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    struct Harness {
        relay: UnboundedSender<ServerEvent>,
        wire: UnboundedReceiver<ClientEvent>,
        commands: UnboundedSender<Command>,
        events: UnboundedReceiver<ChatEvent>,
        phase: watch::Receiver<Phase>,
        task: JoinHandle<Result<SessionEnd, ClientError>>,
    }

    fn spawn_session(interest: &str) -> Harness {
        let (relay_tx, relay_rx) = unbounded_channel();
        let (wire_tx, wire_rx) = unbounded_channel();
        let (cmd_tx, mut cmd_rx) = unbounded_channel();
        let (evt_tx, evt_rx) = unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Connecting);

        let interest = interest.to_string();
        let task = tokio::spawn(async move {
            let link = Link {
                outgoing: wire_tx,
                incoming: relay_rx,
            };
            run_session(&interest, None, link, &mut cmd_rx, &evt_tx, &phase_tx).await
        });

        Harness {
            relay: relay_tx,
            wire: wire_rx,
            commands: cmd_tx,
            events: evt_rx,
            phase: phase_rx,
            task,
        }
    }

    impl Harness {
        async fn next_wire(&mut self) -> ClientEvent {
            self.wire.recv().await.expect("session hung up")
        }

        async fn next_event(&mut self) -> ChatEvent {
            self.events.recv().await.expect("session hung up")
        }

        /// Completes pairing and key exchange against a fresh fake partner,
        /// returning the partner's copy of the session key.
        async fn handshake(&mut self) -> SessionKey {
            assert!(matches!(self.next_wire().await, ClientEvent::Announce { .. }));

            self.relay
                .send(ServerEvent::Paired {
                    peer_id: Uuid::new_v4(),
                    peer_name: Some("bob".into()),
                })
                .unwrap();
            assert!(matches!(self.next_event().await, ChatEvent::Paired { .. }));

            let our_key = match self.next_wire().await {
                ClientEvent::PublicKey { key } => BASE64.decode(key).unwrap(),
                other => panic!("expected public key, got {other:?}"),
            };

            let partner = KeyPair::generate().unwrap();
            let partner_session = partner.derive_session_key(&our_key).unwrap();
            self.relay
                .send(ServerEvent::PublicKey {
                    key: BASE64.encode(partner.public_key()),
                })
                .unwrap();
            assert!(matches!(
                self.next_event().await,
                ChatEvent::SecureEstablished
            ));
            partner_session
        }

        fn send_encrypted(&self, key: &SessionKey, text: &str) {
            let (ciphertext, tag) = crypto_core::encrypt(key, text.as_bytes());
            self.relay
                .send(ServerEvent::Message {
                    ciphertext: BASE64.encode(ciphertext),
                    tag: BASE64.encode(tag),
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn announces_interest_first() {
        let mut h = spawn_session("chess");
        match h.next_wire().await {
            ClientEvent::Announce {
                interest,
                display_name,
            } => {
                assert_eq!(interest, "chess");
                assert!(display_name.is_none());
            }
            other => panic!("expected announce, got {other:?}"),
        }
        assert_eq!(*h.phase.borrow(), Phase::AwaitingPartner);
    }

    #[tokio::test]
    async fn full_handshake_and_message_exchange() {
        let mut h = spawn_session("chess");
        let partner_key = h.handshake().await;
        assert_eq!(*h.phase.borrow(), Phase::Secure { confirmed: false });

        // Partner -> us: decryptable, and the first decrypt confirms the
        // handshake.
        h.send_encrypted(&partner_key, "hello");
        match h.next_event().await {
            ChatEvent::Message(text) => assert_eq!(text, "hello"),
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(*h.phase.borrow(), Phase::Secure { confirmed: true });

        // Us -> partner: encrypted on the wire, decryptable with the
        // partner's copy of the key.
        h.commands
            .send(Command::SendMessage("hi there".into()))
            .unwrap();
        match h.next_wire().await {
            ClientEvent::Message { ciphertext, tag } => {
                let ciphertext = BASE64.decode(ciphertext).unwrap();
                let tag: [u8; TAG_LEN] =
                    BASE64.decode(tag).unwrap().try_into().unwrap();
                let plaintext = crypto_core::decrypt(&partner_key, &ciphertext, &tag).unwrap();
                assert_eq!(plaintext, b"hi there");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partner_key_arriving_before_paired_is_buffered() {
        let mut h = spawn_session("chess");
        assert!(matches!(h.next_wire().await, ClientEvent::Announce { .. }));

        let partner = KeyPair::generate().unwrap();
        h.relay
            .send(ServerEvent::PublicKey {
                key: BASE64.encode(partner.public_key()),
            })
            .unwrap();
        h.relay
            .send(ServerEvent::Paired {
                peer_id: Uuid::new_v4(),
                peer_name: None,
            })
            .unwrap();

        assert!(matches!(h.next_event().await, ChatEvent::Paired { .. }));
        assert!(matches!(
            h.next_event().await,
            ChatEvent::SecureEstablished
        ));
        assert!(matches!(h.next_wire().await, ClientEvent::PublicKey { .. }));
    }

    #[tokio::test]
    async fn message_before_key_derivation_is_dropped() {
        let mut h = spawn_session("chess");
        assert!(matches!(h.next_wire().await, ClientEvent::Announce { .. }));

        h.relay
            .send(ServerEvent::Paired {
                peer_id: Uuid::new_v4(),
                peer_name: None,
            })
            .unwrap();
        assert!(matches!(h.next_event().await, ChatEvent::Paired { .. }));
        assert!(matches!(h.next_wire().await, ClientEvent::PublicKey { .. }));

        // Still in key exchange: this one is lost by design.
        h.relay
            .send(ServerEvent::Message {
                ciphertext: BASE64.encode(b"junk"),
                tag: BASE64.encode([0u8; TAG_LEN]),
            })
            .unwrap();

        let partner = KeyPair::generate().unwrap();
        h.relay
            .send(ServerEvent::PublicKey {
                key: BASE64.encode(partner.public_key()),
            })
            .unwrap();

        // The dropped message produced no event; the next one is the
        // secure-established notification.
        assert!(matches!(
            h.next_event().await,
            ChatEvent::SecureEstablished
        ));
    }

    #[tokio::test]
    async fn tampered_message_is_unreadable_but_not_fatal() {
        let mut h = spawn_session("chess");
        let partner_key = h.handshake().await;

        let (mut ciphertext, tag) = crypto_core::encrypt(&partner_key, b"hello");
        ciphertext[0] ^= 0xff;
        h.relay
            .send(ServerEvent::Message {
                ciphertext: BASE64.encode(ciphertext),
                tag: BASE64.encode(tag),
            })
            .unwrap();
        assert!(matches!(h.next_event().await, ChatEvent::MessageUnreadable));

        // The session survives and later messages still decrypt.
        h.send_encrypted(&partner_key, "still here");
        match h.next_event().await {
            ChatEvent::Message(text) => assert_eq!(text, "still here"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partner_left_resets_to_awaiting_without_reannouncing() {
        let mut h = spawn_session("chess");
        let _partner_key = h.handshake().await;

        h.relay.send(ServerEvent::PartnerLeft).unwrap();
        assert!(matches!(h.next_event().await, ChatEvent::PartnerLeft));
        assert_eq!(*h.phase.borrow(), Phase::AwaitingPartner);

        // The relay re-queues us; the client must not announce again.
        assert!(h.wire.try_recv().is_err());

        // A second pairing on the same connection works from scratch.
        h.relay
            .send(ServerEvent::Paired {
                peer_id: Uuid::new_v4(),
                peer_name: None,
            })
            .unwrap();
        assert!(matches!(h.next_event().await, ChatEvent::Paired { .. }));
        assert!(matches!(h.next_wire().await, ClientEvent::PublicKey { .. }));
    }

    #[tokio::test]
    async fn invalid_partner_key_aborts_the_run() {
        let mut h = spawn_session("chess");
        assert!(matches!(h.next_wire().await, ClientEvent::Announce { .. }));

        h.relay
            .send(ServerEvent::Paired {
                peer_id: Uuid::new_v4(),
                peer_name: None,
            })
            .unwrap();
        assert!(matches!(h.next_event().await, ChatEvent::Paired { .. }));
        assert!(matches!(h.next_wire().await, ClientEvent::PublicKey { .. }));

        // The identity point derives an all-zero secret and must be refused.
        h.relay
            .send(ServerEvent::PublicKey {
                key: BASE64.encode([0u8; 32]),
            })
            .unwrap();

        let end = h.task.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::PeerKeyRejected));
    }

    #[tokio::test]
    async fn quit_ends_the_run() {
        let mut h = spawn_session("chess");
        assert!(matches!(h.next_wire().await, ClientEvent::Announce { .. }));
        h.commands.send(Command::Quit).unwrap();
        let end = h.task.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::UserQuit));
    }

    #[tokio::test]
    async fn transport_close_ends_the_run() {
        let mut h = spawn_session("chess");
        assert!(matches!(h.next_wire().await, ClientEvent::Announce { .. }));
        drop(h.relay);
        let end = h.task.await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::TransportClosed));
    }
}
