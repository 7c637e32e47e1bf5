//! Interest-based matching engine.
//!
//! Owns the waiting pool and the session table — the only shared mutable
//! state in the relay. Every mutation goes through one write-locked
//! authority, so concurrent announces for the same interest pair exactly
//! once and a connection can never end up in two sessions. Peer
//! notifications are collected under the lock and delivered after it is
//! released.
//!
//! Per-connection lifecycle: `Idle → Waiting → Paired → Closed`.

use crate::error::AppError;
use crate::websocket::{ConnectionId, ConnectionRegistry};
use chrono::{DateTime, Utc};
use event_schema::ServerEvent;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One paired conversation. Exactly two members; exists from pairing until
/// either member disconnects.
struct Session {
    members: [ConnectionId; 2],
    created_at: DateTime<Utc>,
}

impl Session {
    fn other(&self, conn: ConnectionId) -> ConnectionId {
        if self.members[0] == conn {
            self.members[1]
        } else {
            self.members[0]
        }
    }
}

/// What a connection told us at announce time; kept for the lifetime of the
/// connection so a surviving partner can be re-queued under its original
/// interest.
struct Profile {
    interest: String,
    display_name: Option<String>,
}

#[derive(Default)]
struct MatchState {
    /// Interest key -> waiters in arrival order. A connection appears in at
    /// most one queue, and never while it is in a session.
    waiting: HashMap<String, VecDeque<ConnectionId>>,
    sessions: HashMap<SessionId, Session>,
    /// Reverse index for the forwarding path.
    members: HashMap<ConnectionId, SessionId>,
    profiles: HashMap<ConnectionId, Profile>,
}

type Notifications = Vec<(ConnectionId, ServerEvent)>;

impl MatchState {
    /// Files `conn` under `interest`, pairing it with the oldest waiter if
    /// one exists. Returns the notifications to deliver once the lock is
    /// released.
    fn file_waiter(
        &mut self,
        conn: ConnectionId,
        interest: String,
        display_name: Option<String>,
    ) -> Notifications {
        self.remove_from_pool(conn);
        self.profiles.insert(
            conn,
            Profile {
                interest: interest.clone(),
                display_name,
            },
        );

        while let Some(peer) = self.pop_waiter(&interest) {
            if self.members.contains_key(&peer) {
                let err = AppError::PoolInvariantViolation {
                    conn: peer.as_uuid(),
                };
                tracing::error!(error = %err, "waiting pool held a paired connection, forcing it out");
                let mut out = self.purge(peer);
                let display_name = self.take_display_name(conn);
                out.extend(self.file_waiter(conn, interest, display_name));
                return out;
            }
            return self.create_session(peer, conn);
        }

        self.waiting.entry(interest).or_default().push_back(conn);
        tracing::debug!(%conn, "connection is waiting for a partner");
        Vec::new()
    }

    fn take_display_name(&mut self, conn: ConnectionId) -> Option<String> {
        self.profiles
            .remove(&conn)
            .and_then(|p| p.display_name)
    }

    fn pop_waiter(&mut self, interest: &str) -> Option<ConnectionId> {
        let queue = self.waiting.get_mut(interest)?;
        let conn = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(interest);
        }
        conn
    }

    fn remove_waiting(&mut self, conn: ConnectionId, interest: &str) {
        if let Some(queue) = self.waiting.get_mut(interest) {
            queue.retain(|c| *c != conn);
            if queue.is_empty() {
                self.waiting.remove(interest);
            }
        }
    }

    /// Removes `conn` from whichever queue its profile says it is in.
    fn remove_from_pool(&mut self, conn: ConnectionId) {
        if let Some(profile) = self.profiles.get(&conn) {
            let interest = profile.interest.clone();
            self.remove_waiting(conn, &interest);
        }
    }

    fn create_session(&mut self, a: ConnectionId, b: ConnectionId) -> Notifications {
        let id = SessionId::new();
        self.sessions.insert(
            id,
            Session {
                members: [a, b],
                created_at: Utc::now(),
            },
        );
        self.members.insert(a, id);
        self.members.insert(b, id);
        tracing::info!(session = %id, first = %a, second = %b, "paired connections");

        let name_of = |state: &Self, conn: ConnectionId| {
            state
                .profiles
                .get(&conn)
                .and_then(|p| p.display_name.clone())
        };
        vec![
            (
                a,
                ServerEvent::Paired {
                    peer_id: b.as_uuid(),
                    peer_name: name_of(self, b),
                },
            ),
            (
                b,
                ServerEvent::Paired {
                    peer_id: a.as_uuid(),
                    peer_name: name_of(self, a),
                },
            ),
        ]
    }

    /// Terminal transition for a disconnecting connection. Destroys its
    /// session if paired; the survivor gets exactly one `partner_left` and
    /// re-enters the pool under its original interest.
    fn close(&mut self, conn: ConnectionId) -> Notifications {
        let profile = self.profiles.remove(&conn);

        let Some(sid) = self.members.remove(&conn) else {
            if let Some(profile) = profile {
                self.remove_waiting(conn, &profile.interest);
                tracing::debug!(%conn, "waiting connection closed");
            }
            return Vec::new();
        };

        let Some(session) = self.sessions.remove(&sid) else {
            let err = AppError::PoolInvariantViolation {
                conn: conn.as_uuid(),
            };
            tracing::error!(error = %err, "member index pointed at a missing session");
            return Vec::new();
        };

        let peer = session.other(conn);
        self.members.remove(&peer);
        tracing::info!(
            session = %sid,
            lived = ?Utc::now().signed_duration_since(session.created_at).to_std().unwrap_or_default(),
            "session destroyed by disconnect"
        );

        let mut out = vec![(peer, ServerEvent::PartnerLeft)];
        if let Some(peer_profile) = self.profiles.get(&peer) {
            let interest = peer_profile.interest.clone();
            let display_name = peer_profile.display_name.clone();
            out.extend(self.file_waiter(peer, interest, display_name));
        }
        out
    }

    /// Defensive eviction for invariant violations: scrubs the connection
    /// from every table. An orphaned session partner is notified and
    /// re-queued as if its peer had disconnected normally.
    fn purge(&mut self, conn: ConnectionId) -> Notifications {
        for queue in self.waiting.values_mut() {
            queue.retain(|c| *c != conn);
        }
        self.waiting.retain(|_, queue| !queue.is_empty());
        self.close(conn)
    }
}

/// Clone-able handle over the single matching authority.
#[derive(Clone)]
pub struct Matchmaker {
    inner: Arc<RwLock<MatchState>>,
    registry: ConnectionRegistry,
}

impl Matchmaker {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MatchState::default())),
            registry,
        }
    }

    /// `Idle/Waiting --announce--> Waiting | Paired`.
    ///
    /// An empty or whitespace-only interest never pairs and is dropped
    /// here. Announcing while paired is a no-op; announcing while waiting
    /// re-files the connection under the new interest.
    pub async fn announce(
        &self,
        conn: ConnectionId,
        interest: &str,
        display_name: Option<String>,
    ) {
        let interest = interest.trim();
        if interest.is_empty() {
            tracing::warn!(%conn, "rejected announce with empty interest");
            return;
        }

        let notifications = {
            let mut state = self.inner.write().await;
            if state.members.contains_key(&conn) {
                tracing::debug!(%conn, "announce ignored, connection already paired");
                Vec::new()
            } else {
                state.file_waiter(conn, interest.to_string(), display_name)
            }
        };
        self.deliver(notifications).await;
    }

    /// `Waiting | Paired --disconnect--> Closed`.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let notifications = {
            let mut state = self.inner.write().await;
            state.close(conn)
        };
        self.deliver(notifications).await;
    }

    /// The forwarding lookup: the other member of `conn`'s session, if any.
    /// Takes only the read lock.
    pub async fn session_peer(&self, conn: ConnectionId) -> Option<ConnectionId> {
        let state = self.inner.read().await;
        let sid = state.members.get(&conn)?;
        state.sessions.get(sid).map(|s| s.other(conn))
    }

    /// Number of connections waiting under an interest (for debugging and
    /// tests).
    pub async fn waiting_count(&self, interest: &str) -> usize {
        let state = self.inner.read().await;
        state.waiting.get(interest).map(|q| q.len()).unwrap_or(0)
    }

    async fn deliver(&self, notifications: Notifications) {
        for (conn, event) in notifications {
            self.registry.send(conn, &event).await;
        }
    }
}
