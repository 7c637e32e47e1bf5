use event_schema::ServerEvent;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

/// Opaque handle bound 1:1 to a live websocket connection.
///
/// Becomes invalid the instant the underlying connection closes; every pool
/// and session entry referencing it is purged with that event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry of live connections and their outbound channels.
///
/// Each websocket session registers its sender on open and is removed on
/// close. Events are serialized here and pushed with a non-blocking send, so
/// delivery never waits on the matching engine's lock.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, UnboundedSender<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the receiving half of its
    /// outbound channel.
    pub async fn register(&self, conn: ConnectionId) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        let mut guard = self.inner.write().await;
        guard.insert(conn, tx);
        tracing::debug!(%conn, total = guard.len(), "registered connection");
        rx
    }

    pub async fn unregister(&self, conn: ConnectionId) {
        let mut guard = self.inner.write().await;
        if guard.remove(&conn).is_some() {
            tracing::debug!(%conn, remaining = guard.len(), "unregistered connection");
        }
    }

    /// Serializes an event and queues it on the connection's outbound
    /// channel. A dead sender is cleaned up on the spot; payload contents
    /// are never logged.
    pub async fn send(&self, conn: ConnectionId, event: &ServerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(%conn, error = %e, "failed to serialize outbound event");
                return;
            }
        };

        let mut guard = self.inner.write().await;
        match guard.get(&conn) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    guard.remove(&conn);
                    tracing::debug!(%conn, "dropped dead outbound channel");
                }
            }
            None => {
                tracing::debug!(%conn, "no outbound channel registered, event dropped");
            }
        }
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_the_registered_receiver() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let mut rx = registry.register(conn).await;

        registry.send(conn, &ServerEvent::PartnerLeft).await;
        let payload = rx.recv().await.unwrap();
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(&payload).unwrap(),
            ServerEvent::PartnerLeft
        ));
    }

    #[tokio::test]
    async fn dead_receiver_is_cleaned_up_on_send() {
        let registry = ConnectionRegistry::new();
        let conn = ConnectionId::new();
        let rx = registry.register(conn).await;
        drop(rx);

        registry.send(conn, &ServerEvent::PartnerLeft).await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_unknown_connection_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry
            .send(ConnectionId::new(), &ServerEvent::PartnerLeft)
            .await;
        assert_eq!(registry.connection_count().await, 0);
    }
}
