use crate::state::AppState;
use crate::websocket::ConnectionId;
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use event_schema::{ClientEvent, ServerEvent};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;

// Message type for pushing relayed text frames into the actor
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct OutboundText(String);

/// One websocket connection. Pure dispatch: inbound events go to the
/// matching engine or, for relayed events, to the session peer's outbound
/// channel. Ciphertext payloads are never inspected or logged.
struct WsSession {
    conn_id: ConnectionId,
    state: AppState,
    hb: Instant,
    outbound: Option<UnboundedReceiver<String>>,
}

impl WsSession {
    fn new(conn_id: ConnectionId, state: AppState, outbound: UnboundedReceiver<String>) -> Self {
        Self {
            conn_id,
            state,
            hb: Instant::now(),
            outbound: Some(outbound),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.state.config.client_timeout;
        ctx.run_interval(self.state.config.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(conn = %act.conn_id, "heartbeat timed out, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

// Standalone async dispatch so the actor handler stays non-blocking
async fn handle_client_event(state: AppState, conn: ConnectionId, evt: ClientEvent) {
    match evt {
        ClientEvent::Announce {
            interest,
            display_name,
        } => {
            state.matchmaker.announce(conn, &interest, display_name).await;
        }
        ClientEvent::PublicKey { key } => {
            relay_to_peer(&state, conn, ServerEvent::PublicKey { key }).await;
        }
        ClientEvent::Message { ciphertext, tag } => {
            relay_to_peer(&state, conn, ServerEvent::Message { ciphertext, tag }).await;
        }
        ClientEvent::Typing { typing } => {
            relay_to_peer(&state, conn, ServerEvent::Typing { typing }).await;
        }
    }
}

/// Forwards a relayed event verbatim to the sender's session peer. With no
/// active session the event is dropped, not an error: the partner may have
/// disconnected a moment ago.
async fn relay_to_peer(state: &AppState, conn: ConnectionId, event: ServerEvent) {
    match state.matchmaker.session_peer(conn).await {
        Some(peer) => state.registry.send(peer, &event).await,
        None => tracing::debug!(conn = %conn, "dropped relay event from unpaired connection"),
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(conn = %self.conn_id, "websocket connection opened");
        self.hb(ctx);

        // Bridge the registry's outbound channel into the actor
        let addr = ctx.address();
        if let Some(mut rx) = self.outbound.take() {
            tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    addr.do_send(OutboundText(payload));
                }
            });
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(conn = %self.conn_id, "websocket connection closed");

        let state = self.state.clone();
        let conn = self.conn_id;
        actix::spawn(async move {
            state.registry.unregister(conn).await;
            state.matchmaker.disconnect(conn).await;
        });
    }
}

impl Handler<OutboundText> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(evt) => {
                    let state = self.state.clone();
                    let conn = self.conn_id;
                    actix::spawn(handle_client_event(state, conn, evt));
                }
                Err(e) => {
                    tracing::warn!(conn = %self.conn_id, error = %e, "ignoring unparseable frame");
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(conn = %self.conn_id, "binary frames are not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(conn = %self.conn_id, ?reason, "close frame received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let conn_id = ConnectionId::new();
    let outbound = state.registry.register(conn_id).await;
    let session = WsSession::new(conn_id, state.as_ref().clone(), outbound);

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            // The actor never started, so its stopped() cleanup will not run.
            let state = state.as_ref().clone();
            tokio::spawn(async move { state.registry.unregister(conn_id).await });
            Err(e)
        }
    }
}
