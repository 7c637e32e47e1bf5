//! Bridges a tokio-tungstenite websocket to typed event channels.
//!
//! The session loop only ever sees `ClientEvent`/`ServerEvent` values; the
//! two tasks spawned here own the socket halves and die when either the
//! socket or their channel counterpart closes.

use crate::error::ClientError;
use event_schema::{ClientEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// One live relay connection, as seen by the session loop.
pub(crate) struct Link {
    pub(crate) outgoing: UnboundedSender<ClientEvent>,
    pub(crate) incoming: UnboundedReceiver<ServerEvent>,
}

pub(crate) async fn connect(url: &str) -> Result<Link, ClientError> {
    let (socket, _response) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = unbounded_channel::<ClientEvent>();
    let (in_tx, in_rx) = unbounded_channel::<ServerEvent>();

    // Writer: serialize outbound events; a dropped sender ends the session
    // cleanly with a close frame.
    tokio::spawn(async move {
        while let Some(evt) = out_rx.recv().await {
            let text = match serde_json::to_string(&evt) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Reader: parse inbound frames; pings are answered by the library while
    // the stream is polled.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(evt) => {
                            if in_tx.send(evt).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring unparseable frame from relay");
                        }
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    Ok(Link {
        outgoing: out_tx,
        incoming: in_rx,
    })
}
