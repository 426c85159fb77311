use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::hub::Hub;
use crate::AppState;

/// `GET /ws`. The connection stays anonymous until the client's `auth` frame.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

pub async fn serve_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = hub.register(tx);

    // Ends once the hub drops the outbox or the peer stops accepting writes.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!(connection = %id, error = %e, "write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.handle_text(id, text.as_str()),
            Ok(Message::Binary(_)) => debug!(connection = %id, "ignoring binary frame"),
            Ok(Message::Close(_)) => break,
            // ping/pong are answered by the protocol layer
            Ok(_) => {}
            Err(e) => {
                warn!(connection = %id, error = %e, "socket error");
                break;
            }
        }
    }

    hub.unregister(id);
    writer.abort();
}
