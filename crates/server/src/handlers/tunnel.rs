//! WebSocket endpoint carrying Wisp-framed tunnel sessions.

use crate::metrics;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use gantry_tunnel::protocol;
use gantry_tunnel::{TcpDialer, TunnelSession};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound frame queue depth per session.
const OUTBOUND_QUEUE: usize = 64;

/// `GET /tunnel` (behind the session middleware).
pub async fn upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    metrics::TUNNEL_SESSIONS.inc();
    tracing::debug!("tunnel session opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);

    // Single writer task: outbound frames are serialized on the WS writer
    // and never interleaved at the byte level.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink
                .send(Message::Binary(protocol::encode(&frame)))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = TunnelSession::new(tx, Arc::new(TcpDialer));
    session.open().await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match protocol::decode(&data) {
                Ok(frame) => session.handle_frame(frame).await,
                Err(e) => {
                    tracing::debug!(error = %e, "malformed tunnel frame, closing session");
                    break;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            // Text/ping/pong frames are not part of the protocol.
            Ok(_) => {}
        }
    }

    session.shutdown().await;
    drop(session);
    let _ = writer.await;

    metrics::TUNNEL_SESSIONS.dec();
    tracing::debug!("tunnel session closed");
}
