//! Per-WebSocket tunnel session.

use crate::allowlist::host_allowed;
use crate::dialer::Dialer;
use crate::protocol::{CloseReason, Frame, STREAM_TYPE_TCP};
use crate::{ALLOWED_PORT, INITIAL_STREAM_CREDIT};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Read buffer size for the TCP→WS pump.
const TCP_READ_BUF: usize = 16 * 1024;

struct StreamHandle {
    writer: OwnedWriteHalf,
    reader_task: Option<JoinHandle<()>>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// One tunnel session: a stream table plus the outbound frame channel.
///
/// All outbound frames flow through one `mpsc` channel whose consumer is the
/// WebSocket writer task, so frames are atomic and never interleaved at the
/// byte level. No state survives the session.
pub struct TunnelSession {
    outbound: mpsc::Sender<Frame>,
    dialer: Arc<dyn Dialer>,
    streams: Arc<Mutex<HashMap<u32, StreamHandle>>>,
}

impl TunnelSession {
    pub fn new(outbound: mpsc::Sender<Frame>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            outbound,
            dialer,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Announce the session-wide flow-control credit on stream 0.
    pub async fn open(&self) {
        self.send(Frame::Continue {
            stream_id: 0,
            buffer_remaining: INITIAL_STREAM_CREDIT,
        })
        .await;
    }

    /// Handle one inbound frame from the WebSocket.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Connect {
                stream_id,
                stream_type,
                port,
                hostname,
            } => {
                self.handle_connect(stream_id, stream_type, port, hostname)
                    .await;
            }
            Frame::Data { stream_id, payload } => {
                self.handle_data(stream_id, payload).await;
            }
            Frame::Close { stream_id, .. } => {
                // Dropping the handle shuts the write half and stops the pump.
                self.streams.lock().await.remove(&stream_id);
            }
            Frame::Continue { .. } => {
                // Client-side credit; the server does not meter outbound data.
            }
        }
    }

    async fn handle_connect(&self, stream_id: u32, stream_type: u8, port: u16, hostname: String) {
        if stream_type != STREAM_TYPE_TCP || port != ALLOWED_PORT || !host_allowed(&hostname) {
            tracing::debug!(
                stream_id,
                stream_type,
                port,
                hostname = %hostname,
                "rejecting tunnel CONNECT"
            );
            self.send(Frame::Close {
                stream_id,
                reason: CloseReason::InvalidInfo,
            })
            .await;
            return;
        }

        let socket = match self.dialer.connect(&hostname, port).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!(stream_id, hostname = %hostname, error = %e, "tunnel dial failed");
                self.send(Frame::Close {
                    stream_id,
                    reason: CloseReason::NetworkError,
                })
                .await;
                return;
            }
        };

        let (mut read_half, writer) = socket.into_split();
        let outbound = self.outbound.clone();
        let streams = Arc::clone(&self.streams);

        // Holding the table lock across spawn + insert orders the reader's
        // own removal (which also takes the lock) after the insert.
        let mut table = self.streams.lock().await;

        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; TCP_READ_BUF];
            let reason = loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break CloseReason::Voluntary,
                    Ok(n) => {
                        let frame = Frame::Data {
                            stream_id,
                            payload: bytes::Bytes::copy_from_slice(&buf[..n]),
                        };
                        if outbound.send(frame).await.is_err() {
                            // WebSocket is gone; the session is tearing down.
                            return;
                        }
                    }
                    Err(_) => break CloseReason::NetworkError,
                }
            };
            // Remove ourselves before announcing the close so a concurrent
            // DATA frame cannot write to a half-dead stream. Disarm the
            // handle first: dropping it armed would abort this very task
            // before the CLOSE goes out.
            if let Some(mut handle) = streams.lock().await.remove(&stream_id) {
                handle.reader_task = None;
            }
            let _ = outbound
                .send(Frame::Close { stream_id, reason })
                .await;
        });

        let handle = StreamHandle {
            writer,
            reader_task: Some(reader_task),
        };
        // A CONNECT on an in-use stream id replaces the old stream.
        table.insert(stream_id, handle);
        drop(table);

        self.send(Frame::Continue {
            stream_id,
            buffer_remaining: INITIAL_STREAM_CREDIT,
        })
        .await;
        tracing::debug!(stream_id, hostname = %hostname, "tunnel stream open");
    }

    async fn handle_data(&self, stream_id: u32, payload: bytes::Bytes) {
        let mut streams = self.streams.lock().await;
        let Some(handle) = streams.get_mut(&stream_id) else {
            // Unknown stream: dropped silently.
            return;
        };
        if handle.writer.write_all(&payload).await.is_err() {
            streams.remove(&stream_id);
            drop(streams);
            self.send(Frame::Close {
                stream_id,
                reason: CloseReason::NetworkError,
            })
            .await;
        }
    }

    /// Tear down every stream. Called on WebSocket close or error.
    pub async fn shutdown(&self) {
        let mut streams = self.streams.lock().await;
        streams.clear();
    }

    /// Number of open streams (for metrics).
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    async fn send(&self, frame: Frame) {
        // A failed send means the WebSocket writer is gone; frames are
        // dropped and teardown follows.
        let _ = self.outbound.send(frame).await;
    }
}
