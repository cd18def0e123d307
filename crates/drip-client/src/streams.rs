//! Opaque stream forwarding for `https` and `tcp` tunnels.
//!
//! The first stream frame with an unknown id opens a connection to the local
//! service; bytes then flow both ways until a `Close` frame arrives or either
//! socket ends, at which point a `Close` frame goes back to the server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use drip_proto::messages::{stream_close_payload, StreamDirection, StreamFrame};
use drip_proto::{Frame, FrameType, FrameWriter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STREAM_CHANNEL_CAPACITY: usize = 64;
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side stream table: stream id to the task owning the local socket.
pub struct LocalStreams {
    local_addr: String,
    writer: Arc<FrameWriter>,
    streams: Arc<DashMap<String, mpsc::Sender<Bytes>>>,
}

impl LocalStreams {
    pub fn new(local_addr: String, writer: Arc<FrameWriter>) -> Self {
        Self {
            local_addr,
            writer,
            streams: Arc::new(DashMap::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.streams.len()
    }

    /// Route one inbound stream frame, opening the local connection for a
    /// new stream id.
    pub async fn handle_frame(&self, frame: StreamFrame) {
        if frame.direction != StreamDirection::ToLocal {
            warn!(stream_id = %frame.id, "stream frame with wrong direction, dropping");
            return;
        }

        if let Some(entry) = self.streams.get(&frame.id) {
            let tx = entry.value().clone();
            drop(entry);
            if tx.send(frame.data).await.is_err() {
                debug!(stream_id = %frame.id, "stream task gone, dropping bytes");
            }
            return;
        }

        self.open_stream(frame.id, frame.data).await;
    }

    /// Close one stream (server sent `Close` for it).
    pub fn close(&self, id: &str) {
        if self.streams.remove(id).is_some() {
            debug!(stream_id = %id, "stream closed by server");
        }
    }

    /// Drop every stream (link teardown).
    pub fn clear(&self) {
        self.streams.clear();
    }

    async fn open_stream(&self, id: String, initial: Bytes) {
        let local = match TcpStream::connect(&self.local_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(stream_id = %id, error = %err, "failed to open local connection");
                self.send_close(&id).await;
                return;
            }
        };
        debug!(stream_id = %id, local = %self.local_addr, "opened local stream");

        let (tx, mut rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        self.streams.insert(id.clone(), tx);

        let (mut read_half, mut write_half) = local.into_split();
        let writer = self.writer.clone();
        let streams = self.streams.clone();

        tokio::spawn(async move {
            let to_local = async {
                if write_half.write_all(&initial).await.is_err() {
                    return;
                }
                while let Some(bytes) = rx.recv().await {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            };

            let from_local = {
                let writer = writer.clone();
                let id = id.clone();
                async move {
                    let mut buf = vec![0u8; 32 * 1024];
                    loop {
                        match read_half.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let frame = StreamFrame::new(
                                    id.clone(),
                                    StreamDirection::ToPublic,
                                    Bytes::copy_from_slice(&buf[..n]),
                                );
                                if writer.submit(frame.into_frame(), SUBMIT_TIMEOUT).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            };

            tokio::select! {
                _ = to_local => {}
                _ = from_local => {}
            }

            streams.remove(&id);
            let close = Frame::new(FrameType::Close, stream_close_payload(&id));
            let _ = writer.submit(close, SUBMIT_TIMEOUT).await;
            debug!(stream_id = %id, "local stream finished");
        });
    }

    async fn send_close(&self, id: &str) {
        let close = Frame::new(FrameType::Close, stream_close_payload(id));
        let _ = self.writer.submit(close, SUBMIT_TIMEOUT).await;
    }
}
