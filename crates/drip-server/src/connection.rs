//! Server-side record for one registered tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drip_proto::writer::SubmitError;
use drip_proto::{Frame, FrameWriter, TunnelType};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::streams::StreamTable;

/// How long a frame submission may wait on the outbound queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("send operation timed out")]
    SendTimeout,

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// One live control link, bound to a subdomain.
///
/// `last_active` refreshes on every inbound frame; the registry sweeper
/// evicts connections whose timestamp goes stale.
pub struct TunnelConnection {
    subdomain: String,
    tunnel_type: TunnelType,
    writer: Arc<FrameWriter>,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
    streams: StreamTable,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelConnection {
    pub fn new(subdomain: String, tunnel_type: TunnelType, writer: Arc<FrameWriter>) -> Self {
        Self {
            subdomain,
            tunnel_type,
            writer,
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            streams: StreamTable::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn tunnel_type(&self) -> TunnelType {
        self.tunnel_type
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    /// Queue a frame for the client, waiting up to the send timeout.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        match self.writer.submit(frame, SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SubmitError::Full) => Err(ConnectionError::SendTimeout),
            Err(SubmitError::Closed) => Err(ConnectionError::Closed),
            Err(SubmitError::Failed(err)) => Err(ConnectionError::WriteFailed(err)),
        }
    }

    /// Queue a frame without waiting for room.
    pub fn try_send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        match self.writer.try_submit(frame) {
            Ok(()) => Ok(()),
            Err(SubmitError::Full) => Err(ConnectionError::SendTimeout),
            Err(SubmitError::Closed) => Err(ConnectionError::Closed),
            Err(SubmitError::Failed(err)) => Err(ConnectionError::WriteFailed(err)),
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend the last activity happened `age` ago. Test hook for eviction.
    #[doc(hidden)]
    pub fn backdate_activity(&self, age: Duration) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() - age;
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_active().elapsed() < timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tie a helper task (e.g. a per-tunnel TCP proxy listener) to this
    /// connection's lifetime.
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Close the connection: stop helper tasks, end every stream, and shut
    /// the writer down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.streams.clear();
        self.writer.close().await;

        info!(subdomain = %self.subdomain, "connection closed");
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("subdomain", &self.subdomain)
            .field("tunnel_type", &self.tunnel_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use drip_proto::{FrameType, WriterConfig};

    fn connection_over_duplex() -> (TunnelConnection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(FrameWriter::spawn(client, WriterConfig::default()));
        (
            TunnelConnection::new("abc123".to_string(), TunnelType::Http, writer),
            server,
        )
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _server) = connection_over_duplex();
        conn.close().await;

        let err = conn
            .send_frame(Frame::new(FrameType::Data, Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (conn, _server) = connection_over_duplex();
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_liveness_tracking() {
        let (conn, _server) = connection_over_duplex();
        assert!(conn.is_alive(Duration::from_secs(90)));

        conn.backdate_activity(Duration::from_secs(120));
        assert!(!conn.is_alive(Duration::from_secs(90)));

        conn.touch();
        assert!(conn.is_alive(Duration::from_secs(90)));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_frames_reach_the_wire() {
        let (conn, mut server) = connection_over_duplex();
        conn.send_frame(Frame::new(FrameType::Data, Bytes::from_static(b"payload")))
            .await
            .unwrap();

        let frame = drip_proto::read_frame(&mut server).await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Data);
        assert_eq!(frame.payload(), b"payload");
        conn.close().await;
    }
}
