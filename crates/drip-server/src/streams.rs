//! Per-tunnel byte-stream table.
//!
//! `https` and `tcp` tunnels multiplex raw public connections over the
//! control link. Each public connection gets a stream id; inbound stream
//! frames are routed here to the task that owns the public socket.

use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How many inbound chunks a stream buffers before the demux applies
/// backpressure to the control-link reader.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// How long the demux waits on a congested stream before dropping the chunk.
const DELIVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps stream ids to the tasks relaying their public sockets.
#[derive(Default)]
pub struct StreamTable {
    streams: DashMap<String, mpsc::Sender<Bytes>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Register a new stream and return the receive side for its bytes.
    pub fn register(&self, id: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.streams.insert(id.to_string(), tx);
        debug!(stream_id = %id, "registered stream");
        rx
    }

    /// Deliver inbound bytes to a stream. Returns `false` if the stream is
    /// unknown or its task stopped listening.
    pub async fn deliver(&self, id: &str, data: Bytes) -> bool {
        let tx = match self.streams.get(id) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!(stream_id = %id, "dropping bytes for unknown stream");
                return false;
            }
        };
        match tokio::time::timeout(DELIVER_TIMEOUT, tx.send(data)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(stream_id = %id, "stream receiver gone");
                false
            }
            Err(_) => {
                warn!(stream_id = %id, "timed out delivering to congested stream, dropping");
                false
            }
        }
    }

    /// Remove a stream; its receiver sees end-of-stream.
    pub fn remove(&self, id: &str) {
        if self.streams.remove(id).is_some() {
            debug!(stream_id = %id, "removed stream");
        }
    }

    /// Drop every stream (connection teardown).
    pub fn clear(&self) {
        self.streams.clear();
    }

    pub fn count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deliver_remove() {
        let table = StreamTable::new();
        let mut rx = table.register("a".repeat(32).as_str());
        assert_eq!(table.count(), 1);

        assert!(table.deliver(&"a".repeat(32), Bytes::from_static(b"hello")).await);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));

        table.remove(&"a".repeat(32));
        assert_eq!(table.count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_unknown_stream() {
        let table = StreamTable::new();
        assert!(!table.deliver("deadbeef", Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn test_clear_ends_all_streams() {
        let table = StreamTable::new();
        let mut rx1 = table.register("s1");
        let mut rx2 = table.register("s2");

        table.clear();
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }
}
