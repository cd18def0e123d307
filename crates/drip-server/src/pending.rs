//! Pending-request correlation.
//!
//! Each public HTTP request parks on a single-shot reply slot keyed by its
//! request id. The inbound demux fulfils the slot when the matching response
//! frame arrives; one background sweeper evicts entries that never get one,
//! so memory stays bounded even when reply frames are lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use drip_proto::messages::HttpResponse;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Entry {
    tx: oneshot::Sender<HttpResponse>,
    created_at: Instant,
}

/// Tracks requests awaiting responses from tunnel clients.
#[derive(Clone)]
pub struct PendingRequests {
    entries: Arc<DashMap<String, Entry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Create the reply slot for a request id. Exactly one slot may exist per
    /// id; re-registering replaces (and thereby cancels) the old slot.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<HttpResponse> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            request_id.to_string(),
            Entry {
                tx,
                created_at: Instant::now(),
            },
        );
        debug!(request_id = %request_id, "registered pending request");
        rx
    }

    /// Deliver a response into its slot. Returns `false` when the id is
    /// unknown or the waiter already gave up; other entries are unaffected.
    pub fn respond(&self, request_id: &str, response: HttpResponse) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => {
                if entry.tx.send(response).is_err() {
                    warn!(request_id = %request_id, "reply slot waiter vanished, dropping response");
                    return false;
                }
                debug!(request_id = %request_id, "response delivered");
                true
            }
            None => {
                warn!(request_id = %request_id, "no pending entry for response, dropping");
                false
            }
        }
    }

    /// Drop the slot for a request id (timeout or error path). Idempotent.
    pub fn cancel(&self, request_id: &str) {
        if self.entries.remove(request_id).is_some() {
            debug!(request_id = %request_id, "cancelled pending request");
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Evict entries older than `max_age`. Returns how many were dropped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() < max_age);
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!(expired, remaining = self.entries.len(), "swept expired pending requests");
        }
        expired
    }

    /// Run `sweep` on a fixed cadence until the handle is dropped. One
    /// sweeper serves the whole map; requests never own timers.
    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let pending = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pending.sweep(max_age);
            }
        })
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
