//! Tunnel registry: subdomain allocation and live-link bookkeeping.
//!
//! A single lock guards the subdomain maps; registration, lookup, listing,
//! and sweeping all go through it and hold it only for map work. Connection
//! teardown happens after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drip_proto::subdomain::{generate_subdomain, validate_subdomain, ReservedSubdomains};
use drip_proto::{FrameWriter, TunnelType};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::TunnelConnection;

const GENERATE_MAX_ATTEMPTS: usize = 10;
const GENERATE_FALLBACK_LENGTH: usize = 8;

/// Subdomain allocation failures, reported to the client in `RegisterAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid subdomain format")]
    InvalidSubdomain,

    #[error("subdomain is reserved")]
    ReservedSubdomain,

    #[error("subdomain is already taken")]
    SubdomainTaken,
}

impl RegistryError {
    /// Stable error code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::InvalidSubdomain => "invalid_subdomain",
            RegistryError::ReservedSubdomain => "reserved_subdomain",
            RegistryError::SubdomainTaken => "subdomain_taken",
        }
    }
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, Arc<TunnelConnection>>,
    allocated: HashSet<String>,
}

/// Maps subdomains to live control links.
pub struct TunnelRegistry {
    inner: RwLock<Inner>,
    reserved: ReservedSubdomains,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::with_reserved(ReservedSubdomains::default())
    }

    /// Use a deployment-specific reserved set.
    pub fn with_reserved(reserved: ReservedSubdomains) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            reserved,
        }
    }

    /// Register a control link, binding it to the requested subdomain or a
    /// freshly generated one. Insertion is atomic: at no instant can two
    /// links share a subdomain.
    pub fn register(
        &self,
        writer: Arc<FrameWriter>,
        tunnel_type: TunnelType,
        requested: Option<&str>,
    ) -> Result<Arc<TunnelConnection>, RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let subdomain = match requested.filter(|s| !s.is_empty()) {
            Some(requested) => {
                if !validate_subdomain(requested) {
                    return Err(RegistryError::InvalidSubdomain);
                }
                if self.reserved.contains(requested) {
                    return Err(RegistryError::ReservedSubdomain);
                }
                if inner.allocated.contains(requested) {
                    return Err(RegistryError::SubdomainTaken);
                }
                requested.to_string()
            }
            None => self.generate_unique(&inner),
        };

        let conn = Arc::new(TunnelConnection::new(subdomain.clone(), tunnel_type, writer));
        inner.tunnels.insert(subdomain.clone(), conn.clone());
        inner.allocated.insert(subdomain.clone());
        let total = inner.tunnels.len();
        drop(inner);

        info!(subdomain = %subdomain, tunnel_type = %tunnel_type, total_tunnels = total, "tunnel registered");
        Ok(conn)
    }

    /// Remove a binding and close its connection. Idempotent.
    pub async fn unregister(&self, subdomain: &str) {
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let conn = inner.tunnels.remove(subdomain);
            inner.allocated.remove(subdomain);
            conn.map(|c| (c, inner.tunnels.len()))
        };

        if let Some((conn, total)) = removed {
            conn.close().await;
            info!(subdomain = %subdomain, total_tunnels = total, "tunnel unregistered");
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<TunnelConnection>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tunnels
            .get(subdomain)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<TunnelConnection>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tunnels
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tunnels
            .len()
    }

    /// Evict connections idle for at least `timeout`. Returns how many.
    pub async fn cleanup_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<Arc<TunnelConnection>> = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let subdomains: Vec<String> = inner
                .tunnels
                .iter()
                .filter(|(_, conn)| !conn.is_alive(timeout))
                .map(|(subdomain, _)| subdomain.clone())
                .collect();
            subdomains
                .iter()
                .filter_map(|subdomain| {
                    inner.allocated.remove(subdomain);
                    inner.tunnels.remove(subdomain)
                })
                .collect()
        };

        for conn in &stale {
            conn.close().await;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up stale tunnels");
        }
        stale.len()
    }

    /// Close every connection and clear the maps.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<TunnelConnection>> = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.allocated.clear();
            inner.tunnels.drain().map(|(_, conn)| conn).collect()
        };

        info!(active_tunnels = all.len(), "shutting down tunnel registry");
        for conn in all {
            conn.close().await;
        }
    }

    /// Run `cleanup_stale` on a fixed cadence until the handle is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = registry.cleanup_stale(timeout).await;
                if evicted > 0 {
                    debug!(evicted, "sweeper pass evicted stale tunnels");
                }
            }
        })
    }

    fn generate_unique(&self, inner: &Inner) -> String {
        for _ in 0..GENERATE_MAX_ATTEMPTS {
            let candidate = generate_subdomain(0);
            if !inner.allocated.contains(&candidate) && !self.reserved.contains(&candidate) {
                return candidate;
            }
        }
        // Collisions persist at length 6; widen the label space.
        generate_subdomain(GENERATE_FALLBACK_LENGTH)
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_proto::WriterConfig;

    fn test_writer() -> Arc<FrameWriter> {
        let (client, _server) = tokio::io::duplex(16 * 1024);
        // Leak the far end so the writer does not observe EOF mid-test.
        std::mem::forget(_server);
        Arc::new(FrameWriter::spawn(client, WriterConfig::default()))
    }

    #[tokio::test]
    async fn test_register_custom_subdomain() {
        let registry = TunnelRegistry::new();
        let conn = registry
            .register(test_writer(), TunnelType::Http, Some("myapp"))
            .unwrap();
        assert_eq!(conn.subdomain(), "myapp");
        assert_eq!(registry.count(), 1);
        assert!(registry.get("myapp").is_some());
    }

    #[tokio::test]
    async fn test_register_duplicate_rejected() {
        let registry = TunnelRegistry::new();
        registry
            .register(test_writer(), TunnelType::Http, Some("myapp"))
            .unwrap();

        let err = registry
            .register(test_writer(), TunnelType::Http, Some("myapp"))
            .unwrap_err();
        assert_eq!(err, RegistryError::SubdomainTaken);
        assert_eq!(err.code(), "subdomain_taken");

        // Exactly one binding survives.
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_register_reserved_rejected() {
        let registry = TunnelRegistry::new();
        let err = registry
            .register(test_writer(), TunnelType::Http, Some("api"))
            .unwrap_err();
        assert_eq!(err, RegistryError::ReservedSubdomain);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_register_invalid_rejected() {
        let registry = TunnelRegistry::new();
        for bad in ["ab", "-abc", "Hello", "my_app"] {
            let err = registry
                .register(test_writer(), TunnelType::Http, Some(bad))
                .unwrap_err();
            assert_eq!(err, RegistryError::InvalidSubdomain, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_auto_assignment() {
        let registry = TunnelRegistry::new();
        let conn = registry
            .register(test_writer(), TunnelType::Http, None)
            .unwrap();
        assert_eq!(conn.subdomain().len(), 6);
        assert!(validate_subdomain(conn.subdomain()));
    }

    #[tokio::test]
    async fn test_empty_request_means_auto() {
        let registry = TunnelRegistry::new();
        let conn = registry
            .register(test_writer(), TunnelType::Http, Some(""))
            .unwrap();
        assert_eq!(conn.subdomain().len(), 6);
    }

    #[tokio::test]
    async fn test_unregister_allows_reuse() {
        let registry = TunnelRegistry::new();
        registry
            .register(test_writer(), TunnelType::Http, Some("myapp"))
            .unwrap();
        registry.unregister("myapp").await;
        assert!(registry.get("myapp").is_none());

        registry
            .register(test_writer(), TunnelType::Http, Some("myapp"))
            .unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let registry = TunnelRegistry::new();
        registry.unregister("nosuch").await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_stale_evicts_and_closes() {
        let registry = TunnelRegistry::new();
        let conn = registry
            .register(test_writer(), TunnelType::Http, Some("sleepy"))
            .unwrap();
        registry
            .register(test_writer(), TunnelType::Http, Some("awake"))
            .unwrap();

        conn.backdate_activity(Duration::from_secs(120));

        let evicted = registry.cleanup_stale(Duration::from_secs(90)).await;
        assert_eq!(evicted, 1);
        assert!(registry.get("sleepy").is_none());
        assert!(registry.get("awake").is_some());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let registry = TunnelRegistry::new();
        let conns: Vec<_> = (0..5)
            .map(|i| {
                registry
                    .register(test_writer(), TunnelType::Http, Some(&format!("app-{i}")))
                    .unwrap()
            })
            .collect();

        registry.shutdown().await;
        assert_eq!(registry.count(), 0);
        for conn in conns {
            assert!(conn.is_closed());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_auto_registrations_all_distinct() {
        let registry = Arc::new(TunnelRegistry::new());

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(test_writer(), TunnelType::Http, None)
                        .unwrap()
                        .subdomain()
                        .to_string()
                })
            })
            .collect();

        let mut subdomains = std::collections::HashSet::new();
        for handle in handles {
            subdomains.insert(handle.await.unwrap());
        }
        assert_eq!(subdomains.len(), 100);
        assert_eq!(registry.count(), 100);
        assert_eq!(registry.list().len(), 100);
    }

    #[tokio::test]
    async fn test_generator_respects_custom_reserved() {
        // Cannot force the RNG to collide, but a registry with an extended
        // reserved set must still reject explicit requests for those labels.
        let registry =
            TunnelRegistry::with_reserved(ReservedSubdomains::with_extra(["internal"]));
        let err = registry
            .register(test_writer(), TunnelType::Http, Some("internal"))
            .unwrap_err();
        assert_eq!(err, RegistryError::ReservedSubdomain);
    }
}
