//! Server wiring: listeners, sweepers, graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::control::{ControlConfig, ControlContext, TcpProxySpawner};
use crate::listener::ControlListener;
use crate::passthrough::{run_sni_passthrough, spawn_tcp_proxy};
use crate::pending::PendingRequests;
use crate::ports::PortAllocator;
use crate::proxy::{HttpProxy, ProxyConfig};
use crate::registry::TunnelRegistry;
use crate::tls::{acceptor, load_server_config, TlsError};
use drip_proto::subdomain::ReservedSubdomains;

/// Idle links are evicted after this much silence.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Registry sweep cadence.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Pending-request sweep cadence and age ceiling.
pub const DEFAULT_PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PENDING_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public base domain; tunnels live at `<subdomain>.<domain>`.
    pub domain: String,
    /// Where clients connect their control links.
    pub control_addr: SocketAddr,
    /// Public HTTP dispatcher address.
    pub public_addr: SocketAddr,
    /// SNI passthrough address for `https` tunnels, if enabled.
    pub sni_addr: Option<SocketAddr>,
    /// PEM certificate/key for the control listener and public TLS.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Shared secret clients must present; `None` disables authentication.
    pub auth_token: Option<String>,
    /// Inclusive public port range for `tcp` tunnels.
    pub tcp_port_range: Option<(u16, u16)>,
    /// Extra reserved subdomain labels on top of the defaults.
    pub reserved_subdomains: Vec<String>,
    /// Ceiling a public request waits for its reply.
    pub request_timeout: Duration,
    /// Idle eviction threshold.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            control_addr: "0.0.0.0:7000".parse().unwrap(),
            public_addr: "0.0.0.0:8080".parse().unwrap(),
            sni_addr: None,
            tls_cert: None,
            tls_key: None,
            auth_token: None,
            tcp_port_range: None,
            reserved_subdomains: Vec::new(),
            request_timeout: crate::proxy::DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// The assembled server. Owns the registry, the pending map, and every
/// listener task.
pub struct Server {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
    pending: Arc<PendingRequests>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let reserved = ReservedSubdomains::with_extra(config.reserved_subdomains.clone());
        Self {
            config,
            registry: Arc::new(TunnelRegistry::with_reserved(reserved)),
            pending: Arc::new(PendingRequests::new()),
        }
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Run until `shutdown` flips, then tear everything down gracefully:
    /// accept loops stop first, then every writer drains and the maps clear.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let tls = match (&self.config.tls_cert, &self.config.tls_key) {
            (Some(cert), Some(key)) => Some(acceptor(load_server_config(cert, key)?)),
            _ => {
                info!("no tls certificate configured, serving plaintext");
                None
            }
        };

        let registry_sweeper = self
            .registry
            .spawn_sweeper(DEFAULT_SWEEP_INTERVAL, self.config.idle_timeout);
        let pending_sweeper = self
            .pending
            .spawn_sweeper(DEFAULT_PENDING_SWEEP_INTERVAL, DEFAULT_PENDING_MAX_AGE);

        let tcp_ports = self
            .config
            .tcp_port_range
            .map(|(start, end)| Arc::new(PortAllocator::new(start, end)));
        let tcp_spawner: Option<TcpProxySpawner> = tcp_ports.as_ref().map(|ports| {
            let ports = ports.clone();
            let spawner: TcpProxySpawner = Arc::new(move |conn| {
                let ports = ports.clone();
                Box::pin(async move {
                    let subdomain = conn.subdomain().to_string();
                    let port = ports
                        .allocate(&subdomain)
                        .ok_or_else(|| "tcp port range exhausted".to_string())?;
                    match spawn_tcp_proxy(conn, "0.0.0.0", port).await {
                        Ok(port) => Ok(port),
                        Err(err) => {
                            ports.release(&subdomain);
                            Err(err)
                        }
                    }
                })
            });
            spawner
        });

        let ctx = Arc::new(ControlContext {
            registry: self.registry.clone(),
            pending: self.pending.clone(),
            config: ControlConfig {
                domain: self.config.domain.clone(),
                public_port: self.config.public_addr.port(),
                public_tls: tls.is_some(),
                sni_port: self.config.sni_addr.map(|addr| addr.port()),
                auth_token: self.config.auth_token.clone(),
                ..Default::default()
            },
            tcp_spawner,
            tcp_ports,
        });

        let control_socket = self.bind(self.config.control_addr).await?;
        let public_socket = self.bind(self.config.public_addr).await?;
        let sni_socket = match self.config.sni_addr {
            Some(addr) => Some(self.bind(addr).await?),
            None => None,
        };

        let control = ControlListener::new(ctx, tls.clone());
        let control_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { control.run(control_socket, shutdown).await })
        };

        let proxy = Arc::new(HttpProxy::new(
            self.registry.clone(),
            self.pending.clone(),
            ProxyConfig {
                domain: self.config.domain.clone(),
                request_timeout: self.config.request_timeout,
                ..Default::default()
            },
        ));
        let proxy_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { proxy.run(public_socket, tls, shutdown).await })
        };

        let sni_task = sni_socket.map(|socket| {
            let registry = self.registry.clone();
            let domain = self.config.domain.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_sni_passthrough(socket, registry, domain, shutdown).await })
        });

        // Wait for the stop signal, then drain in order: accept loops first,
        // then live links, then the background sweepers.
        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        let _ = control_task.await;
        let _ = proxy_task.await;
        if let Some(task) = sni_task {
            let _ = task.await;
        }

        self.registry.shutdown().await;
        registry_sweeper.abort();
        pending_sweeper.abort();
        info!("server stopped");
        Ok(())
    }

    async fn bind(&self, addr: SocketAddr) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.domain, "localhost");
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(config.tls_cert.is_none());
    }

    #[tokio::test]
    async fn test_server_runs_and_stops() {
        let config = ServerConfig {
            control_addr: "127.0.0.1:0".parse().unwrap(),
            public_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = Server::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = tokio::spawn(async move { server.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("server stops promptly")
            .unwrap();
        assert!(result.is_ok());
    }
}
