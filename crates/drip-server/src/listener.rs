//! Control-link listener.
//!
//! Accepts TCP connections, performs the TLS 1.3 handshake, and hands each
//! link to the control handler on a bounded worker pool. Overflow falls back
//! to a one-shot task so the accept loop never stalls.

use std::sync::Arc;

use drip_pool::WorkerPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::control::{handle_control, ControlContext, ControlError};
use drip_proto::FrameError;

/// Accept loop for client control links.
pub struct ControlListener {
    ctx: Arc<ControlContext>,
    tls: Option<TlsAcceptor>,
    pool: Arc<WorkerPool>,
}

impl ControlListener {
    /// `tls: None` serves plaintext links; production deployments terminate
    /// TLS 1.3 here.
    pub fn new(ctx: Arc<ControlContext>, tls: Option<TlsAcceptor>) -> Self {
        Self {
            ctx,
            tls,
            pool: Arc::new(WorkerPool::new(50, 1000)),
        }
    }

    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(tls = self.tls.is_some(), "control listener started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(error = %err, "control accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "new control connection");

                    let ctx = self.ctx.clone();
                    let tls = self.tls.clone();
                    self.pool.submit(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(socket).await {
                                Ok(stream) => handle_control(stream, ctx).await,
                                Err(err) => {
                                    // Scanners and plain HTTP clients land here.
                                    warn!(peer = %peer, error = %err, "tls handshake failed");
                                    return;
                                }
                            },
                            None => handle_control(socket, ctx).await,
                        };
                        if let Err(err) = result {
                            log_link_error(&peer.to_string(), &err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("control listener stopping");
                    self.pool.close().await;
                    return;
                }
            }
        }
    }
}

/// Triage link failures: normal disconnects at DEBUG, protocol noise from
/// scanners at WARN, everything else at ERROR.
fn log_link_error(peer: &str, err: &ControlError) {
    if let ControlError::Frame(FrameError::Io(io_err)) = err {
        if is_disconnect(io_err) {
            debug!(peer = %peer, error = %err, "client disconnected");
            return;
        }
    }
    if err.is_protocol_noise() {
        warn!(peer = %peer, error = %err, "protocol validation failed");
    } else {
        error!(peer = %peer, error = %err, "control link failed");
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlConfig;
    use crate::pending::PendingRequests;
    use crate::registry::TunnelRegistry;
    use drip_proto::messages::{RegisterAck, RegisterRequest};
    use drip_proto::{json_frame, read_frame, write_frame, FrameType, TunnelType};
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn test_context() -> Arc<ControlContext> {
        Arc::new(ControlContext {
            registry: Arc::new(TunnelRegistry::new()),
            pending: Arc::new(PendingRequests::new()),
            config: ControlConfig {
                domain: "example.test".to_string(),
                register_deadline: Duration::from_millis(500),
                ..Default::default()
            },
            tcp_spawner: None,
            tcp_ports: None,
        })
    }

    #[tokio::test]
    async fn test_accepts_registration_over_tcp() {
        let ctx = test_context();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let control = ControlListener::new(ctx.clone(), None);
        let server = tokio::spawn(async move { control.run(listener, shutdown_rx).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let register = json_frame(
            FrameType::Register,
            &RegisterRequest {
                token: String::new(),
                subdomain: Some("viatcp".to_string()),
                tunnel_type: TunnelType::Http,
            },
        );
        write_frame(&mut client, &register).await.unwrap();

        let ack = read_frame(&mut client).await.unwrap();
        assert_eq!(ack.frame_type(), FrameType::RegisterAck);
        let ack: RegisterAck = serde_json::from_slice(ack.payload()).unwrap();
        assert!(matches!(ack, RegisterAck::Ok { .. }));
        assert_eq!(ctx.registry.count(), 1);

        shutdown_tx.send(true).unwrap();
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_scanner_connection_is_dropped() {
        let ctx = test_context();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let control = ControlListener::new(ctx.clone(), None);
        let server = tokio::spawn(async move { control.run(listener, shutdown_rx).await });

        // A plain HTTP probe never sends a Register frame.
        let mut probe = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut probe, b"GET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(ctx.registry.count(), 0);

        shutdown_tx.send(true).unwrap();
        let _ = server.await;
    }
}
