//! Opaque byte-stream relays for `https` and `tcp` tunnels.
//!
//! Both share one mechanism: a public socket is assigned a stream id, its
//! bytes travel the control link as stream frames, and a `Close` frame with
//! the id tears the stream down from either side. For `https` tunnels the
//! listener peeks the TLS ClientHello to route by SNI without terminating;
//! for `tcp` tunnels a per-tunnel listener on an allocated port accepts raw
//! connections.

use std::sync::Arc;

use bytes::Bytes;
use drip_proto::messages::{stream_close_payload, StreamDirection, StreamFrame};
use drip_proto::{generate_request_id, Frame, FrameType, TunnelType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::TunnelConnection;
use crate::registry::TunnelRegistry;
use crate::sni::extract_sni;

/// Relay one public socket over a tunnel's control link.
///
/// `initial` bytes (a peeked ClientHello) are sent ahead of the copy loops.
pub async fn relay_public_socket(
    conn: Arc<TunnelConnection>,
    socket: TcpStream,
    initial: Option<Bytes>,
) {
    let stream_id = generate_request_id();
    let mut from_tunnel = conn.streams().register(&stream_id);

    if let Some(bytes) = initial {
        let frame = StreamFrame::new(stream_id.clone(), StreamDirection::ToLocal, bytes);
        if conn.send_frame(frame.into_frame()).await.is_err() {
            conn.streams().remove(&stream_id);
            return;
        }
    }

    let (mut read_half, mut write_half) = socket.into_split();

    let public_to_tunnel = {
        let conn = conn.clone();
        let stream_id = stream_id.clone();
        async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = StreamFrame::new(
                            stream_id.clone(),
                            StreamDirection::ToLocal,
                            Bytes::copy_from_slice(&buf[..n]),
                        );
                        if conn.send_frame(frame.into_frame()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    };

    let tunnel_to_public = async move {
        while let Some(bytes) = from_tunnel.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::select! {
        _ = public_to_tunnel => {}
        _ = tunnel_to_public => {}
    }

    // Either side finished: tell the client and drop the table entry.
    conn.streams().remove(&stream_id);
    let close = Frame::new(FrameType::Close, stream_close_payload(&stream_id));
    let _ = conn.send_frame(close).await;
    debug!(subdomain = %conn.subdomain(), stream_id = %stream_id, "public stream closed");
}

/// Accept raw TLS connections and route them by SNI to `https` tunnels.
/// The TLS bytes are never decrypted here.
pub async fn run_sni_passthrough(
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    domain: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(domain = %domain, "sni passthrough listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "sni accept failed");
                        continue;
                    }
                };
                let registry = registry.clone();
                let domain = domain.clone();
                tokio::spawn(async move {
                    if let Err(reason) = route_sni_connection(socket, &registry, &domain).await {
                        debug!(peer = %peer, reason = %reason, "sni connection dropped");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("sni passthrough listener stopping");
                return;
            }
        }
    }
}

async fn route_sni_connection(
    mut socket: TcpStream,
    registry: &Arc<TunnelRegistry>,
    domain: &str,
) -> Result<(), String> {
    let mut hello = vec![0u8; 16 * 1024];
    let n = socket
        .read(&mut hello)
        .await
        .map_err(|e| format!("read failed: {e}"))?;
    if n == 0 {
        return Err("closed before client hello".to_string());
    }
    hello.truncate(n);

    let hostname = extract_sni(&hello).map_err(|e| format!("sni extraction failed: {e}"))?;
    let suffix = format!(".{domain}");
    let subdomain = hostname
        .strip_suffix(suffix.as_str())
        .ok_or_else(|| format!("host {hostname} is outside {domain}"))?;

    let conn = registry
        .get(subdomain)
        .ok_or_else(|| format!("no tunnel for {subdomain}"))?;
    if conn.tunnel_type() != TunnelType::Https {
        return Err(format!("tunnel {subdomain} is not an https tunnel"));
    }

    relay_public_socket(conn, socket, Some(Bytes::from(hello))).await;
    Ok(())
}

/// Bind a per-tunnel proxy listener for a `tcp` tunnel and relay every
/// accepted connection. The accept task is tied to the connection's
/// lifetime; returns the bound port.
pub async fn spawn_tcp_proxy(
    conn: Arc<TunnelConnection>,
    bind_host: &str,
    port: u16,
) -> Result<u16, String> {
    let listener = TcpListener::bind((bind_host, port))
        .await
        .map_err(|e| format!("failed to bind port {port}: {e}"))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("failed to resolve bound port: {e}"))?
        .port();

    info!(subdomain = %conn.subdomain(), port, "tcp proxy listening");

    let accept_conn = conn.clone();
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _peer)) => {
                    let conn = accept_conn.clone();
                    tokio::spawn(async move {
                        relay_public_socket(conn, socket, None).await;
                    });
                }
                Err(err) => {
                    warn!(subdomain = %accept_conn.subdomain(), error = %err, "tcp proxy accept failed");
                }
            }
        }
    });
    conn.track_task(handle);

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_proto::messages::parse_close_payload;
    use drip_proto::{read_frame, write_frame, FrameWriter, WriterConfig};
    use std::time::Duration;

    fn stream_tunnel(tunnel_type: TunnelType, subdomain: &str) -> (Arc<TunnelRegistry>, Arc<TunnelConnection>, tokio::io::DuplexStream) {
        let registry = Arc::new(TunnelRegistry::new());
        let (writer_side, client_side) = tokio::io::duplex(1024 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        let conn = registry
            .register(writer, tunnel_type, Some(subdomain))
            .unwrap();
        (registry, conn, client_side)
    }

    #[tokio::test]
    async fn test_tcp_proxy_round_trip() {
        let (_registry, conn, mut client_side) = stream_tunnel(TunnelType::Tcp, "rawtcp");

        let port = spawn_tcp_proxy(conn.clone(), "127.0.0.1", 0).await.unwrap();

        // Fake tunnel client: first frame opens the stream, echo bytes back.
        let echo = tokio::spawn(async move {
            let frame = read_frame(&mut client_side).await.unwrap();
            let stream = StreamFrame::decode(frame.payload()).unwrap();
            assert_eq!(stream.direction, StreamDirection::ToLocal);
            assert_eq!(stream.data.as_ref(), b"ping");

            let reply = StreamFrame::new(stream.id.clone(), StreamDirection::ToPublic, Bytes::from_static(b"pong"));
            write_frame(&mut client_side, &reply.into_frame()).await.unwrap();
            (client_side, stream.id)
        });

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        public.write_all(b"ping").await.unwrap();

        let (mut client_side, stream_id) = echo.await.unwrap();

        // The fake client's reply travels the inbound demux in the control
        // handler in production; deliver it directly here.
        let frame = read_frame(&mut client_side); // next frame will be the close
        conn.streams().deliver(&stream_id, Bytes::from_static(b"pong")).await;

        let mut got = [0u8; 4];
        public.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        // Closing the public socket emits a stream close frame.
        drop(public);
        let close = tokio::time::timeout(Duration::from_secs(2), frame)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);
        assert_eq!(parse_close_payload(close.payload()).unwrap(), Some(stream_id));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_tcp_proxy_dies_with_connection() {
        let (_registry, conn, _client_side) = stream_tunnel(TunnelType::Tcp, "shortlived");
        let port = spawn_tcp_proxy(conn.clone(), "127.0.0.1", 0).await.unwrap();

        conn.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The listener task was aborted; new connections go nowhere.
        let result = TcpStream::connect(("127.0.0.1", port)).await;
        if let Ok(mut socket) = result {
            // Connection may be accepted by the dying socket backlog, but no
            // bytes will ever come back.
            socket.write_all(b"x").await.ok();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_millis(200), socket.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) | Err(_) | Ok(Err(_)) => {}
                Ok(Ok(_)) => panic!("aborted proxy must not serve data"),
            }
        }
    }
}
