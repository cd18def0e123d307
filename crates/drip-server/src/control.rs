//! Per-link control handler.
//!
//! The first frame on any inbound link must be `Register`, inside a short
//! deadline, with a token matching the configured shared secret. After the
//! `RegisterAck` the link settles into its steady state: a batched writer
//! owns the write half (heartbeats every 30 s ride the batch path) and this
//! handler owns the read half, demultiplexing responses, stream bytes,
//! heartbeat acks, and close requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use drip_proto::messages::{
    parse_close_payload, DataPayload, ErrorData, Heartbeat, RegisterAck, RegisterRequest,
    StreamDirection, StreamFrame,
};
use drip_proto::{
    json_frame, read_frame, write_frame, Frame, FrameError, FrameType, FrameWriter, TunnelType,
    WriterConfig,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::connection::TunnelConnection;
use crate::pending::PendingRequests;
use crate::registry::{RegistryError, TunnelRegistry};

/// How often the inbound loop wakes to check whether the connection was
/// closed underneath it (idle eviction, shutdown).
const READ_POLL: Duration = Duration::from_secs(5);

/// Spawns the public-side proxy for a freshly registered `tcp` tunnel and
/// returns the allocated public port.
pub type TcpProxySpawner = Arc<
    dyn Fn(Arc<TunnelConnection>) -> Pin<Box<dyn Future<Output = Result<u16, String>> + Send>>
        + Send
        + Sync,
>;

/// Settings shared by every control link.
#[derive(Clone)]
pub struct ControlConfig {
    /// Public base domain; tunnels live at `<subdomain>.<domain>`.
    pub domain: String,
    /// Port of the public HTTP dispatcher, for `RegisterAck` URLs.
    pub public_port: u16,
    /// Whether the public dispatcher terminates TLS.
    pub public_tls: bool,
    /// Port of the SNI passthrough listener, if one runs.
    pub sni_port: Option<u16>,
    /// Shared secret; `None` disables authentication.
    pub auth_token: Option<String>,
    /// The first frame must arrive within this deadline.
    pub register_deadline: Duration,
    /// Server-to-client heartbeat cadence.
    pub heartbeat_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            public_port: 8080,
            public_tls: false,
            sni_port: None,
            auth_token: None,
            register_deadline: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ControlConfig {
    fn public_url(&self, subdomain: &str, tunnel_type: TunnelType, tcp_port: Option<u16>) -> String {
        match tunnel_type {
            TunnelType::Http => {
                let scheme = if self.public_tls { "https" } else { "http" };
                let default_port = if self.public_tls { 443 } else { 80 };
                if self.public_port == default_port {
                    format!("{scheme}://{subdomain}.{}", self.domain)
                } else {
                    format!("{scheme}://{subdomain}.{}:{}", self.domain, self.public_port)
                }
            }
            TunnelType::Https => match self.sni_port {
                Some(443) | None => format!("https://{subdomain}.{}", self.domain),
                Some(port) => format!("https://{subdomain}.{}:{port}", self.domain),
            },
            TunnelType::Tcp => {
                format!("{}:{}", self.domain, tcp_port.unwrap_or(0))
            }
        }
    }
}

/// Everything a control link needs from the rest of the server.
pub struct ControlContext {
    pub registry: Arc<TunnelRegistry>,
    pub pending: Arc<PendingRequests>,
    pub config: ControlConfig,
    pub tcp_spawner: Option<TcpProxySpawner>,
    /// Port allocator backing `tcp_spawner`; ports are released on teardown.
    pub tcp_ports: Option<Arc<crate::ports::PortAllocator>>,
}

/// Control link failures, classified for logging per the error taxonomy.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("no register frame within deadline")]
    RegisterTimeout,

    #[error("expected register frame, got {0}")]
    RegisterFirstViolated(String),

    #[error("bad register payload: {0}")]
    BadRegisterPayload(serde_json::Error),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Naming(#[from] RegistryError),

    #[error("tcp proxy setup failed: {0}")]
    TcpProxy(String),
}

impl ControlError {
    /// Whether this is an expected scanner/validation failure (WARN) rather
    /// than an operational error.
    pub fn is_protocol_noise(&self) -> bool {
        matches!(
            self,
            ControlError::Frame(_)
                | ControlError::RegisterTimeout
                | ControlError::RegisterFirstViolated(_)
                | ControlError::BadRegisterPayload(_)
                | ControlError::Unauthorized
                | ControlError::Naming(_)
        )
    }
}

/// Compare the presented token against the configured secret without
/// leaking timing. Both sides are hashed first so length is masked too.
fn token_matches(expected: &str, presented: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Drive one control link from registration to teardown.
pub async fn handle_control<S>(stream: S, ctx: Arc<ControlContext>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut write_half) = tokio::io::split(stream);

    // Registration must be the first frame, inside the deadline. Port scans
    // and stray HTTP clients die here.
    let first = tokio::time::timeout(ctx.config.register_deadline, read_frame(&mut reader))
        .await
        .map_err(|_| ControlError::RegisterTimeout)??;

    if first.frame_type() != FrameType::Register {
        return Err(ControlError::RegisterFirstViolated(
            first.frame_type().to_string(),
        ));
    }

    let request: RegisterRequest =
        serde_json::from_slice(first.payload()).map_err(ControlError::BadRegisterPayload)?;

    if let Some(expected) = ctx.config.auth_token.as_deref() {
        if !token_matches(expected, &request.token) {
            let frame = ErrorData::new("unauthorized", "invalid authentication token").into_frame();
            let _ = write_frame(&mut write_half, &frame).await;
            return Err(ControlError::Unauthorized);
        }
    }

    // The writer owns the write half from here on; heartbeats ride its
    // batch path so data cannot starve them.
    let heartbeat: drip_proto::writer::HeartbeatFn =
        Arc::new(|| Heartbeat::now().into_frame(FrameType::Heartbeat));
    let writer = Arc::new(FrameWriter::spawn(
        write_half,
        WriterConfig {
            heartbeat: Some((ctx.config.heartbeat_interval, heartbeat)),
            ..Default::default()
        },
    ));

    let conn = match ctx.registry.register(
        writer.clone(),
        request.tunnel_type,
        request.subdomain.as_deref(),
    ) {
        Ok(conn) => conn,
        Err(err) => {
            let ack = RegisterAck::Err {
                error: err.code().to_string(),
                message: err.to_string(),
            };
            let _ = writer
                .submit(json_frame(FrameType::RegisterAck, &ack), Duration::from_secs(5))
                .await;
            writer.close().await;
            return Err(err.into());
        }
    };

    // TCP tunnels need a public port before the ack can name it.
    let tcp_port = if request.tunnel_type == TunnelType::Tcp {
        let Some(spawner) = ctx.tcp_spawner.as_ref() else {
            let reason = "tcp tunnels are not enabled on this server".to_string();
            fail_registration(&ctx, &conn, "tcp_disabled", &reason).await;
            return Err(ControlError::TcpProxy(reason));
        };
        match spawner(conn.clone()).await {
            Ok(port) => Some(port),
            Err(reason) => {
                fail_registration(&ctx, &conn, "port_allocation_failed", &reason).await;
                return Err(ControlError::TcpProxy(reason));
            }
        }
    } else {
        None
    };

    let ack = RegisterAck::Ok {
        subdomain: conn.subdomain().to_string(),
        url: ctx
            .config
            .public_url(conn.subdomain(), request.tunnel_type, tcp_port),
    };
    // First frame after Register on this link, ahead of any heartbeat.
    if conn
        .send_frame(json_frame(FrameType::RegisterAck, &ack))
        .await
        .is_err()
    {
        teardown(&ctx, &conn).await;
        return Ok(());
    }

    let result = inbound_loop(&mut reader, &conn, &ctx).await;
    teardown(&ctx, &conn).await;
    result
}

async fn teardown(ctx: &Arc<ControlContext>, conn: &Arc<TunnelConnection>) {
    ctx.registry.unregister(conn.subdomain()).await;
    if conn.tunnel_type() == TunnelType::Tcp {
        if let Some(ports) = ctx.tcp_ports.as_ref() {
            ports.release(conn.subdomain());
        }
    }
}

async fn fail_registration(
    ctx: &Arc<ControlContext>,
    conn: &Arc<TunnelConnection>,
    code: &str,
    message: &str,
) {
    let ack = RegisterAck::Err {
        error: code.to_string(),
        message: message.to_string(),
    };
    let _ = conn.send_frame(json_frame(FrameType::RegisterAck, &ack)).await;
    teardown(ctx, conn).await;
}

/// Read the next frame, or `None` once the connection is flagged closed
/// (idle eviction, shutdown). The in-flight read is only ever cancelled when
/// the link is being abandoned, so no partial frame can corrupt the stream.
async fn read_frame_or_closed<R>(
    reader: &mut R,
    conn: &TunnelConnection,
) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let closed = async {
        loop {
            if conn.is_closed() {
                return;
            }
            tokio::time::sleep(READ_POLL).await;
        }
    };
    tokio::select! {
        frame = read_frame(reader) => frame.map(Some),
        _ = closed => Ok(None),
    }
}

async fn inbound_loop<R>(
    reader: &mut R,
    conn: &Arc<TunnelConnection>,
    ctx: &Arc<ControlContext>,
) -> Result<(), ControlError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame_or_closed(reader, conn).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        conn.touch();

        match frame.frame_type() {
            FrameType::HeartbeatAck => {
                if let Ok(hb) = serde_json::from_slice::<Heartbeat>(frame.payload()) {
                    let now = Heartbeat::now().timestamp_ms;
                    trace!(
                        subdomain = %conn.subdomain(),
                        rtt_ms = now.saturating_sub(hb.timestamp_ms),
                        "heartbeat ack"
                    );
                }
            }
            FrameType::Heartbeat => {
                // Clients may probe too; echo the payload back.
                let ack = Frame::new(
                    FrameType::HeartbeatAck,
                    bytes::Bytes::copy_from_slice(frame.payload()),
                );
                if let Err(err) = conn.try_send_frame(ack) {
                    debug!(subdomain = %conn.subdomain(), error = %err, "failed to ack heartbeat");
                }
            }
            FrameType::Data => {
                handle_data(conn, ctx, frame.payload()).await;
            }
            FrameType::Close => match parse_close_payload(frame.payload()) {
                Ok(None) => {
                    debug!(subdomain = %conn.subdomain(), "client requested close");
                    return Ok(());
                }
                Ok(Some(stream_id)) => {
                    conn.streams().remove(&stream_id);
                }
                Err(err) => {
                    warn!(subdomain = %conn.subdomain(), error = %err, "malformed close payload");
                }
            },
            FrameType::Error => {
                if let Ok(data) = serde_json::from_slice::<ErrorData>(frame.payload()) {
                    warn!(subdomain = %conn.subdomain(), code = %data.code, message = %data.message, "client reported error");
                }
            }
            FrameType::Register | FrameType::RegisterAck => {
                warn!(subdomain = %conn.subdomain(), frame_type = %frame.frame_type(), "unexpected frame after registration");
            }
        }
    }
}

async fn handle_data(conn: &Arc<TunnelConnection>, ctx: &Arc<ControlContext>, payload: &[u8]) {
    if conn.tunnel_type().is_stream() {
        match StreamFrame::decode(payload) {
            Ok(frame) if frame.direction == StreamDirection::ToPublic => {
                conn.streams().deliver(&frame.id, frame.data).await;
            }
            Ok(frame) => {
                warn!(subdomain = %conn.subdomain(), stream_id = %frame.id, "stream frame with wrong direction, dropping");
            }
            Err(err) => {
                warn!(subdomain = %conn.subdomain(), error = %err, "malformed stream frame, dropping");
            }
        }
        return;
    }

    match DataPayload::decode(payload) {
        Ok(DataPayload::Response { id, response }) => {
            ctx.pending.respond(&id, response);
        }
        Ok(DataPayload::Request { id, .. }) => {
            warn!(subdomain = %conn.subdomain(), request_id = %id, "client sent a request envelope, dropping");
        }
        Err(err) => {
            warn!(subdomain = %conn.subdomain(), error = %err, "malformed data envelope, dropping");
        }
    }
}
