//! The control-link client.
//!
//! Connects to the server (TLS unless testing locally), performs the
//! registration handshake, then serves the link: answering heartbeats,
//! dispatching forwarded HTTP requests to a worker pool, and relaying
//! opaque streams. Lost links are retried on a fixed cadence unless the
//! failure is non-retryable (bad token, bad subdomain).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use drip_pool::WorkerPool;
use drip_proto::messages::{
    parse_close_payload, DataPayload, ErrorData, RegisterAck, RegisterRequest, StreamFrame,
};
use drip_proto::{
    json_frame, read_frame, write_frame, Frame, FrameError, FrameType, FrameWriter, TunnelType,
    WriterConfig,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

use crate::forwarder::Forwarder;
use crate::streams::LocalStreams;
use crate::tls;

/// How long the client waits for the `RegisterAck`.
const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect behaviour after a lost link.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// Server control address, `host:port`.
    pub server_addr: String,
    pub token: String,
    pub tunnel_type: TunnelType,
    pub subdomain: Option<String>,
    /// Local service to expose.
    pub local_host: String,
    pub local_port: u16,
    /// Wrap the control link in TLS.
    pub tls: bool,
    /// Skip certificate verification (self-signed test servers).
    pub insecure: bool,
    pub reconnect: ReconnectPolicy,
}

impl TunnelClientConfig {
    fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    fn server_host(&self) -> &str {
        self.server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server_addr)
    }
}

/// Details of a successful registration.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub subdomain: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("registration failed: {code}: {message}")]
    Registration { code: String, message: String },

    #[error("no registration ack within deadline")]
    RegistrationTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("giving up after {0} reconnect attempts")]
    ReconnectExhausted(usize),
}

impl ClientError {
    /// Naming and authentication failures will fail identically on the next
    /// attempt; everything else is worth a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Registration { code, .. } => !matches!(
                code.as_str(),
                "unauthorized" | "invalid_subdomain" | "reserved_subdomain" | "subdomain_taken"
            ),
            ClientError::ReconnectExhausted(_) => false,
            _ => true,
        }
    }
}

/// A tunnel client bound to one local service.
pub struct TunnelClient {
    config: TunnelClientConfig,
}

impl TunnelClient {
    pub fn new(config: TunnelClientConfig) -> Self {
        Self { config }
    }

    /// Run until the server closes the tunnel or a non-retryable error.
    /// `on_registered` fires after every successful registration (including
    /// re-registrations after a reconnect).
    pub async fn run(
        &self,
        mut on_registered: impl FnMut(&TunnelInfo),
    ) -> Result<(), ClientError> {
        let mut attempts = 0usize;
        loop {
            let mut registered = false;
            let result = {
                let registered = &mut registered;
                self.session(&mut |info| {
                    *registered = true;
                    on_registered(info);
                })
                .await
            };
            if registered {
                attempts = 0;
            }

            match result {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.config.reconnect.max_attempts {
                        warn!(error = %err, attempts, "reconnect attempts exhausted");
                        return Err(ClientError::ReconnectExhausted(attempts));
                    }
                    warn!(
                        error = %err,
                        attempt = attempts,
                        max = self.config.reconnect.max_attempts,
                        "connection lost, reconnecting"
                    );
                    tokio::time::sleep(self.config.reconnect.interval).await;
                }
            }
        }
    }

    /// One full session: connect, register, serve until the link ends.
    /// `Ok(())` means the server closed the tunnel deliberately.
    async fn session(
        &self,
        on_registered: &mut dyn FnMut(&TunnelInfo),
    ) -> Result<(), ClientError> {
        let mut stream = self.connect().await?;

        let register = json_frame(
            FrameType::Register,
            &RegisterRequest {
                token: self.config.token.clone(),
                subdomain: self.config.subdomain.clone(),
                tunnel_type: self.config.tunnel_type,
            },
        );
        write_frame(&mut stream, &register).await?;

        let first = tokio::time::timeout(REGISTER_ACK_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| ClientError::RegistrationTimeout)??;

        let info = match first.frame_type() {
            FrameType::RegisterAck => {
                let ack: RegisterAck = serde_json::from_slice(first.payload())
                    .map_err(|e| ClientError::Protocol(format!("bad register ack: {e}")))?;
                match ack {
                    RegisterAck::Ok { subdomain, url } => TunnelInfo { subdomain, url },
                    RegisterAck::Err { error, message } => {
                        return Err(ClientError::Registration {
                            code: error,
                            message,
                        })
                    }
                }
            }
            FrameType::Error => {
                let data: ErrorData = serde_json::from_slice(first.payload())
                    .map_err(|e| ClientError::Protocol(format!("bad error frame: {e}")))?;
                return Err(ClientError::Registration {
                    code: data.code,
                    message: data.message,
                });
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected register ack, got {other}"
                )))
            }
        };

        info!(subdomain = %info.subdomain, url = %info.url, "tunnel registered");
        on_registered(&info);

        let (mut reader, write_half) = tokio::io::split(stream);
        let writer = Arc::new(FrameWriter::spawn(write_half, WriterConfig::default()));

        let forwarder = Arc::new(Forwarder::new(self.config.local_addr(), writer.clone()));
        let streams = Arc::new(LocalStreams::new(self.config.local_addr(), writer.clone()));
        let workers = WorkerPool::new(50, 1000);

        let result = loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(err) => break Err(ClientError::Frame(err)),
            };

            match frame.frame_type() {
                FrameType::Heartbeat => {
                    let ack = Frame::new(
                        FrameType::HeartbeatAck,
                        Bytes::copy_from_slice(frame.payload()),
                    );
                    if let Err(err) = writer.try_submit(ack) {
                        debug!(error = %err, "failed to queue heartbeat ack");
                    }
                }
                FrameType::HeartbeatAck => {}
                FrameType::Data => {
                    if self.config.tunnel_type.is_stream() {
                        match StreamFrame::decode(frame.payload()) {
                            Ok(stream_frame) => streams.handle_frame(stream_frame).await,
                            Err(err) => {
                                warn!(error = %err, "malformed stream frame, dropping")
                            }
                        }
                    } else {
                        match DataPayload::decode(frame.payload()) {
                            Ok(DataPayload::Request { id, request }) => {
                                let forwarder = forwarder.clone();
                                workers.submit(async move {
                                    forwarder.handle_request(id, request).await;
                                });
                            }
                            Ok(DataPayload::Response { id, .. }) => {
                                warn!(request_id = %id, "server sent a response envelope, dropping");
                            }
                            Err(err) => {
                                warn!(error = %err, "malformed data envelope, dropping");
                            }
                        }
                    }
                }
                FrameType::Close => match parse_close_payload(frame.payload()) {
                    Ok(None) => {
                        info!("server closed the tunnel");
                        break Ok(());
                    }
                    Ok(Some(stream_id)) => streams.close(&stream_id),
                    Err(err) => warn!(error = %err, "malformed close payload"),
                },
                FrameType::Error => {
                    if let Ok(data) = serde_json::from_slice::<ErrorData>(frame.payload()) {
                        warn!(code = %data.code, message = %data.message, "server reported error");
                    }
                }
                FrameType::Register | FrameType::RegisterAck => {
                    warn!(frame_type = %frame.frame_type(), "unexpected frame, dropping");
                }
            }
        };

        streams.clear();
        writer.close().await;
        workers.close().await;
        result
    }

    async fn connect(&self) -> Result<Box<dyn ControlStream>, ClientError> {
        let tcp = TcpStream::connect(&self.config.server_addr).await?;
        if !self.config.tls {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(self.config.server_host().to_string())
            .map_err(|_| ClientError::Protocol("invalid server name for tls".to_string()))?;
        let connector = tls::connector(self.config.insecure);
        let stream = connector.connect(server_name, tcp).await?;
        Ok(Box::new(stream))
    }
}

/// Object-safe alias for the control transport.
trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlStream for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_proto::messages::HttpResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(server_addr: String, local_port: u16) -> TunnelClientConfig {
        TunnelClientConfig {
            server_addr,
            token: "t".to_string(),
            tunnel_type: TunnelType::Http,
            subdomain: Some("abc123".to_string()),
            local_host: "127.0.0.1".to_string(),
            local_port,
            tls: false,
            insecure: false,
            reconnect: ReconnectPolicy {
                interval: Duration::from_millis(50),
                max_attempts: 3,
            },
        }
    }

    async fn spawn_local_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_register_forward_and_close() {
        let local_port = spawn_local_echo().await;
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap().to_string();

        // Fake server: ack registration, forward one request, then close.
        let fake = tokio::spawn(async move {
            let (mut link, _) = server.accept().await.unwrap();

            let frame = read_frame(&mut link).await.unwrap();
            assert_eq!(frame.frame_type(), FrameType::Register);
            let req: RegisterRequest = serde_json::from_slice(frame.payload()).unwrap();
            assert_eq!(req.token, "t");

            let ack = RegisterAck::Ok {
                subdomain: "abc123".to_string(),
                url: "http://abc123.example.test".to_string(),
            };
            write_frame(&mut link, &json_frame(FrameType::RegisterAck, &ack))
                .await
                .unwrap();

            let request = DataPayload::Request {
                id: "9".repeat(32),
                request: drip_proto::messages::HttpRequest {
                    method: "GET".to_string(),
                    url: "/ping".to_string(),
                    headers: vec![("Host".to_string(), "abc123.example.test".to_string())],
                    body: vec![],
                },
            };
            write_frame(&mut link, &request.into_frame()).await.unwrap();

            let reply = read_frame(&mut link).await.unwrap();
            let DataPayload::Response { id, response } =
                DataPayload::decode(reply.payload()).unwrap()
            else {
                panic!("expected response envelope");
            };
            assert_eq!(id, "9".repeat(32));
            let response: HttpResponse = response;
            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"pong");

            // Graceful close.
            write_frame(&mut link, &Frame::empty(FrameType::Close))
                .await
                .unwrap();
        });

        let client = TunnelClient::new(config(server_addr, local_port));
        let mut seen = None;
        let result = client.run(|info| seen = Some(info.clone())).await;
        assert!(result.is_ok(), "{result:?}");
        let info = seen.expect("registration callback fired");
        assert_eq!(info.subdomain, "abc123");

        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_registration_exits_immediately() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));

        let accepts_counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut link, _)) = server.accept().await else {
                    return;
                };
                accepts_counter.fetch_add(1, Ordering::SeqCst);
                let _ = read_frame(&mut link).await;
                let ack = RegisterAck::Err {
                    error: "subdomain_taken".to_string(),
                    message: "subdomain is already taken".to_string(),
                };
                let _ = write_frame(&mut link, &json_frame(FrameType::RegisterAck, &ack)).await;
            }
        });

        let client = TunnelClient::new(config(server_addr, 1));
        let err = client.run(|_| {}).await.unwrap_err();
        match &err {
            ClientError::Registration { code, .. } => assert_eq!(code, "subdomain_taken"),
            other => panic!("expected registration error, got {other:?}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(accepts.load(Ordering::SeqCst), 1, "no retry after naming error");
    }

    #[tokio::test]
    async fn test_retryable_failures_are_bounded() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));

        // A server that drops every link before acking.
        let accepts_counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((link, _)) = server.accept().await else {
                    return;
                };
                accepts_counter.fetch_add(1, Ordering::SeqCst);
                drop(link);
            }
        });

        let client = TunnelClient::new(config(server_addr, 1));
        let err = client.run(|_| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::ReconnectExhausted(3)));
        assert_eq!(accepts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retryability_classification() {
        for code in ["unauthorized", "invalid_subdomain", "reserved_subdomain", "subdomain_taken"] {
            let err = ClientError::Registration {
                code: code.to_string(),
                message: String::new(),
            };
            assert!(!err.is_retryable(), "{code}");
        }
        let err = ClientError::Registration {
            code: "port_allocation_failed".to_string(),
            message: String::new(),
        };
        assert!(err.is_retryable());
        assert!(ClientError::RegistrationTimeout.is_retryable());
    }
}
