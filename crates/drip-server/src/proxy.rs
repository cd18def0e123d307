//! Public-side HTTP dispatcher.
//!
//! Terminates the public connection (optionally TLS), resolves the target
//! subdomain from the Host header, wraps the request in a Data envelope, and
//! parks on the reply slot until the client's response frame arrives or the
//! ceiling expires.
//!
//! Request lifecycle: received -> submitted -> (reply | timeout | transport
//! failure) -> released. The slot is removed in every outcome.

use std::sync::Arc;
use std::time::Duration;

use drip_pool::StreamBufferPool;
use drip_proto::messages::{DataPayload, HttpRequest, HttpResponse};
use drip_proto::{generate_request_id, TunnelType};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::pending::PendingRequests;
use crate::registry::TunnelRegistry;

/// Deadline for reading the request head off the public socket.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling a public request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default request-body cap. Base64 expansion plus the envelope must stay
/// under the 10 MiB frame ceiling.
pub const DEFAULT_MAX_BODY: usize = 6 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public base domain; tunnels live at `<subdomain>.<domain>`.
    pub domain: String,
    /// How long a request waits on its reply slot.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

#[derive(Debug, Error)]
enum RequestReadError {
    #[error("connection closed before a full request")]
    Closed,

    #[error("malformed http request")]
    Malformed,

    #[error("request body too large")]
    TooLarge,

    #[error("timed out reading request")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct RawRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawRequest {
    fn host(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            // Ports in the Host header do not participate in routing.
            .map(|(_, value)| value.split(':').next().unwrap_or(value))
    }
}

/// The public HTTP listener and request dispatcher.
pub struct HttpProxy {
    registry: Arc<TunnelRegistry>,
    pending: Arc<PendingRequests>,
    config: ProxyConfig,
    reserved: drip_proto::subdomain::ReservedSubdomains,
    read_buffers: StreamBufferPool,
}

impl HttpProxy {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        pending: Arc<PendingRequests>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            registry,
            pending,
            config,
            reserved: drip_proto::subdomain::ReservedSubdomains::default(),
            read_buffers: StreamBufferPool::new(),
        }
    }

    /// Accept public connections until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            domain = %self.config.domain,
            tls = tls.is_some(),
            "public http listener started"
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "public accept failed");
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(socket).await {
                                Ok(stream) => proxy.handle_conn(stream).await,
                                Err(err) => {
                                    warn!(peer = %peer, error = %err, "public tls handshake failed");
                                }
                            },
                            None => proxy.handle_conn(socket).await,
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("public http listener stopping");
                    return;
                }
            }
        }
    }

    /// Serve one public connection: a single request/response exchange.
    pub async fn handle_conn<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match self.read_request(&mut stream).await {
            Ok(request) => request,
            Err(RequestReadError::Closed) => return,
            Err(RequestReadError::TooLarge) => {
                let _ = write_page(&mut stream, 413, "Payload Too Large", "request body exceeds the tunnel limit").await;
                return;
            }
            Err(err) => {
                debug!(error = %err, "rejecting unreadable request");
                let _ = write_page(&mut stream, 400, "Bad Request", "malformed request").await;
                return;
            }
        };

        let Some(host) = request.host().map(|h| h.to_string()) else {
            let _ = write_page(&mut stream, 400, "Bad Request", "missing Host header").await;
            return;
        };

        let Some(subdomain) = self.route_subdomain(&host) else {
            let _ = write_landing_page(&mut stream, self.registry.count()).await;
            return;
        };

        let Some(conn) = self.registry.get(&subdomain) else {
            debug!(subdomain = %subdomain, "no tunnel for subdomain");
            let _ = write_unavailable_page(&mut stream, &subdomain).await;
            return;
        };
        if conn.tunnel_type() != TunnelType::Http {
            let _ = write_unavailable_page(&mut stream, &subdomain).await;
            return;
        }

        let request_id = generate_request_id();
        let reply = self.pending.register(&request_id);

        let envelope = DataPayload::Request {
            id: request_id.clone(),
            request: HttpRequest {
                method: request.method,
                url: request.path,
                headers: request.headers,
                body: request.body,
            },
        };

        if let Err(err) = conn.send_frame(envelope.into_frame()).await {
            warn!(subdomain = %subdomain, request_id = %request_id, error = %err, "failed to submit request to tunnel");
            self.pending.cancel(&request_id);
            // A congested writer is a timeout; a dead one is a bad gateway.
            let _ = match err {
                crate::connection::ConnectionError::SendTimeout => {
                    write_page(&mut stream, 504, "Gateway Timeout", "the tunnel is congested").await
                }
                _ => write_unavailable_page(&mut stream, &subdomain).await,
            };
            return;
        }

        match tokio::time::timeout(self.config.request_timeout, reply).await {
            Ok(Ok(response)) => {
                let _ = write_response(&mut stream, &response).await;
            }
            Ok(Err(_)) => {
                // Slot dropped underneath us (sweeper or teardown).
                self.pending.cancel(&request_id);
                let _ = write_unavailable_page(&mut stream, &subdomain).await;
            }
            Err(_) => {
                debug!(subdomain = %subdomain, request_id = %request_id, "request timed out waiting for tunnel reply");
                self.pending.cancel(&request_id);
                let _ = write_page(&mut stream, 504, "Gateway Timeout", "the tunnel did not reply in time").await;
            }
        }
    }

    /// Resolve the routed subdomain, or `None` for the landing page (bare
    /// domain, reserved labels, foreign hosts, nested labels).
    fn route_subdomain(&self, host: &str) -> Option<String> {
        let suffix = format!(".{}", self.config.domain);
        let label = host.strip_suffix(suffix.as_str())?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        if self.reserved.contains(label) {
            return None;
        }
        Some(label.to_string())
    }

    async fn read_request<S>(&self, stream: &mut S) -> Result<RawRequest, RequestReadError>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = self.read_buffers.get_medium();
        let result = self.read_request_inner(stream, &mut chunk).await;
        self.read_buffers.put_medium(chunk);
        result
    }

    async fn read_request_inner<S>(
        &self,
        stream: &mut S,
        chunk: &mut [u8],
    ) -> Result<RawRequest, RequestReadError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
        let deadline = tokio::time::Instant::now() + HEAD_READ_TIMEOUT;

        loop {
            let n = tokio::time::timeout_at(deadline, stream.read(chunk))
                .await
                .map_err(|_| RequestReadError::Timeout)??;
            if n == 0 {
                return Err(RequestReadError::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > self.config.max_body + 64 * 1024 {
                return Err(RequestReadError::TooLarge);
            }

            let mut headers = [httparse::EMPTY_HEADER; 100];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&buf) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let method = parsed.method.unwrap_or("").to_string();
                    let path = parsed.path.unwrap_or("/").to_string();
                    let headers: Vec<(String, String)> = parsed
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).to_string(),
                            )
                        })
                        .collect();

                    let body = self
                        .read_body(stream, chunk, &headers, buf.split_off(header_len))
                        .await?;
                    return Ok(RawRequest {
                        method,
                        path,
                        headers,
                        body,
                    });
                }
                Ok(httparse::Status::Partial) => continue,
                Err(_) => return Err(RequestReadError::Malformed),
            }
        }
    }

    async fn read_body<S>(
        &self,
        stream: &mut S,
        chunk: &mut [u8],
        headers: &[(String, String)],
        mut body: Vec<u8>,
    ) -> Result<Vec<u8>, RequestReadError>
    where
        S: AsyncRead + Unpin,
    {
        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());
        let chunked = headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        });

        let deadline = tokio::time::Instant::now() + HEAD_READ_TIMEOUT;

        if let Some(length) = content_length {
            if length > self.config.max_body {
                return Err(RequestReadError::TooLarge);
            }
            while body.len() < length {
                let n = tokio::time::timeout_at(deadline, stream.read(chunk))
                    .await
                    .map_err(|_| RequestReadError::Timeout)??;
                if n == 0 {
                    return Err(RequestReadError::Closed);
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(length);
            return Ok(body);
        }

        if chunked {
            // The chunk framing is forwarded verbatim; only completeness is
            // detected here.
            while !chunked_body_complete(&body) {
                if body.len() > self.config.max_body {
                    return Err(RequestReadError::TooLarge);
                }
                let n = tokio::time::timeout_at(deadline, stream.read(chunk))
                    .await
                    .map_err(|_| RequestReadError::Timeout)??;
                if n == 0 {
                    return Err(RequestReadError::Closed);
                }
                body.extend_from_slice(&chunk[..n]);
            }
            return Ok(body);
        }

        // No length information: no body.
        Ok(Vec::new())
    }
}

fn chunked_body_complete(body: &[u8]) -> bool {
    body.len() >= 5 && body.ends_with(b"0\r\n\r\n")
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Write a tunnelled response back to the public peer. Headers and body are
/// forwarded verbatim; the connection is single-use.
async fn write_response<S>(stream: &mut S, response: &HttpResponse) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    );
    let mut has_length = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
        {
            has_length = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !has_length {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await
}

async fn write_page<S>(
    stream: &mut S,
    status: u16,
    title: &str,
    message: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = format!(
        "<!doctype html><html><head><title>{status} {title}</title></head>\
         <body><h1>{status} {title}</h1><p>{message}</p><hr><p>drip</p></body></html>"
    );
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reason_phrase(status),
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

async fn write_unavailable_page<S>(stream: &mut S, subdomain: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_page(
        stream,
        502,
        "Tunnel Not Available",
        &format!("no active tunnel for <strong>{subdomain}</strong>; the client may be offline"),
    )
    .await
}

async fn write_landing_page<S>(stream: &mut S, active_tunnels: usize) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_page(
        stream,
        200,
        "drip",
        &format!("self-hosted reverse tunnel · {active_tunnels} active tunnel(s)"),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_proto::{FrameWriter, WriterConfig};
    use tokio::io::AsyncWriteExt;

    fn proxy_with_timeout(timeout: Duration) -> (Arc<HttpProxy>, Arc<TunnelRegistry>, Arc<PendingRequests>) {
        let registry = Arc::new(TunnelRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let proxy = Arc::new(HttpProxy::new(
            registry.clone(),
            pending.clone(),
            ProxyConfig {
                domain: "example.test".to_string(),
                request_timeout: timeout,
                max_body: DEFAULT_MAX_BODY,
            },
        ));
        (proxy, registry, pending)
    }

    async fn send_request(proxy: Arc<HttpProxy>, raw: &str) -> String {
        let (mut peer, server_side) = tokio::io::duplex(256 * 1024);
        let handler = tokio::spawn(async move {
            proxy.handle_conn(server_side).await;
        });
        peer.write_all(raw.as_bytes()).await.unwrap();

        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), peer.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
            }
        }
        let _ = handler.await;
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_unknown_subdomain_is_502() {
        let (proxy, _registry, pending) = proxy_with_timeout(Duration::from_secs(1));
        let before = pending.count();

        let response = send_request(
            proxy,
            "GET / HTTP/1.1\r\nHost: nosuch.example.test\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 502"), "{response}");
        assert_eq!(pending.count(), before, "pending map must be unchanged");
    }

    #[tokio::test]
    async fn test_bare_domain_gets_landing_page() {
        let (proxy, _registry, _pending) = proxy_with_timeout(Duration::from_secs(1));
        let response = send_request(proxy, "GET / HTTP/1.1\r\nHost: example.test\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("drip"));
    }

    #[tokio::test]
    async fn test_reserved_label_gets_landing_page() {
        let (proxy, _registry, _pending) = proxy_with_timeout(Duration::from_secs(1));
        let response = send_request(proxy, "GET / HTTP/1.1\r\nHost: www.example.test\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    #[tokio::test]
    async fn test_missing_host_is_400() {
        let (proxy, _registry, _pending) = proxy_with_timeout(Duration::from_secs(1));
        let response = send_request(proxy, "GET / HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }

    #[tokio::test]
    async fn test_happy_request_round_trip() {
        let (proxy, registry, pending) = proxy_with_timeout(Duration::from_secs(2));

        // Register a tunnel whose far end is a fake client task.
        let (writer_side, mut client_side) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        registry
            .register(writer, TunnelType::Http, Some("abc123"))
            .unwrap();

        let pending_for_client = pending.clone();
        tokio::spawn(async move {
            let frame = drip_proto::read_frame(&mut client_side).await.unwrap();
            let DataPayload::Request { id, request } =
                DataPayload::decode(frame.payload()).unwrap()
            else {
                panic!("expected request envelope");
            };
            assert_eq!(request.method, "GET");
            assert_eq!(request.url, "/ping");
            pending_for_client.respond(
                &id,
                HttpResponse {
                    status: 200,
                    headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
                    body: b"pong".to_vec(),
                },
            );
        });

        let response = send_request(
            proxy,
            "GET /ping HTTP/1.1\r\nHost: abc123.example.test\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("pong"), "{response}");
        assert_eq!(pending.count(), 0, "slot released after delivery");
    }

    #[tokio::test]
    async fn test_dropped_response_times_out_with_504() {
        let (proxy, registry, pending) = proxy_with_timeout(Duration::from_millis(200));

        // A tunnel that swallows the request and never replies.
        let (writer_side, mut client_side) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        registry
            .register(writer, TunnelType::Http, Some("silent"))
            .unwrap();
        tokio::spawn(async move {
            let _ = drip_proto::read_frame(&mut client_side).await;
            // Never respond.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let response = send_request(
            proxy,
            "GET / HTTP/1.1\r\nHost: silent.example.test\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 504"), "{response}");
        assert_eq!(pending.count(), 0, "entry removed on timeout");
    }

    #[tokio::test]
    async fn test_request_body_forwarded() {
        let (proxy, registry, pending) = proxy_with_timeout(Duration::from_secs(2));

        let (writer_side, mut client_side) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        registry
            .register(writer, TunnelType::Http, Some("post"))
            .unwrap();

        let pending_for_client = pending.clone();
        tokio::spawn(async move {
            let frame = drip_proto::read_frame(&mut client_side).await.unwrap();
            let DataPayload::Request { id, request } =
                DataPayload::decode(frame.payload()).unwrap()
            else {
                panic!("expected request envelope");
            };
            assert_eq!(request.body, b"{\"k\":1}");
            pending_for_client.respond(
                &id,
                HttpResponse {
                    status: 204,
                    headers: vec![],
                    body: vec![],
                },
            );
        });

        let response = send_request(
            proxy,
            "POST /api HTTP/1.1\r\nHost: post.example.test\r\nContent-Length: 7\r\n\r\n{\"k\":1}",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 204"), "{response}");
    }
}
