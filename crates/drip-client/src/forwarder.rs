//! HTTP forwarder: tunnelled request in, local response out.
//!
//! Keeps a small pool of idle connections to the local service and falls
//! back to a fresh dial. Failures synthesize a 502 so the public caller gets
//! an answer instead of a timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use drip_proto::messages::{DataPayload, HttpRequest, HttpResponse};
use drip_proto::FrameWriter;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::http::{exchange, HttpError};

/// Idle local connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// How long a reply frame may wait on the outbound queue.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards tunnelled HTTP requests to `local_addr`.
pub struct Forwarder {
    local_addr: String,
    writer: Arc<FrameWriter>,
    idle: Mutex<Vec<TcpStream>>,
}

impl Forwarder {
    pub fn new(local_addr: String, writer: Arc<FrameWriter>) -> Self {
        Self {
            local_addr,
            writer,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Handle one forwarded request end to end: dial (or reuse), exchange,
    /// and submit the reply frame tagged with the same request id.
    pub async fn handle_request(&self, id: String, request: HttpRequest) {
        let response = match self.forward(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(request_id = %id, error = %err, "local forward failed");
                local_error_response(&err)
            }
        };

        let frame = DataPayload::Response { id: id.clone(), response }.into_frame();
        if let Err(err) = self.writer.submit(frame, SUBMIT_TIMEOUT).await {
            warn!(request_id = %id, error = %err, "failed to submit response frame");
        }
    }

    async fn forward(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        // Try one pooled connection; a stale one surfaces as an immediate
        // error and we dial fresh.
        if let Some(mut conn) = self.checkout() {
            match exchange(&mut conn, request).await {
                Ok(outcome) => {
                    if outcome.reusable {
                        self.checkin(conn);
                    }
                    return Ok(outcome.response);
                }
                Err(err) => {
                    debug!(error = %err, "pooled connection failed, dialing fresh");
                }
            }
        }

        let mut conn = TcpStream::connect(&self.local_addr).await?;
        let outcome = exchange(&mut conn, request).await?;
        if outcome.reusable {
            self.checkin(conn);
        }
        Ok(outcome.response)
    }

    fn checkout(&self) -> Option<TcpStream> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn checkin(&self, conn: TcpStream) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

fn local_error_response(err: &HttpError) -> HttpResponse {
    let body = format!("drip: local service error: {err}");
    HttpResponse {
        status: 502,
        headers: vec![
            ("Content-Type".to_string(), "text/plain; charset=utf-8".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
        body: body.into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_proto::{read_frame, FrameType, WriterConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_local_http(reply: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(reply).await;
                });
            }
        });
        addr
    }

    fn get_request(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url: path.to_string(),
            headers: vec![("Host".to_string(), "abc.example.test".to_string())],
            body: vec![],
        }
    }

    #[tokio::test]
    async fn test_request_forwarded_and_reply_framed() {
        let local = spawn_local_http(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong").await;

        let (writer_side, mut frames) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        let forwarder = Forwarder::new(local.to_string(), writer);

        forwarder
            .handle_request("a".repeat(32), get_request("/ping"))
            .await;

        let frame = read_frame(&mut frames).await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Data);
        match DataPayload::decode(frame.payload()).unwrap() {
            DataPayload::Response { id, response } => {
                assert_eq!(id, "a".repeat(32));
                assert_eq!(response.status, 200);
                assert_eq!(response.body, b"pong");
            }
            other => panic!("expected response envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_local_service_becomes_502() {
        let (writer_side, mut frames) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        // Port 1 is never listening.
        let forwarder = Forwarder::new("127.0.0.1:1".to_string(), writer);

        forwarder
            .handle_request("b".repeat(32), get_request("/"))
            .await;

        let frame = read_frame(&mut frames).await.unwrap();
        match DataPayload::decode(frame.payload()).unwrap() {
            DataPayload::Response { response, .. } => {
                assert_eq!(response.status, 502);
            }
            other => panic!("expected response envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let local = spawn_local_http(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

        let (writer_side, mut frames) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::spawn(writer_side, WriterConfig::default()));
        let forwarder = Forwarder::new(local.to_string(), writer);

        forwarder
            .handle_request("c".repeat(32), get_request("/1"))
            .await;
        let _ = read_frame(&mut frames).await.unwrap();

        assert_eq!(
            forwarder.idle.lock().unwrap().len(),
            1,
            "keep-alive connection returns to the pool"
        );

        forwarder
            .handle_request("d".repeat(32), get_request("/2"))
            .await;
        let _ = read_frame(&mut frames).await.unwrap();
    }
}
