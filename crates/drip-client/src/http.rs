//! Raw HTTP/1.x handling against the local service.
//!
//! Requests are re-serialized from the tunnel envelope and written verbatim;
//! responses are read back with proper boundary detection (Content-Length,
//! chunked terminator, no-body statuses) plus an idle-timeout fallback for
//! close-delimited responses.

use std::time::Duration;

use drip_proto::messages::{HttpRequest, HttpResponse};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fallback for responses with no length information: consider the response
/// complete once the local service goes quiet for this long.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Hard ceiling on reading one response.
const RESPONSE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("local service closed the connection mid-response")]
    TruncatedResponse,

    #[error("malformed response from local service")]
    Malformed,

    #[error("timed out reading response from local service")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a tunnelled request back into raw HTTP/1.1 bytes.
pub fn serialize_request(request: &HttpRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.url.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in &request.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Whether a completed response allows the connection to be reused.
#[derive(Debug)]
pub struct ReadOutcome {
    pub response: HttpResponse,
    pub reusable: bool,
}

/// Write `request` to the local service and read the full response.
pub async fn exchange<S>(stream: &mut S, request: &HttpRequest) -> Result<ReadOutcome, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&serialize_request(request)).await?;
    stream.flush().await?;
    read_response(stream).await
}

/// Read one response off `stream`, body bytes kept verbatim (including any
/// chunked framing, so they can be forwarded untouched).
pub async fn read_response<S>(stream: &mut S) -> Result<ReadOutcome, HttpError>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + RESPONSE_DEADLINE;
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0u8; 32 * 1024];

    // Parse headers first.
    let head = loop {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| HttpError::Timeout)??;
        if n == 0 {
            return Err(HttpError::TruncatedResponse);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let status = parsed.code.ok_or(HttpError::Malformed)?;
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
                break (status, headers, header_len);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(HttpError::Malformed),
        }
    };
    let (status, headers, header_len) = head;
    let mut body = buf.split_off(header_len);

    let content_length = header_value(&headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok());
    let chunked = header_value(&headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let wants_close = header_value(&headers, "connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false);
    // 1xx, 204 and 304 never carry a body.
    let no_body = matches!(status, 100..=199 | 204 | 304);

    if no_body {
        return Ok(ReadOutcome {
            response: HttpResponse {
                status,
                headers,
                body: Vec::new(),
            },
            reusable: !wants_close,
        });
    }

    if let Some(length) = content_length {
        while body.len() < length {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| HttpError::Timeout)??;
            if n == 0 {
                return Err(HttpError::TruncatedResponse);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
        return Ok(ReadOutcome {
            response: HttpResponse {
                status,
                headers,
                body,
            },
            reusable: !wants_close,
        });
    }

    if chunked {
        while !chunked_complete(&body) {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| HttpError::Timeout)??;
            if n == 0 {
                return Err(HttpError::TruncatedResponse);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        return Ok(ReadOutcome {
            response: HttpResponse {
                status,
                headers,
                body,
            },
            reusable: !wants_close,
        });
    }

    // No length information: read until close or until the service goes
    // quiet. Such connections cannot be reused.
    loop {
        let idle = tokio::time::timeout(IDLE_TIMEOUT, stream.read(&mut chunk));
        match tokio::time::timeout_at(deadline, idle).await {
            Err(_) => return Err(HttpError::Timeout),
            Ok(Err(_)) => break, // idle: response is as complete as it gets
            Ok(Ok(Ok(0))) => break,
            Ok(Ok(Ok(n))) => body.extend_from_slice(&chunk[..n]),
            Ok(Ok(Err(err))) => return Err(err.into()),
        }
    }
    Ok(ReadOutcome {
        response: HttpResponse {
            status,
            headers,
            body,
        },
        reusable: false,
    })
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn chunked_complete(body: &[u8]) -> bool {
    body.len() >= 5 && body.ends_with(b"0\r\n\r\n")
}
