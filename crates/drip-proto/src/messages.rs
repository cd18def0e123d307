//! Frame payload types.
//!
//! Control frames carry JSON objects. Data frames on `http` tunnels carry a
//! JSON envelope tagged with `kind` and correlated by `id`; Data frames on
//! `https`/`tcp` tunnels carry raw stream frames with a small fixed header.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Frame, FrameType};
use crate::id::REQUEST_ID_LEN;
use crate::tunnel_type::TunnelType;

/// Payload decode errors.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed stream frame: {0}")]
    BadStreamFrame(&'static str),
}

// Bodies are raw bytes; JSON carries them base64-encoded.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// First frame on every link: the client's registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub tunnel_type: TunnelType,
}

/// The server's reply to a registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterAck {
    Ok { subdomain: String, url: String },
    Err { error: String, message: String },
}

/// Heartbeat payload; acks echo the timestamp so either side can measure
/// round-trip latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
}

impl Heartbeat {
    pub fn now() -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { timestamp_ms }
    }

    pub fn into_frame(self, frame_type: FrameType) -> Frame {
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        Frame::new(frame_type, Bytes::from(payload))
    }
}

/// Payload of an `Error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

impl ErrorData {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        Frame::new(FrameType::Error, Bytes::from(payload))
    }
}

/// An HTTP request marshalled for the control link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

/// An HTTP response marshalled for the control link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

/// JSON envelope carried by Data frames on `http` tunnels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataPayload {
    Request { id: String, request: HttpRequest },
    Response { id: String, response: HttpResponse },
}

impl DataPayload {
    pub fn id(&self) -> &str {
        match self {
            DataPayload::Request { id, .. } => id,
            DataPayload::Response { id, .. } => id,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn into_frame(self) -> Frame {
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        Frame::new(FrameType::Data, Bytes::from(payload))
    }
}

/// Direction of a stream frame on `https`/`tcp` tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamDirection {
    /// Server to client: bytes headed for the client's local service.
    ToLocal = 0x00,
    /// Client to server: bytes headed for the public peer.
    ToPublic = 0x01,
}

impl StreamDirection {
    fn from_byte(byte: u8) -> Result<Self, MessageError> {
        match byte {
            0x00 => Ok(StreamDirection::ToLocal),
            0x01 => Ok(StreamDirection::ToPublic),
            _ => Err(MessageError::BadStreamFrame("unknown direction byte")),
        }
    }
}

/// Raw byte-stream frame: 32 ASCII-hex stream id, one direction byte, then
/// the stream bytes. Used on `https`/`tcp` tunnels where payloads are opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub id: String,
    pub direction: StreamDirection,
    pub data: Bytes,
}

impl StreamFrame {
    pub fn new(id: impl Into<String>, direction: StreamDirection, data: Bytes) -> Self {
        Self {
            id: id.into(),
            direction,
            data,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() < REQUEST_ID_LEN + 1 {
            return Err(MessageError::BadStreamFrame("payload shorter than header"));
        }
        let id = std::str::from_utf8(&payload[..REQUEST_ID_LEN])
            .map_err(|_| MessageError::BadStreamFrame("stream id is not utf-8"))?;
        if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MessageError::BadStreamFrame("stream id is not hex"));
        }
        let direction = StreamDirection::from_byte(payload[REQUEST_ID_LEN])?;
        Ok(Self {
            id: id.to_string(),
            direction,
            data: Bytes::copy_from_slice(&payload[REQUEST_ID_LEN + 1..]),
        })
    }

    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(REQUEST_ID_LEN + 1 + self.data.len());
        payload.put_slice(self.id.as_bytes());
        payload.put_u8(self.direction as u8);
        payload.put_slice(&self.data);
        Frame::new(FrameType::Data, payload.freeze())
    }
}

/// Payload for a `Close` frame that tears down one stream.
pub fn stream_close_payload(id: &str) -> Bytes {
    Bytes::copy_from_slice(id.as_bytes())
}

/// Interpret a `Close` frame payload: `None` closes the whole link, `Some`
/// closes the named stream.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<String>, MessageError> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() != REQUEST_ID_LEN {
        return Err(MessageError::BadStreamFrame("close payload is not a stream id"));
    }
    let id = std::str::from_utf8(payload)
        .map_err(|_| MessageError::BadStreamFrame("stream id is not utf-8"))?;
    if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MessageError::BadStreamFrame("stream id is not hex"));
    }
    Ok(Some(id.to_string()))
}

/// Helper to serialize any control payload into a frame.
pub fn json_frame<T: Serialize>(frame_type: FrameType, payload: &T) -> Frame {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    Frame::new(frame_type, Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::generate_request_id;

    #[test]
    fn test_register_request_round_trip() {
        let req = RegisterRequest {
            token: "secret".to_string(),
            subdomain: Some("myapp".to_string()),
            tunnel_type: TunnelType::Http,
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: RegisterRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_register_request_omits_empty_subdomain() {
        let req = RegisterRequest {
            token: "t".to_string(),
            subdomain: None,
            tunnel_type: TunnelType::Tcp,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("subdomain"));
    }

    #[test]
    fn test_register_ack_variants() {
        let ok = RegisterAck::Ok {
            subdomain: "abc123".to_string(),
            url: "https://abc123.example.test".to_string(),
        };
        let json = serde_json::to_string(&ok).unwrap();
        let back: RegisterAck = serde_json::from_str(&json).unwrap();
        assert_eq!(ok, back);

        let err = RegisterAck::Err {
            error: "subdomain_taken".to_string(),
            message: "subdomain is already taken".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: RegisterAck = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn test_data_payload_round_trip() {
        let id = generate_request_id();
        let payload = DataPayload::Request {
            id: id.clone(),
            request: HttpRequest {
                method: "POST".to_string(),
                url: "/api/echo".to_string(),
                headers: vec![("Host".to_string(), "abc.example.test".to_string())],
                body: vec![0x00, 0xff, 0x7f],
            },
        };
        let frame = payload.clone().into_frame();
        assert_eq!(frame.frame_type(), FrameType::Data);

        let back = DataPayload::decode(frame.payload()).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.id(), id);
    }

    #[test]
    fn test_body_is_base64_in_json() {
        let payload = DataPayload::Response {
            id: generate_request_id(),
            response: HttpResponse {
                status: 200,
                headers: vec![],
                body: b"pong".to_vec(),
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("cG9uZw=="), "body must be base64: {json}");
    }

    #[test]
    fn test_stream_frame_round_trip() {
        let id = generate_request_id();
        let frame = StreamFrame::new(id.clone(), StreamDirection::ToPublic, Bytes::from_static(b"raw"));
        let wire = frame.clone().into_frame();

        let back = StreamFrame::decode(wire.payload()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_stream_frame_rejects_short_payload() {
        assert!(StreamFrame::decode(b"too short").is_err());
    }

    #[test]
    fn test_stream_frame_rejects_bad_direction() {
        let id = generate_request_id();
        let mut payload = id.into_bytes();
        payload.push(0x09);
        payload.extend_from_slice(b"data");
        assert!(StreamFrame::decode(&payload).is_err());
    }

    #[test]
    fn test_close_payload_parse() {
        assert_eq!(parse_close_payload(b"").unwrap(), None);

        let id = generate_request_id();
        let parsed = parse_close_payload(stream_close_payload(&id).as_ref()).unwrap();
        assert_eq!(parsed, Some(id));

        assert!(parse_close_payload(b"not-a-stream-id").is_err());
    }

    #[test]
    fn test_heartbeat_echo() {
        let hb = Heartbeat { timestamp_ms: 12345 };
        let frame = hb.into_frame(FrameType::Heartbeat);
        let back: Heartbeat = serde_json::from_slice(frame.payload()).unwrap();
        assert_eq!(back.timestamp_ms, 12345);
    }
}
