//! Wire protocol for drip control links.
//!
//! Every client↔server control link speaks length-prefixed typed frames:
//! a 4-byte big-endian payload length, a 1-byte frame type, then the payload.
//! Control payloads are JSON; HTTP Data payloads are JSON envelopes carrying
//! base64 bodies; `https`/`tcp` tunnels carry raw stream frames.

pub mod frame;
pub mod id;
pub mod messages;
pub mod subdomain;
pub mod tunnel_type;
pub mod writer;

pub use frame::{read_frame, write_frame, Frame, FrameError, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use id::{generate_request_id, REQUEST_ID_LEN};
pub use messages::{
    json_frame, parse_close_payload, stream_close_payload, DataPayload, ErrorData, Heartbeat,
    HttpRequest, HttpResponse, MessageError, RegisterAck, RegisterRequest, StreamDirection,
    StreamFrame,
};
pub use subdomain::{generate_subdomain, validate_subdomain, ReservedSubdomains};
pub use tunnel_type::TunnelType;
pub use writer::{FrameWriter, SubmitError, WriterConfig};
