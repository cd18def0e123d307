//! Length-prefixed frame codec.
//!
//! Wire format: `[length: u32 BE][type: u8][payload: length bytes]`. The
//! length excludes the 5-byte header. Payloads up to 256 KiB are read into
//! pooled buffers; larger payloads (up to the 10 MiB ceiling) allocate fresh.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use drip_pool::{global_pool, PooledBuf, SizeClass};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes of header before the payload: 4-byte length plus 1-byte type.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum payload size (10 MiB). Anything larger is a protocol error.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// The closed set of frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Register = 0x01,
    RegisterAck = 0x02,
    Heartbeat = 0x03,
    HeartbeatAck = 0x04,
    Data = 0x05,
    Close = 0x06,
    Error = 0x07,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Result<FrameType, FrameError> {
        match byte {
            0x01 => Ok(FrameType::Register),
            0x02 => Ok(FrameType::RegisterAck),
            0x03 => Ok(FrameType::Heartbeat),
            0x04 => Ok(FrameType::HeartbeatAck),
            0x05 => Ok(FrameType::Data),
            0x06 => Ok(FrameType::Close),
            0x07 => Ok(FrameType::Error),
            other => Err(FrameError::BadFrameType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Register => "Register",
            FrameType::RegisterAck => "RegisterAck",
            FrameType::Heartbeat => "Heartbeat",
            FrameType::HeartbeatAck => "HeartbeatAck",
            FrameType::Data => "Data",
            FrameType::Close => "Close",
            FrameType::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Frame codec errors. All of these are fatal to the link.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("short read in frame header")]
    ShortHeader(#[source] std::io::Error),

    #[error("payload too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    OversizePayload(usize),

    #[error("short read in frame payload")]
    ShortPayload(#[source] std::io::Error),

    #[error("unknown frame type: {0:#04x}")]
    BadFrameType(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

enum Payload {
    Owned(Bytes),
    Pooled(PooledBuf),
}

/// A typed frame. Decoded frames may hold a pooled payload buffer, which is
/// returned to its pool when the frame is dropped.
pub struct Frame {
    frame_type: FrameType,
    payload: Payload,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload: Payload::Owned(payload),
        }
    }

    /// A frame with an empty payload.
    pub fn empty(frame_type: FrameType) -> Self {
        Self::new(frame_type, Bytes::new())
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Payload::Owned(bytes) => bytes,
            Payload::Pooled(buf) => buf.as_slice(),
        }
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload().len()
    }

    /// Serialize into `buf` without writing to any sink.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload = self.payload();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::OversizePayload(payload.len()));
        }
        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_u8(self.frame_type as u8);
        buf.put_slice(payload);
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("type", &self.frame_type.to_string())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Write one frame to `sink`. Fails before emitting any bytes if the payload
/// exceeds [`MAX_FRAME_SIZE`].
pub async fn write_frame<W>(sink: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    frame.encode_into(&mut buf)?;
    sink.write_all(&buf).await?;
    Ok(())
}

/// Read one frame from `source`.
///
/// Rejects oversize lengths before allocating anything. Payloads of 256 KiB
/// or less are read into a pooled buffer owned by the returned frame.
pub async fn read_frame<R>(source: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    source.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortHeader(e)
        } else {
            FrameError::Io(e)
        }
    })?;

    let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if payload_len > MAX_FRAME_SIZE {
        return Err(FrameError::OversizePayload(payload_len));
    }
    let frame_type = FrameType::from_byte(header[4])?;

    let short = |e: std::io::Error| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ShortPayload(e)
        } else {
            FrameError::Io(e)
        }
    };

    let payload = if payload_len == 0 {
        Payload::Owned(Bytes::new())
    } else if SizeClass::for_size(payload_len).is_some() {
        let mut buf = global_pool().get(payload_len);
        source.read_exact(buf.as_mut_slice()).await.map_err(short)?;
        Payload::Pooled(buf)
    } else {
        let mut buf = vec![0u8; payload_len];
        source.read_exact(&mut buf).await.map_err(short)?;
        Payload::Owned(Bytes::from(buf))
    };

    Ok(Frame {
        frame_type,
        payload,
    })
}
