//! Wisp frame codec.
//!
//! Wire format, little-endian, no alignment or padding:
//!
//! ```text
//! type: u8 | streamId: u32 | payload: bytes
//! ```
//!
//! CONNECT carries `streamType: u8 | port: u16 | hostname: utf8`;
//! CONTINUE carries `bufferRemaining: u32`; CLOSE carries `reason: u8`.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const TYPE_CONNECT: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;
const TYPE_CONTINUE: u8 = 0x03;
const TYPE_CLOSE: u8 = 0x04;

/// Minimum frame: type byte plus stream id.
const FRAME_HEADER_LEN: usize = 5;

/// Stream type for TCP streams; the only one the server accepts.
pub const STREAM_TYPE_TCP: u8 = 0x01;

/// CLOSE frame reason codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// Voluntary close (client request or clean TCP EOF).
    Voluntary = 0x01,
    /// Network error on the TCP leg.
    NetworkError = 0x02,
    /// CONNECT rejected: bad stream type, port, or hostname.
    InvalidInfo = 0x41,
}

impl CloseReason {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0x02 => Self::NetworkError,
            0x41 => Self::InvalidInfo,
            _ => Self::Voluntary,
        }
    }
}

/// A parsed Wisp frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Connect {
        stream_id: u32,
        stream_type: u8,
        port: u16,
        hostname: String,
    },
    Data {
        stream_id: u32,
        payload: Bytes,
    },
    Continue {
        stream_id: u32,
        buffer_remaining: u32,
    },
    Close {
        stream_id: u32,
        reason: CloseReason,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Connect { stream_id, .. }
            | Self::Data { stream_id, .. }
            | Self::Continue { stream_id, .. }
            | Self::Close { stream_id, .. } => *stream_id,
        }
    }
}

/// Frame decode errors. Any of these tears down the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("hostname is not valid utf-8")]
    BadHostname,
}

/// Decode one frame from a binary WebSocket message.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort(raw.len()));
    }
    let frame_type = raw[0];
    let stream_id = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
    let payload = &raw[FRAME_HEADER_LEN..];

    match frame_type {
        TYPE_CONNECT => {
            // streamType: u8 | port: u16 | hostname
            if payload.len() < 3 {
                return Err(FrameError::MalformedPayload("CONNECT"));
            }
            let stream_type = payload[0];
            let port = u16::from_le_bytes([payload[1], payload[2]]);
            let hostname = std::str::from_utf8(&payload[3..])
                .map_err(|_| FrameError::BadHostname)?
                .trim_end_matches('\0')
                .to_string();
            Ok(Frame::Connect {
                stream_id,
                stream_type,
                port,
                hostname,
            })
        }
        TYPE_DATA => Ok(Frame::Data {
            stream_id,
            payload: Bytes::copy_from_slice(payload),
        }),
        TYPE_CONTINUE => {
            if payload.len() < 4 {
                return Err(FrameError::MalformedPayload("CONTINUE"));
            }
            let buffer_remaining =
                u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(Frame::Continue {
                stream_id,
                buffer_remaining,
            })
        }
        TYPE_CLOSE => {
            if payload.is_empty() {
                return Err(FrameError::MalformedPayload("CLOSE"));
            }
            Ok(Frame::Close {
                stream_id,
                reason: CloseReason::from_u8(payload[0]),
            })
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

/// Encode a frame to its wire bytes.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    match frame {
        Frame::Connect {
            stream_id,
            stream_type,
            port,
            hostname,
        } => {
            buf.put_u8(TYPE_CONNECT);
            buf.put_u32_le(*stream_id);
            buf.put_u8(*stream_type);
            buf.put_u16_le(*port);
            buf.put_slice(hostname.as_bytes());
        }
        Frame::Data { stream_id, payload } => {
            buf.put_u8(TYPE_DATA);
            buf.put_u32_le(*stream_id);
            buf.put_slice(payload);
        }
        Frame::Continue {
            stream_id,
            buffer_remaining,
        } => {
            buf.put_u8(TYPE_CONTINUE);
            buf.put_u32_le(*stream_id);
            buf.put_u32_le(*buffer_remaining);
        }
        Frame::Close { stream_id, reason } => {
            buf.put_u8(TYPE_CLOSE);
            buf.put_u32_le(*stream_id);
            buf.put_u8(reason.as_u8());
        }
    }
    buf.freeze()
}
