//! Tunnel framing
//!
//! Every tunnel message is one length-delimited frame (the length prefix is
//! handled by `tokio_util::codec::LengthDelimitedCodec`). Inside the frame:
//!
//! ```text
//! +----------------+------+--------------+-----------------+
//! | request id u64 | kind | status code  | payload bytes   |
//! |   big-endian   |  u8  | u32 big-end. |   (opaque)      |
//! +----------------+------+--------------+-----------------+
//! ```
//!
//! The payload is a serialization-format-independent byte string; the
//! default encoding is deterministic JSON (struct field order, integers
//! where integers are required).

use crate::errors::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: id (8) + kind (1) + status (4).
const HEADER_LEN: usize = 13;

/// Message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Unary request; payload is a request envelope
    UnaryRequest = 0,
    /// Successful unary response; payload is the response message
    UnaryResponse = 1,
    /// Server-streaming request; payload is a request envelope
    StreamRequest = 2,
    /// One chunk of a stream; payload is raw bytes
    StreamChunk = 3,
    /// End of a stream; empty payload
    StreamEnd = 4,
    /// Failure of the identified request; payload is the error message
    Error = 5,
    /// Health probe
    Ping = 6,
    /// Health probe answer
    Pong = 7,
    /// Fire-and-forget log line; payload is a log entry
    Log = 8,
    /// Cancel the identified in-flight request
    Cancel = 9,
    /// Grant stream credit; status carries the granted amount
    Credit = 10,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => FrameKind::UnaryRequest,
            1 => FrameKind::UnaryResponse,
            2 => FrameKind::StreamRequest,
            3 => FrameKind::StreamChunk,
            4 => FrameKind::StreamEnd,
            5 => FrameKind::Error,
            6 => FrameKind::Ping,
            7 => FrameKind::Pong,
            8 => FrameKind::Log,
            9 => FrameKind::Cancel,
            10 => FrameKind::Credit,
            other => {
                return Err(TunnelError::Protocol {
                    message: format!("unknown frame kind {}", other),
                }
                .into())
            }
        })
    }
}

/// Status codes carried in response frames.
pub mod status {
    /// Success
    pub const OK: u32 = 0;
    /// Remote handler failed
    pub const ERROR: u32 = 1;
    /// Request was cancelled
    pub const CANCELLED: u32 = 2;
}

/// One tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request id tying responses and chunks to their request
    pub id: u64,
    /// Message kind
    pub kind: FrameKind,
    /// Status code (responses) or credit grant (credit frames)
    pub status: u32,
    /// Opaque payload
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u64, kind: FrameKind, status: u32, payload: Bytes) -> Self {
        Self {
            id,
            kind,
            status,
            payload,
        }
    }

    /// Frame with an empty payload.
    pub fn control(id: u64, kind: FrameKind, status: u32) -> Self {
        Self::new(id, kind, status, Bytes::new())
    }

    /// Encode into the body of one length-delimited frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u64(self.id);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.status);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from the body of one length-delimited frame.
    pub fn decode(mut body: BytesMut) -> Result<Self> {
        if body.len() < HEADER_LEN {
            return Err(TunnelError::Protocol {
                message: format!("short frame: {} bytes", body.len()),
            }
            .into());
        }
        let id = body.get_u64();
        let kind = FrameKind::from_u8(body.get_u8())?;
        let status = body.get_u32();
        Ok(Self {
            id,
            kind,
            status,
            payload: body.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_kinds() {
        for kind in [
            FrameKind::UnaryRequest,
            FrameKind::UnaryResponse,
            FrameKind::StreamRequest,
            FrameKind::StreamChunk,
            FrameKind::StreamEnd,
            FrameKind::Error,
            FrameKind::Ping,
            FrameKind::Pong,
            FrameKind::Log,
            FrameKind::Cancel,
            FrameKind::Credit,
        ] {
            let frame = Frame::new(42, kind, 7, Bytes::from_static(b"payload"));
            let decoded = Frame::decode(BytesMut::from(&frame.encode()[..])).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn short_frame_is_a_protocol_error() {
        let err = Frame::decode(BytesMut::from(&b"tiny"[..])).unwrap_err();
        assert!(err.to_string().contains("short frame"));
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut body = BytesMut::new();
        body.put_u64(1);
        body.put_u8(200);
        body.put_u32(0);
        let err = Frame::decode(body).unwrap_err();
        assert!(err.to_string().contains("unknown frame kind"));
    }

    #[test]
    fn empty_payload_is_valid() {
        let frame = Frame::control(1, FrameKind::StreamEnd, status::OK);
        let decoded = Frame::decode(BytesMut::from(&frame.encode()[..])).unwrap();
        assert!(decoded.payload.is_empty());
    }
}
