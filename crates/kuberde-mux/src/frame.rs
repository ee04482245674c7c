//! Tunnel frame codec
//!
//! Every WebSocket binary message carries exactly one frame:
//!
//! ```text
//! +--------+----------------+-----------------+
//! | kind:1 | stream_id:4 BE | payload:0..64Ki |
//! +--------+----------------+-----------------+
//! ```
//!
//! Session-level frames (Ping, Pong, Credential) use stream id 0.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 5;

/// Largest payload carried by a single frame
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Stream id used by session-level frames
pub const SESSION_STREAM_ID: u32 = 0;

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the header requires
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),
    /// Unknown kind byte
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    /// Payload larger than [`MAX_PAYLOAD`]
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    /// Payload malformed for its kind
    #[error("invalid {0} payload")]
    InvalidPayload(&'static str),
}

/// Frame kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a new logical stream
    Open = 1,
    /// Stream payload bytes
    Data = 2,
    /// Graceful stream close
    Close = 3,
    /// Abort a stream
    Reset = 4,
    /// Heartbeat request carrying an 8-byte nonce
    Ping = 5,
    /// Heartbeat reply echoing the nonce
    Pong = 6,
    /// Refreshed bearer credential from the agent
    Credential = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Open,
            2 => Self::Data,
            3 => Self::Close,
            4 => Self::Reset,
            5 => Self::Ping,
            6 => Self::Pong,
            7 => Self::Credential,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Target stream, or [`SESSION_STREAM_ID`]
    pub stream_id: u32,
    /// Kind-specific payload
    pub payload: Bytes,
}

impl Frame {
    fn new(kind: FrameKind, stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    /// Open `stream_id`
    pub fn open(stream_id: u32) -> Self {
        Self::new(FrameKind::Open, stream_id, Bytes::new())
    }

    /// Payload for `stream_id`
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, payload)
    }

    /// Graceful close of `stream_id`
    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameKind::Close, stream_id, Bytes::new())
    }

    /// Abort `stream_id`
    pub fn reset(stream_id: u32) -> Self {
        Self::new(FrameKind::Reset, stream_id, Bytes::new())
    }

    /// Heartbeat request
    pub fn ping(nonce: u64) -> Self {
        Self::new(
            FrameKind::Ping,
            SESSION_STREAM_ID,
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    /// Heartbeat reply
    pub fn pong(nonce: u64) -> Self {
        Self::new(
            FrameKind::Pong,
            SESSION_STREAM_ID,
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    /// Refreshed credential
    pub fn credential(token: &str) -> Self {
        Self::new(
            FrameKind::Credential,
            SESSION_STREAM_ID,
            Bytes::copy_from_slice(token.as_bytes()),
        )
    }

    /// Heartbeat nonce of a Ping or Pong frame
    pub fn nonce(&self) -> Result<u64, FrameError> {
        let mut payload = self.payload.clone();
        if payload.len() != 8 {
            return Err(FrameError::InvalidPayload("heartbeat"));
        }
        Ok(payload.get_u64())
    }

    /// Token carried by a Credential frame
    pub fn token(&self) -> Result<String, FrameError> {
        String::from_utf8(self.payload.to_vec())
            .map_err(|_| FrameError::InvalidPayload("credential"))
    }

    /// Serialize into one message
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one message
    pub fn decode(mut message: Bytes) -> Result<Self, FrameError> {
        if message.len() < HEADER_LEN {
            return Err(FrameError::Truncated(message.len()));
        }
        let kind = FrameKind::try_from(message.get_u8())?;
        let stream_id = message.get_u32();
        if message.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(message.len()));
        }
        Ok(Self::new(kind, stream_id, message))
    }
}
