//! Multiplexing errors

use thiserror::Error;

use crate::frame::FrameError;

/// Errors raised by sessions and streams
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session was closed locally or by the peer
    #[error("session closed")]
    SessionClosed,

    /// The stream was closed or reset
    #[error("stream {0} closed")]
    StreamClosed(u32),

    /// A frame could not be decoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No preamble delimiter within the size bound
    #[error("preamble exceeds {0} bytes")]
    PreambleTooLong(usize),

    /// The preamble was empty or not UTF-8
    #[error("invalid preamble: {0}")]
    InvalidPreamble(String),

    /// I/O error on the bridged socket
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
