//! Stream multiplexing for the KubeRDE tunnel
//!
//! One WebSocket between an agent and the relay carries many independent
//! logical streams. This crate owns the frame codec, the session that routes
//! frames to streams, the service-selector preamble written at the start of
//! every stream, and the bidirectional bridge between a stream and a socket.
//!
//! The session is transport-agnostic: callers adapt their WebSocket into a
//! `Sink<Bytes>` and a `Stream<Item = Result<Bytes, E>>`.

#![deny(missing_docs)]

pub mod bridge;
pub mod error;
pub mod frame;
pub mod preamble;
pub mod session;
pub mod stream;

pub use bridge::{bridge, BridgeStats, Prefix};
pub use error::MuxError;
pub use frame::{Frame, FrameKind};
pub use preamble::{read_preamble, write_preamble};
pub use session::{Incoming, MuxSession, Role, SessionConfig, SessionEvent};
pub use stream::{MuxReadHalf, MuxStream, MuxWriteHalf};
