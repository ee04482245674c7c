//! Logical streams
//!
//! A [`MuxStream`] is one bidirectional byte stream inside a session. It can
//! be split into independently owned read and write halves; the stream is
//! released (and a Close sent if the peer hasn't closed first) when both
//! halves are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frame::{Frame, MAX_PAYLOAD};
use crate::session::SessionShared;
use crate::MuxError;

/// Session-side state for one open stream
pub(crate) struct StreamSlot {
    /// Delivers inbound payloads to the read half
    pub(crate) tx: mpsc::Sender<Bytes>,
    /// Cancelled on Reset or session shutdown
    pub(crate) cancel: CancellationToken,
}

/// Releases the stream slot once both halves are gone
struct StreamGuard {
    id: u32,
    shared: Arc<SessionShared>,
    close_sent: AtomicBool,
}

impl StreamGuard {
    /// Returns true exactly once
    fn claim_close(&self) -> bool {
        !self.close_sent.swap(true, Ordering::SeqCst)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let still_open = self.shared.streams.remove(&self.id).is_some();
        if still_open && self.claim_close() {
            match self.shared.outbound.try_send(Frame::close(self.id)) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                // Queue the Close behind the congestion; it fails once the session is gone
                Err(TrySendError::Full(frame)) => match Handle::try_current() {
                    Ok(handle) => {
                        let outbound = self.shared.outbound.clone();
                        handle.spawn(async move {
                            let _ = outbound.send(frame).await;
                        });
                    }
                    Err(_) => debug!(stream = self.id, "No runtime left to deliver Close"),
                },
            }
        }
        trace!(stream = self.id, "Stream released");
    }
}

/// One logical stream
pub struct MuxStream {
    reader: MuxReadHalf,
    writer: MuxWriteHalf,
}

/// Receiving half of a stream
pub struct MuxReadHalf {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    _guard: Arc<StreamGuard>,
}

/// Sending half of a stream
pub struct MuxWriteHalf {
    id: u32,
    cancel: CancellationToken,
    guard: Arc<StreamGuard>,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<SessionShared>,
        rx: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        let guard = Arc::new(StreamGuard {
            id,
            shared,
            close_sent: AtomicBool::new(false),
        });
        Self {
            reader: MuxReadHalf {
                id,
                rx,
                cancel: cancel.clone(),
                _guard: guard.clone(),
            },
            writer: MuxWriteHalf { id, cancel, guard },
        }
    }

    /// Stream id within the session
    pub fn id(&self) -> u32 {
        self.reader.id
    }

    /// Token cancelled when the stream is reset or its session closes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.reader.cancel.clone()
    }

    /// Split into independently owned halves
    pub fn split(self) -> (MuxReadHalf, MuxWriteHalf) {
        (self.reader, self.writer)
    }

    /// Next chunk of inbound bytes; `None` once the stream is closed
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.reader.read_chunk().await
    }

    /// Send bytes to the peer
    pub async fn write(&mut self, data: Bytes) -> Result<(), MuxError> {
        self.writer.write(data).await
    }

    /// Gracefully close the stream
    pub async fn close(&mut self) -> Result<(), MuxError> {
        self.writer.close().await
    }

    /// Abort the stream, discarding buffered data on both sides
    pub fn reset(self) {
        self.writer.reset();
    }
}

impl MuxReadHalf {
    /// Stream id within the session
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next chunk of inbound bytes; `None` once the stream is closed
    ///
    /// After a graceful Close, chunks already buffered are still returned.
    /// After a Reset or session shutdown, reading stops immediately.
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = self.rx.recv() => chunk,
        }
    }
}

impl MuxWriteHalf {
    /// Stream id within the session
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send bytes to the peer, split into frames of at most 64 KiB
    pub async fn write(&mut self, data: Bytes) -> Result<(), MuxError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk = remaining.split_to(remaining.len().min(MAX_PAYLOAD));
            self.send(Frame::data(self.id, chunk)).await?;
        }
        Ok(())
    }

    /// Gracefully close the stream; later calls are no-ops
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if self.guard.claim_close() {
            self.send(Frame::close(self.id)).await?;
        }
        Ok(())
    }

    /// Abort the stream
    pub fn reset(self) {
        if let Some((_, slot)) = self.guard.shared.streams.remove(&self.id) {
            slot.cancel.cancel();
        }
        self.guard.claim_close();
        let _ = self.guard.shared.outbound.try_send(Frame::reset(self.id));
    }

    async fn send(&self, frame: Frame) -> Result<(), MuxError> {
        if self.cancel.is_cancelled() {
            return Err(MuxError::StreamClosed(self.id));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MuxError::StreamClosed(self.id)),
            sent = self.guard.shared.outbound.send(frame) => {
                sent.map_err(|_| MuxError::SessionClosed)
            }
        }
    }
}
