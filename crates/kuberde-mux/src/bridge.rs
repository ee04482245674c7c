//! Bidirectional copy between a stream and a socket
//!
//! Both directions run as separate tasks under one cancellation scope that is
//! a child of the stream's token. Whichever direction finishes first cancels
//! the scope, so a half-dead connection never lingers.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::{MuxReadHalf, MuxStream, MuxWriteHalf};
use crate::MuxError;

const COPY_BUFFER: usize = 32 * 1024;

/// Bytes already consumed from either side before bridging started
///
/// The agent reads past the preamble; the relay reads the HTTP head to route
/// a request. Those bytes are replayed ahead of the copy loops.
#[derive(Debug, Default, Clone)]
pub struct Prefix {
    /// Written to the socket before anything read from the stream
    pub to_io: Bytes,
    /// Written to the stream before anything read from the socket
    pub to_stream: Bytes,
}

impl Prefix {
    /// Replay `bytes` into the socket
    pub fn to_io(bytes: Bytes) -> Self {
        Self {
            to_io: bytes,
            to_stream: Bytes::new(),
        }
    }

    /// Replay `bytes` into the stream
    pub fn to_stream(bytes: Bytes) -> Self {
        Self {
            to_io: Bytes::new(),
            to_stream: bytes,
        }
    }
}

/// Byte counts for a finished bridge
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Stream to socket
    pub to_io: u64,
    /// Socket to stream
    pub to_stream: u64,
}

/// Copy bytes both ways until either side ends
pub async fn bridge<T>(stream: MuxStream, io: T, prefix: Prefix) -> BridgeStats
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = stream.id();
    let scope = stream.cancellation_token().child_token();
    let (mux_rx, mux_tx) = stream.split();
    let (io_rx, io_tx) = tokio::io::split(io);

    let downstream = tokio::spawn(stream_to_io(mux_rx, io_tx, prefix.to_io, scope.clone()));
    let upstream = tokio::spawn(io_to_stream(io_rx, mux_tx, prefix.to_stream, scope));

    let (down, up) = tokio::join!(downstream, upstream);
    let stats = BridgeStats {
        to_io: down.unwrap_or_default(),
        to_stream: up.unwrap_or_default(),
    };
    debug!(
        stream = id,
        to_io = stats.to_io,
        to_stream = stats.to_stream,
        "Bridge finished"
    );
    stats
}

async fn stream_to_io<W>(
    mut rx: MuxReadHalf,
    mut io: W,
    prefix: Bytes,
    scope: CancellationToken,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let result = tokio::select! {
        _ = scope.cancelled() => Ok(()),
        r = copy_stream_to_io(&mut rx, &mut io, prefix, &mut copied) => r,
    };
    if let Err(e) = result {
        debug!(stream = rx.id(), error = %e, "Stream to socket copy failed");
    }
    let _ = io.shutdown().await;
    scope.cancel();
    copied
}

async fn copy_stream_to_io<W>(
    rx: &mut MuxReadHalf,
    io: &mut W,
    prefix: Bytes,
    copied: &mut u64,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    if !prefix.is_empty() {
        io.write_all(&prefix).await?;
        *copied += prefix.len() as u64;
    }
    while let Some(chunk) = rx.read_chunk().await {
        io.write_all(&chunk).await?;
        *copied += chunk.len() as u64;
    }
    io.flush().await?;
    Ok(())
}

async fn io_to_stream<R>(
    mut io: R,
    mut tx: MuxWriteHalf,
    prefix: Bytes,
    scope: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut copied = 0u64;
    let result = tokio::select! {
        _ = scope.cancelled() => Ok(()),
        r = copy_io_to_stream(&mut io, &mut tx, prefix, &mut copied) => r,
    };
    match result {
        Ok(()) => {
            let _ = tx.close().await;
        }
        Err(e) => {
            debug!(stream = tx.id(), error = %e, "Socket to stream copy failed");
        }
    }
    scope.cancel();
    copied
}

async fn copy_io_to_stream<R>(
    io: &mut R,
    tx: &mut MuxWriteHalf,
    prefix: Bytes,
    copied: &mut u64,
) -> Result<(), MuxError>
where
    R: AsyncRead + Unpin,
{
    if !prefix.is_empty() {
        *copied += prefix.len() as u64;
        tx.write(prefix).await?;
    }
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tx.write(Bytes::copy_from_slice(&buf[..n])).await?;
        *copied += n as u64;
    }
}
