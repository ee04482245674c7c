//! Stream preamble
//!
//! The relay's first bytes on every stream it opens name the target service,
//! terminated by a newline. The agent reads it before dialing anything.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::stream::MuxStream;
use crate::MuxError;

/// Longest accepted preamble, terminator included
pub const MAX_PREAMBLE_LEN: usize = 256;

/// How long the agent waits for a preamble
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Name the target service on a freshly opened stream
pub async fn write_preamble(stream: &mut MuxStream, service: &str) -> Result<(), MuxError> {
    validate_service(service)?;
    if service.len() + 1 > MAX_PREAMBLE_LEN {
        return Err(MuxError::PreambleTooLong(service.len() + 1));
    }
    let mut line = BytesMut::with_capacity(service.len() + 1);
    line.extend_from_slice(service.as_bytes());
    line.extend_from_slice(b"\n");
    stream.write(line.freeze()).await
}

/// Read the preamble from a stream
///
/// Returns the service name and any bytes that arrived after the newline in
/// the same chunk; those belong to the tunneled connection.
pub async fn read_preamble(
    stream: &mut MuxStream,
    timeout: Duration,
) -> Result<(String, Bytes), MuxError> {
    tokio::time::timeout(timeout, read_line(stream))
        .await
        .map_err(|_| MuxError::Timeout(timeout))?
}

async fn read_line(stream: &mut MuxStream) -> Result<(String, Bytes), MuxError> {
    let mut buf = BytesMut::new();
    loop {
        let chunk = stream
            .read_chunk()
            .await
            .ok_or(MuxError::StreamClosed(stream.id()))?;
        let scanned = buf.len();
        buf.extend_from_slice(&chunk);

        if let Some(pos) = buf[scanned..].iter().position(|b| *b == b'\n') {
            let end = scanned + pos;
            if end + 1 > MAX_PREAMBLE_LEN {
                return Err(MuxError::PreambleTooLong(end + 1));
            }
            let mut line = buf.split_to(end + 1);
            line.truncate(end);
            let service = String::from_utf8(line.to_vec())
                .map_err(|_| MuxError::InvalidPreamble("not utf-8".to_string()))?;
            let service = service.trim_end_matches('\r').to_string();
            validate_service(&service)?;
            return Ok((service, buf.freeze()));
        }

        if buf.len() >= MAX_PREAMBLE_LEN {
            return Err(MuxError::PreambleTooLong(buf.len()));
        }
    }
}

fn validate_service(service: &str) -> Result<(), MuxError> {
    if service.is_empty() {
        return Err(MuxError::InvalidPreamble("empty service name".to_string()));
    }
    if service.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(MuxError::InvalidPreamble(format!(
            "service name {service:?} contains whitespace"
        )));
    }
    Ok(())
}
