//! Hostname-routed HTTP ingress
//!
//! The relay only reads the request head: enough to pick a route from
//! `Host` and authenticate the requester. The head is then replayed into the
//! agent stream and the rest of the connection is bridged untouched, so
//! keep-alive, chunked bodies and WebSocket upgrades pass through.

use std::time::Duration;

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use kuberde_auth::{authorize, extract_token, Authenticator};
use kuberde_mux::{bridge, Prefix};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataplane::{Dataplane, OpenedStream};
use crate::error::RelayError;
use crate::routing::Resolution;

/// Largest request head the relay will buffer
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Deadline for the complete request head
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers the relay routes and authenticates on
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RequestHead {
    /// `Host` header
    pub host: String,
    /// Query string of the request target
    pub query: Option<String>,
    /// `Authorization` header
    pub authorization: Option<String>,
    /// `Cookie` header
    pub cookie: Option<String>,
}

/// Why a head could not be read
#[derive(Debug, PartialEq, Eq)]
pub enum HeadError {
    /// Client closed before finishing the head
    Closed,
    /// Head exceeded [`MAX_HEAD_LEN`]
    TooLarge,
    /// Head not complete within [`HEAD_TIMEOUT`]
    Timeout,
    /// Not an HTTP/1.x request head
    Malformed(&'static str),
}

impl HeadError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Closed => None,
            Self::TooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            Self::Malformed(_) => Some(StatusCode::BAD_REQUEST),
        }
    }
}

/// Read until the blank line ending the head
///
/// Returns every byte read, which may include the start of the body.
pub async fn read_head<R>(io: &mut R, deadline: Duration) -> Result<Bytes, HeadError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, async {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let scanned = buf.len().saturating_sub(3);
            let n = io.read_buf(&mut buf).await.map_err(|_| HeadError::Closed)?;
            if n == 0 {
                return Err(HeadError::Closed);
            }
            if let Some(pos) = find_head_end(&buf[scanned..]) {
                if scanned + pos > MAX_HEAD_LEN {
                    return Err(HeadError::TooLarge);
                }
                return Ok(buf.freeze());
            }
            if buf.len() > MAX_HEAD_LEN {
                return Err(HeadError::TooLarge);
            }
        }
    })
    .await
    .map_err(|_| HeadError::Timeout)?
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Pull the routing and auth headers out of a raw head
pub fn parse_head(raw: &[u8]) -> Result<RequestHead, HeadError> {
    let end = find_head_end(raw).ok_or(HeadError::Malformed("unterminated head"))?;
    let text =
        std::str::from_utf8(&raw[..end]).map_err(|_| HeadError::Malformed("non-utf8 head"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HeadError::Malformed("empty head"))?;
    let mut parts = request_line.split(' ');
    let (Some(_method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::Malformed("bad request line"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HeadError::Malformed("unsupported HTTP version"));
    }

    let mut head = RequestHead {
        query: target.split_once('?').map(|(_, q)| q.to_string()),
        ..Default::default()
    };
    for line in lines.take_while(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(HeadError::Malformed("bad header line"));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            head.host = value.to_string();
        } else if name.eq_ignore_ascii_case("authorization") {
            head.authorization = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("cookie") {
            head.cookie = Some(match head.cookie.take() {
                Some(prev) => format!("{prev}; {value}"),
                None => value.to_string(),
            });
        }
    }
    if head.host.is_empty() {
        return Err(HeadError::Malformed("missing Host header"));
    }
    Ok(head)
}

/// Minimal response written before closing a rejected connection
pub fn status_response(status: StatusCode, message: &str) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("");
    let challenge = if status == StatusCode::UNAUTHORIZED {
        "WWW-Authenticate: Bearer\r\n"
    } else {
        ""
    };
    format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n{challenge}Connection: close\r\n\r\n{message}",
        status.as_u16(),
        message.len(),
    )
    .into_bytes()
}

/// The HTTP ingress listener
#[derive(Clone)]
pub struct HttpIngress {
    dataplane: Dataplane,
    auth: Authenticator,
}

impl HttpIngress {
    /// Ingress over shared relay state
    pub fn new(dataplane: Dataplane, auth: Authenticator) -> Self {
        Self { dataplane, auth }
    }

    /// Accept connections until `shutdown`
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "HTTP ingress listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, _peer)) => {
                    let ingress = self.clone();
                    tokio::spawn(async move { ingress.handle(socket).await });
                }
                Err(e) => warn!(error = %e, "HTTP ingress accept failed"),
            }
        }
    }

    /// Route one client connection
    pub async fn handle<T>(&self, mut io: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let raw = match read_head(&mut io, HEAD_TIMEOUT).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = ?e, "Unreadable request head");
                if let Some(status) = e.status() {
                    reject(&mut io, status, "bad request head").await;
                }
                return;
            }
        };
        let head = match parse_head(&raw) {
            Ok(head) => head,
            Err(e) => {
                debug!(error = ?e, "Malformed request head");
                reject(&mut io, StatusCode::BAD_REQUEST, "malformed request").await;
                return;
            }
        };

        let opened = match self.admit(&head).await {
            Ok(opened) => opened,
            Err(e) => {
                debug!(host = %head.host, error = %e, "Rejecting HTTP request");
                reject(&mut io, e.status_code(), e.reason()).await;
                return;
            }
        };

        let _guard = opened.guard;
        let stats = bridge(opened.stream, io, Prefix::to_stream(raw)).await;
        debug!(
            host = %head.host,
            agent = %opened.target.identity,
            to_client = stats.to_io,
            to_agent = stats.to_stream,
            "HTTP connection closed"
        );
    }

    async fn admit(&self, head: &RequestHead) -> Result<OpenedStream, RelayError> {
        let resolution = self.dataplane.lookup_http(&head.host)?;
        let target = match &resolution {
            Resolution::Active(t) | Resolution::Parked(t) => t,
        };

        let found = extract_token(
            head.authorization.as_deref(),
            head.query.as_deref(),
            head.cookie.as_deref(),
        );
        let principal = self.auth.authenticate(found).await?;
        authorize(&principal, &target.identity)?;

        let target = self.dataplane.usable(resolution)?;
        self.dataplane.open_stream(target).await
    }
}

async fn reject<W: AsyncWrite + Unpin>(io: &mut W, status: StatusCode, message: &str) {
    let _ = io.write_all(&status_response(status, message)).await;
    let _ = io.shutdown().await;
}
