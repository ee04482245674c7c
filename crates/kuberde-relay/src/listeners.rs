//! Per-port TCP ingress
//!
//! One listener runs for every registered TCP route. A listener is bound
//! when its route is registered and stopped when the route is removed;
//! parking leaves it running so clients still reach the relay and trigger a
//! scale-up.

use std::net::{IpAddr, SocketAddr};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kuberde_mux::{bridge, Prefix};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataplane::Dataplane;
use crate::error::{RelayError, Result};

/// Running TCP listeners keyed by port
pub struct TcpListeners {
    dataplane: Dataplane,
    bind_host: IpAddr,
    running: DashMap<u16, CancellationToken>,
    shutdown: CancellationToken,
}

impl TcpListeners {
    /// Listeners bound on `bind_host`, all stopped when `shutdown` fires
    pub fn new(dataplane: Dataplane, bind_host: IpAddr, shutdown: CancellationToken) -> Self {
        Self {
            dataplane,
            bind_host,
            running: DashMap::new(),
            shutdown,
        }
    }

    /// Start a listener on `port` unless one is running
    ///
    /// Binding happens before this returns so the caller can reject the
    /// registration when the port is taken. The bind runs while the port's
    /// entry is held, so concurrent registrations of one port share a
    /// single listener.
    pub async fn ensure(&self, port: u16) -> Result<()> {
        let (listener, token) = match self.running.entry(port) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(entry) => {
                let listener = bind(SocketAddr::new(self.bind_host, port)).map_err(|e| {
                    RelayError::PortUnavailable {
                        port,
                        reason: e.to_string(),
                    }
                })?;
                (listener, entry.insert(self.shutdown.child_token()).clone())
            }
        };
        info!(port, "TCP listener started");
        tokio::spawn(accept_loop(listener, port, self.dataplane.clone(), token));
        Ok(())
    }

    /// Stop the listener on `port`
    pub fn stop(&self, port: u16) -> bool {
        match self.running.remove(&port) {
            Some((_, token)) => {
                token.cancel();
                info!(port, "TCP listener stopped");
                true
            }
            None => false,
        }
    }

    /// Whether a listener is running on `port`
    pub fn is_running(&self, port: u16) -> bool {
        self.running.contains_key(&port)
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(listener: TcpListener, port: u16, dataplane: Dataplane, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                tokio::spawn(handle_connection(socket, peer, port, dataplane.clone()));
            }
            Err(e) => warn!(port, error = %e, "TCP accept failed"),
        }
    }
    debug!(port, "TCP accept loop exited");
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, port: u16, dataplane: Dataplane) {
    let target = match dataplane.route_tcp(port) {
        Ok(target) => target,
        Err(e) => {
            debug!(port, %peer, error = %e, "Rejecting TCP connection");
            return;
        }
    };
    let opened = match dataplane.open_stream(target).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(port, %peer, error = %e, "Failed to open stream");
            return;
        }
    };

    let agent = opened.target.identity.clone();
    let _guard = opened.guard;
    let stats = bridge(opened.stream, socket, Prefix::default()).await;
    debug!(
        port,
        %peer,
        agent = %agent,
        to_client = stats.to_io,
        to_agent = stats.to_stream,
        "TCP connection closed"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kuberde_auth::SYSTEM_ROLE;
    use kuberde_common::AgentIdentity;
    use kuberde_mux::{read_preamble, Incoming};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::dataplane::tests::{connect_agent, dataplane};
    use crate::routing::{RouteKey, RouteTarget};
    use crate::testing::principal;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Agent side that checks the preamble and echoes every stream back
    fn echo_agent(mut incoming: Incoming, expected_service: &'static str) {
        tokio::spawn(async move {
            while let Some(mut stream) = incoming.accept().await {
                tokio::spawn(async move {
                    let (service, rest) = read_preamble(&mut stream, Duration::from_secs(2))
                        .await
                        .unwrap();
                    assert_eq!(service, expected_service);
                    if !rest.is_empty() {
                        stream.write(rest).await.unwrap();
                    }
                    while let Some(chunk) = stream.read_chunk().await {
                        stream.write(chunk).await.unwrap();
                    }
                    stream.close().await.unwrap();
                });
            }
        });
    }

    #[tokio::test]
    async fn tcp_bytes_round_trip_through_agent() {
        let dp = dataplane(None);
        let port = free_port();
        dp.routing
            .register(
                RouteKey::Tcp(port),
                RouteTarget::new(AgentIdentity::parse("user-alice-ws-ssh").unwrap(), "ssh"),
                &principal("controller", &[SYSTEM_ROLE]),
            )
            .unwrap();
        let (_agent, incoming) = connect_agent(&dp, "user-alice-ws");
        echo_agent(incoming, "ssh");

        let listeners = TcpListeners::new(dp.clone(), LOCALHOST, CancellationToken::new());
        listeners.ensure(port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut rd, mut wr) = client.split();
        let write = wr.write_all(&payload);
        let mut echoed = vec![0u8; payload.len()];
        let read = rd.read_exact(&mut echoed);
        let (w, r) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(write, read) })
            .await
            .unwrap();
        w.unwrap();
        r.unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn connection_without_agent_is_closed() {
        let dp = dataplane(None);
        let port = free_port();
        dp.routing
            .register(
                RouteKey::Tcp(port),
                RouteTarget::new(AgentIdentity::parse("user-alice-ws-ssh").unwrap(), "ssh"),
                &principal("controller", &[SYSTEM_ROLE]),
            )
            .unwrap();
        let listeners = TcpListeners::new(dp, LOCALHOST, CancellationToken::new());
        listeners.ensure(port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn taken_port_is_unavailable_and_stop_releases() {
        let dp = dataplane(None);
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let listeners = TcpListeners::new(dp, LOCALHOST, CancellationToken::new());

        assert!(matches!(
            listeners.ensure(port).await,
            Err(RelayError::PortUnavailable { .. })
        ));
        drop(occupied);

        listeners.ensure(port).await.unwrap();
        listeners.ensure(port).await.unwrap();
        assert!(listeners.is_running(port));
        assert!(listeners.stop(port));
        assert!(!listeners.stop(port));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensures_share_one_listener() {
        let listeners = std::sync::Arc::new(TcpListeners::new(
            dataplane(None),
            LOCALHOST,
            CancellationToken::new(),
        ));
        let port = free_port();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let listeners = listeners.clone();
                tokio::spawn(async move { listeners.ensure(port).await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap().unwrap();
        }
        assert!(listeners.is_running(port));
    }
}
