//! Stream acceptance and local dialing
//!
//! Every relay-opened stream names its service in a preamble. The agent
//! dials that service inside the pod and bridges bytes until either side
//! ends. Streams are independent: one slow or failing service never holds
//! up another.

use std::sync::Arc;
use std::time::Duration;

use kuberde_mux::preamble::PREAMBLE_TIMEOUT;
use kuberde_mux::{bridge, read_preamble, Incoming, MuxStream, Prefix};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::services::{LocalService, ServiceTable};

/// How local services are dialed
#[derive(Clone, Debug)]
pub struct DialPolicy {
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Pause between attempts
    pub retry_interval: Duration,
    /// Give up after this long; covers containers that are still starting
    pub deadline: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Dial `service`, retrying until the policy's deadline
pub async fn dial(service: &LocalService, policy: &DialPolicy) -> Result<TcpStream> {
    let addr = service.addr();
    let give_up = Instant::now() + policy.deadline;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let reason = match tokio::time::timeout(policy.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => {
                if attempts > 1 {
                    debug!(service = %service.name, attempts, "Local service came up");
                }
                return Ok(socket);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", policy.connect_timeout),
        };
        if Instant::now() + policy.retry_interval >= give_up {
            return Err(AgentError::Unreachable {
                service: service.name.clone(),
                addr,
                reason,
            });
        }
        tokio::time::sleep(policy.retry_interval).await;
    }
}

/// Serve one relay-opened stream to completion
pub async fn handle_stream(mut stream: MuxStream, services: &ServiceTable, policy: &DialPolicy) -> Result<()> {
    let id = stream.id();
    let (name, rest) = match read_preamble(&mut stream, PREAMBLE_TIMEOUT).await {
        Ok(preamble) => preamble,
        Err(e) => {
            stream.reset();
            return Err(e.into());
        }
    };
    let Some(service) = services.get(&name) else {
        stream.reset();
        return Err(AgentError::UnknownService(name));
    };

    let socket = match dial(service, policy).await {
        Ok(socket) => socket,
        Err(e) => {
            stream.reset();
            return Err(e);
        }
    };
    let _ = socket.set_nodelay(true);

    debug!(stream = id, service = %service.name, "Bridging stream");
    let stats = bridge(stream, socket, Prefix::to_io(rest)).await;
    debug!(
        stream = id,
        service = %service.name,
        to_service = stats.to_io,
        from_service = stats.to_stream,
        "Stream finished"
    );
    Ok(())
}

/// Accept streams until the session closes or `shutdown` fires
pub async fn accept_loop(
    mut incoming: Incoming,
    services: Arc<ServiceTable>,
    policy: DialPolicy,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            stream = incoming.accept() => match stream {
                Some(stream) => stream,
                None => break,
            },
        };
        let services = services.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            let id = stream.id();
            if let Err(e) = handle_stream(stream, &services, &policy).await {
                warn!(stream = id, error = %e, "Stream failed");
            }
        });
    }
    info!("Accept loop finished");
}
