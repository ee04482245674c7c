//! Inbound connection handling shared by the TCP and HTTP ingress
//!
//! Resolves a route, checks that its agent is reachable and opens a
//! preamble-tagged stream on the agent's session.

use std::sync::Arc;

use kuberde_mux::{write_preamble, MuxStream};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::registry::{ConnectionGuard, SessionRegistry};
use crate::routing::{Resolution, RouteTarget, RoutingTable};
use crate::scale_up::ScaleUpTrigger;

/// A stream ready to be bridged
pub struct OpenedStream {
    /// The logical stream, preamble already written
    pub stream: MuxStream,
    /// Target it leads to
    pub target: RouteTarget,
    /// Keeps the agent's connection count up while bridging
    pub guard: Option<ConnectionGuard>,
}

/// Routing, sessions and scale-up, as seen by the ingress paths
#[derive(Clone)]
pub struct Dataplane {
    /// Route table
    pub routing: Arc<RoutingTable>,
    /// Agent sessions
    pub registry: Arc<SessionRegistry>,
    /// Wakes idle workloads
    pub scale_up: Arc<ScaleUpTrigger>,
}

impl Dataplane {
    /// Bundle the shared state
    pub fn new(
        routing: Arc<RoutingTable>,
        registry: Arc<SessionRegistry>,
        scale_up: Arc<ScaleUpTrigger>,
    ) -> Self {
        Self {
            routing,
            registry,
            scale_up,
        }
    }

    /// Active target for a TCP port
    pub fn route_tcp(&self, port: u16) -> Result<RouteTarget> {
        let resolution = self
            .routing
            .resolve_tcp(port)
            .ok_or_else(|| RelayError::NoRoute(format!("port {port}")))?;
        self.usable(resolution)
    }

    /// Target for an HTTP host, parked or not
    ///
    /// HTTP callers authorize before acting on a parked route, so the
    /// scale-up decision is left to [`Dataplane::usable`].
    pub fn lookup_http(&self, host: &str) -> Result<Resolution> {
        self.routing
            .resolve_http(host)
            .ok_or_else(|| RelayError::NoRoute(format!("host {host}")))
    }

    /// Fail fast on parked routes and offline agents
    ///
    /// A parked route fires the scale-up signal for its workload.
    pub fn usable(&self, resolution: Resolution) -> Result<RouteTarget> {
        let target = match resolution {
            Resolution::Active(target) => target,
            Resolution::Parked(target) => {
                let session = target.session_identity();
                debug!(agent = %session, "Route is parked");
                self.scale_up.fire(&session);
                return Err(RelayError::AgentUnavailable(session.to_string()));
            }
        };
        let session = target.session_identity();
        if self.registry.get(&session).is_none() {
            return Err(RelayError::AgentUnavailable(session.to_string()));
        }
        Ok(target)
    }

    /// Open a stream to `target` and name its service
    pub async fn open_stream(&self, target: RouteTarget) -> Result<OpenedStream> {
        let identity = target.session_identity();
        let session = self
            .registry
            .get(&identity)
            .ok_or_else(|| RelayError::AgentUnavailable(identity.to_string()))?;

        let mut stream = session.open_stream().await?;
        write_preamble(&mut stream, &target.service).await?;
        let guard = self.registry.connection(&identity);
        debug!(agent = %identity, service = %target.service, stream = stream.id(), "Stream opened");
        Ok(OpenedStream {
            stream,
            target,
            guard,
        })
    }
}
