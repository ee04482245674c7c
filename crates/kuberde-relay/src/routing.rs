//! Routing table
//!
//! Maps inbound TCP ports and HTTP hostname prefixes to an agent identity and
//! service. Entries live only in memory; the operator rebuilds them on its
//! next reconcile after a relay restart.
//!
//! An entry is either active or parked. Parked entries belong to workloads
//! scaled to zero: lookups on them report the agent unavailable so the
//! caller can fire a scale-up instead of answering "no route".

use std::collections::{HashMap, HashSet};
use std::fmt;

use kuberde_auth::{can_act_on, Principal};
use kuberde_common::crd::is_dns_label;
use kuberde_common::AgentIdentity;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RelayError, Result};

/// Lookup key of a route
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// External TCP port
    Tcp(u16),
    /// Hostname prefix
    Http(String),
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::Http(prefix) => write!(f, "http:{prefix}"),
        }
    }
}

/// Where a route leads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Per-service identity
    pub identity: AgentIdentity,
    /// Preamble selector
    pub service: String,
}

impl RouteTarget {
    /// Create a target
    pub fn new(identity: AgentIdentity, service: impl Into<String>) -> Self {
        Self {
            identity,
            service: service.into(),
        }
    }

    /// Identity of the tunnel session serving this target
    pub fn session_identity(&self) -> AgentIdentity {
        self.identity.session_identity(&self.service)
    }
}

/// Whether traffic may flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteState {
    /// Normal
    Active,
    /// Workload is idle
    Parked,
}

/// A route as listed by the management API
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    /// `TCP` or `HTTP`
    pub kind: &'static str,
    /// Port for TCP routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Hostname prefix for HTTP routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_prefix: Option<String>,
    /// Per-service identity
    #[serde(rename = "agentID")]
    pub agent_id: AgentIdentity,
    /// Service name
    pub service: String,
    /// Current state
    pub state: RouteState,
}

/// Result of a lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Route to this target
    Active(RouteTarget),
    /// The target's workload is idle
    Parked(RouteTarget),
}

/// What a registration did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New key
    Created,
    /// Same mapping already present and active
    Unchanged,
    /// Same mapping was parked and is active again
    Reactivated,
    /// Key moved from another target
    Replaced(RouteTarget),
}

#[derive(Clone, Debug)]
struct Route {
    target: RouteTarget,
    state: RouteState,
}

/// The relay's routing table
pub struct RoutingTable {
    tcp: RwLock<HashMap<u16, Route>>,
    http: RwLock<HashMap<String, Route>>,
    reserved_ports: HashSet<u16>,
    agent_domain: Option<String>,
}

impl RoutingTable {
    /// Empty table
    ///
    /// `reserved_ports` are the relay's own listeners. `agent_domain`
    /// enables derived routes for `{service}.{identity}.{domain}` hosts.
    pub fn new(reserved_ports: impl IntoIterator<Item = u16>, agent_domain: Option<String>) -> Self {
        Self {
            tcp: RwLock::new(HashMap::new()),
            http: RwLock::new(HashMap::new()),
            reserved_ports: reserved_ports.into_iter().collect(),
            agent_domain,
        }
    }

    fn validate(&self, key: &RouteKey) -> Result<()> {
        match key {
            RouteKey::Tcp(0) => Err(RelayError::InvalidKey("port 0".into())),
            RouteKey::Tcp(port) if self.reserved_ports.contains(port) => Err(
                RelayError::InvalidKey(format!("port {port} is used by the relay")),
            ),
            RouteKey::Tcp(_) => Ok(()),
            RouteKey::Http(prefix) => {
                if is_hostname(prefix) {
                    Ok(())
                } else {
                    Err(RelayError::InvalidKey(format!(
                        "hostname prefix '{prefix}' is not a sequence of DNS labels"
                    )))
                }
            }
        }
    }

    /// Bind `key` to `target`
    ///
    /// Re-registering the same mapping succeeds without change. A key bound
    /// to another identity is only superseded when `caller` may act on that
    /// identity.
    pub fn register(
        &self,
        key: RouteKey,
        target: RouteTarget,
        caller: &Principal,
    ) -> Result<RegisterOutcome> {
        self.validate(&key)?;
        let outcome = match &key {
            RouteKey::Tcp(port) => upsert(&mut self.tcp.write(), *port, &key, target.clone(), caller),
            RouteKey::Http(prefix) => {
                upsert(&mut self.http.write(), prefix.clone(), &key, target.clone(), caller)
            }
        }?;
        if outcome != RegisterOutcome::Unchanged {
            info!(route = %key, agent = %target.identity, service = %target.service, ?outcome, "Route registered");
        }
        Ok(outcome)
    }

    /// Remove `key`, or park it when `park` is set
    ///
    /// Returns the target the key was bound to.
    pub fn deregister(&self, key: &RouteKey, park: bool, caller: &Principal) -> Result<RouteTarget> {
        let target = match key {
            RouteKey::Tcp(port) => remove_or_park(&mut self.tcp.write(), port, key, park, caller),
            RouteKey::Http(prefix) => remove_or_park(&mut self.http.write(), prefix, key, park, caller),
        }?;
        info!(route = %key, agent = %target.identity, park, "Route deregistered");
        Ok(target)
    }

    /// Target for a TCP port
    pub fn resolve_tcp(&self, port: u16) -> Option<Resolution> {
        self.tcp.read().get(&port).map(Route::resolution)
    }

    /// Target for an HTTP `Host`
    ///
    /// The longest explicit prefix matching the host (exactly, or followed
    /// by `.`) wins. Otherwise a host under the agent domain is split into
    /// `{service}.{workload identity}`.
    pub fn resolve_http(&self, host: &str) -> Option<Resolution> {
        let host = normalize_host(host);
        let explicit = {
            let http = self.http.read();
            http.iter()
                .filter(|(prefix, _)| {
                    host == prefix.as_str()
                        || host
                            .strip_prefix(prefix.as_str())
                            .is_some_and(|rest| rest.starts_with('.'))
                })
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, route)| route.resolution())
        };
        explicit.or_else(|| self.derive_http(&host).map(Resolution::Active))
    }

    fn derive_http(&self, host: &str) -> Option<RouteTarget> {
        let domain = self.agent_domain.as_deref()?;
        let sub = host.strip_suffix(domain)?.strip_suffix('.')?;
        let (service, workload) = sub.split_once('.')?;
        if workload.contains('.') || !is_dns_label(service) {
            return None;
        }
        let workload = AgentIdentity::parse(workload).ok()?;
        Some(RouteTarget::new(workload.for_service(service), service))
    }

    /// Every route, optionally only those served by the session `identity`
    ///
    /// Only the session identity is compared. Service `x` of workload `ws`
    /// and workload `ws-x` spell the same target string.
    pub fn snapshot(&self, identity: Option<&AgentIdentity>) -> Vec<RouteView> {
        let matches = |route: &Route| match identity {
            None => true,
            Some(id) => route.target.session_identity() == *id,
        };

        let mut views: Vec<RouteView> = self
            .tcp
            .read()
            .iter()
            .filter(|(_, r)| matches(r))
            .map(|(port, r)| RouteView {
                kind: "TCP",
                port: Some(*port),
                hostname_prefix: None,
                agent_id: r.target.identity.clone(),
                service: r.target.service.clone(),
                state: r.state,
            })
            .collect();
        views.extend(
            self.http
                .read()
                .iter()
                .filter(|(_, r)| matches(r))
                .map(|(prefix, r)| RouteView {
                    kind: "HTTP",
                    port: None,
                    hostname_prefix: Some(prefix.clone()),
                    agent_id: r.target.identity.clone(),
                    service: r.target.service.clone(),
                    state: r.state,
                }),
        );
        views.sort_by(|a, b| {
            (a.kind, a.port, &a.hostname_prefix).cmp(&(b.kind, b.port, &b.hostname_prefix))
        });
        views
    }
}

impl Route {
    fn resolution(&self) -> Resolution {
        match self.state {
            RouteState::Active => Resolution::Active(self.target.clone()),
            RouteState::Parked => Resolution::Parked(self.target.clone()),
        }
    }
}

fn upsert<K: Eq + std::hash::Hash>(
    map: &mut HashMap<K, Route>,
    k: K,
    key: &RouteKey,
    target: RouteTarget,
    caller: &Principal,
) -> Result<RegisterOutcome> {
    let outcome = match map.get_mut(&k) {
        None => RegisterOutcome::Created,
        Some(existing) if existing.target == target => {
            if existing.state == RouteState::Active {
                return Ok(RegisterOutcome::Unchanged);
            }
            existing.state = RouteState::Active;
            return Ok(RegisterOutcome::Reactivated);
        }
        Some(existing) => {
            if existing.target.identity != target.identity
                && !can_act_on(caller, &existing.target.identity)
            {
                return Err(RelayError::Conflict {
                    key: key.to_string(),
                    existing: existing.target.identity.to_string(),
                });
            }
            RegisterOutcome::Replaced(existing.target.clone())
        }
    };
    map.insert(
        k,
        Route {
            target,
            state: RouteState::Active,
        },
    );
    Ok(outcome)
}

fn remove_or_park<K: Eq + std::hash::Hash>(
    map: &mut HashMap<K, Route>,
    k: &K,
    key: &RouteKey,
    park: bool,
    caller: &Principal,
) -> Result<RouteTarget> {
    let existing = map
        .get_mut(k)
        .ok_or_else(|| RelayError::NotFound(key.to_string()))?;
    kuberde_auth::authorize(caller, &existing.target.identity)?;
    if park {
        existing.state = RouteState::Parked;
        return Ok(existing.target.clone());
    }
    map.remove(k)
        .map(|route| route.target)
        .ok_or_else(|| RelayError::NotFound(key.to_string()))
}

/// Lowercase, without a `:port` suffix or trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_hostname(s: &str) -> bool {
    !s.is_empty() && s.len() <= 253 && s.split('.').all(is_dns_label)
}
