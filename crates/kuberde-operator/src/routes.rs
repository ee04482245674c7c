//! Desired relay routes and the minimal plan to reach them

use std::collections::BTreeMap;
use std::fmt;

use kuberde_common::crd::{AgentWorkload, ServiceProtocol};
use kuberde_common::AgentIdentity;

use crate::relay_client::{ObservedRoute, RouteState};

/// Key a route is looked up by
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteKey {
    /// External relay port
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

/// Where a route sends traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    /// Per-service identity
    pub identity: AgentIdentity,
    /// Service selected in the stream preamble
    pub service: String,
}

/// A single call to the relay
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAction {
    /// Create, re-point or re-activate
    Register(RouteKey, RouteTarget),
    /// Keep the entry but fail lookups fast
    Park(RouteKey),
    /// Delete the entry
    Remove(RouteKey),
}

/// HTTP hostname prefix for a service: `{service}.{workloadIdentity}`
pub fn http_prefix(workload: &AgentIdentity, service: &str) -> String {
    format!("{service}.{workload}")
}

/// Routes an AgentWorkload should have
pub fn desired_routes(aw: &AgentWorkload) -> BTreeMap<RouteKey, RouteTarget> {
    let workload = aw.identity();
    aw.spec
        .services
        .iter()
        .filter_map(|svc| {
            let key = match svc.protocol {
                ServiceProtocol::Http => RouteKey::Http(http_prefix(&workload, &svc.name)),
                ServiceProtocol::Tcp => RouteKey::Tcp(svc.external_port?),
            };
            let target = RouteTarget {
                identity: workload.for_service(&svc.name),
                service: svc.name.clone(),
            };
            Some((key, target))
        })
        .collect()
}

/// Key of a route listed by the relay
pub fn observed_key(route: &ObservedRoute) -> Option<RouteKey> {
    match route.kind.as_str() {
        "TCP" => route.port.map(RouteKey::Tcp),
        "HTTP" => route.hostname_prefix.clone().map(RouteKey::Http),
        _ => None,
    }
}

/// Calls needed to move `observed` to `desired`
///
/// With `park` set the workload is idle: desired routes end up parked rather
/// than active. Routes the workload no longer declares are removed in both
/// cases. A converged table yields an empty plan.
pub fn plan(
    desired: &BTreeMap<RouteKey, RouteTarget>,
    observed: &[ObservedRoute],
    park: bool,
) -> Vec<RouteAction> {
    let observed: BTreeMap<RouteKey, &ObservedRoute> = observed
        .iter()
        .filter_map(|route| observed_key(route).map(|key| (key, route)))
        .collect();

    let mut actions = Vec::new();
    for (key, target) in desired {
        let current = observed.get(key);
        let same_target = current
            .is_some_and(|r| r.agent_id == target.identity && r.service == target.service);
        let state = current.map(|r| r.state);

        if !same_target {
            actions.push(RouteAction::Register(key.clone(), target.clone()));
            if park {
                actions.push(RouteAction::Park(key.clone()));
            }
            continue;
        }
        match (park, state) {
            (false, Some(RouteState::Parked)) => {
                actions.push(RouteAction::Register(key.clone(), target.clone()));
            }
            (true, Some(RouteState::Active)) => actions.push(RouteAction::Park(key.clone())),
            _ => {}
        }
    }

    for key in observed.keys() {
        if !desired.contains_key(key) {
            actions.push(RouteAction::Remove(key.clone()));
        }
    }
    actions
}
