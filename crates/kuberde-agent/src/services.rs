//! Local service table
//!
//! Built once at startup from `KUBERDE_SERVICES` (or the legacy
//! `LOCAL_TARGET`) and never changed afterwards.

use std::collections::BTreeMap;

use kuberde_common::crd::{is_dns_label, ServiceProtocol};
use serde::Deserialize;

use crate::error::{AgentError, Result};

/// Host dialed when an entry names none
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Service created from `LOCAL_TARGET`
pub const DEFAULT_SERVICE: &str = "default";

/// A service reachable inside the pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalService {
    /// Name the relay puts in the preamble
    pub name: String,
    /// Host to dial
    pub host: String,
    /// Port to dial
    pub port: u16,
    /// How the relay routes to it
    pub protocol: ServiceProtocol,
}

impl LocalService {
    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct ServicesDocument {
    services: Vec<ServiceEntry>,
}

#[derive(Deserialize)]
struct ServiceEntry {
    name: String,
    port: u16,
    #[serde(default = "default_protocol")]
    protocol: ServiceProtocol,
    #[serde(default)]
    host: Option<String>,
}

fn default_protocol() -> ServiceProtocol {
    ServiceProtocol::Tcp
}

/// Immutable `name -> service` table
#[derive(Clone, Debug, Default)]
pub struct ServiceTable {
    services: BTreeMap<String, LocalService>,
}

impl ServiceTable {
    /// Parse `{"services":[{"name","port","protocol","host"?}]}`
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: ServicesDocument = serde_json::from_str(raw)
            .map_err(|e| AgentError::config(format!("invalid KUBERDE_SERVICES: {e}")))?;
        let mut services = BTreeMap::new();
        for entry in doc.services {
            if !is_dns_label(&entry.name) {
                return Err(AgentError::config(format!(
                    "service name {:?} is not a DNS label",
                    entry.name
                )));
            }
            if entry.port == 0 {
                return Err(AgentError::config(format!("service {} has port 0", entry.name)));
            }
            let service = LocalService {
                host: entry.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                name: entry.name.clone(),
                port: entry.port,
                protocol: entry.protocol,
            };
            if services.insert(entry.name.clone(), service).is_some() {
                return Err(AgentError::config(format!("duplicate service {}", entry.name)));
            }
        }
        if services.is_empty() {
            return Err(AgentError::config("KUBERDE_SERVICES lists no services"));
        }
        Ok(Self { services })
    }

    /// Single `default` service from a `host:port` target
    pub fn from_local_target(target: &str) -> Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| AgentError::config(format!("LOCAL_TARGET {target:?} is not host:port")))?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| AgentError::config(format!("LOCAL_TARGET {target:?} has an invalid port")))?;
        let host = if host.is_empty() { DEFAULT_HOST } else { host };

        let mut services = BTreeMap::new();
        services.insert(
            DEFAULT_SERVICE.to_string(),
            LocalService {
                name: DEFAULT_SERVICE.to_string(),
                host: host.to_string(),
                port,
                protocol: ServiceProtocol::Tcp,
            },
        );
        Ok(Self { services })
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<&LocalService> {
        self.services.get(name)
    }

    /// Service names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
