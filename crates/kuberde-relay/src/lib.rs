//! KubeRDE relay
//!
//! Agents dial out to the relay and hold one multiplexed tunnel session
//! each. Users reach a workload either through a per-route TCP port or
//! through hostname-routed HTTP ingress; every accepted connection becomes
//! one stream on the owning agent's session.
//!
//! # Endpoints
//!
//! - `GET /ws?id={identity}` - Agent tunnel (WebSocket)
//! - `POST|DELETE /mgmt/services/tcp` - TCP routes
//! - `POST|DELETE /mgmt/services/http` - HTTP routes
//! - `GET /mgmt/agents/{id}` - Agent activity
//! - `GET /mgmt/routes` - Route table
//! - `/auth/login`, `/auth/callback`, `/auth/logout`, `/auth/refresh` - Browser login
//! - `GET /healthz`, `GET /readyz` - Probes

pub mod auth_routes;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod http_ingress;
pub mod listeners;
pub mod mgmt;
pub mod monitor;
pub mod registry;
pub mod routing;
pub mod scale_up;
pub mod server;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use server::{run, AppState, StateParts};
