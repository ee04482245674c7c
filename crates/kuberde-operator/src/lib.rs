//! KubeRDE operator
//!
//! Reconciles `AgentWorkload` resources into an agent Deployment plus relay
//! routes, scales idle workloads to zero after their TTL, and serves the
//! `/scale-up` webhook the relay calls when traffic reaches an idle
//! workload.

pub mod config;
pub mod controller;
pub mod error;
pub mod kube_client;
pub mod relay_client;
pub mod routes;
pub mod ttl;
pub mod webhook;
pub mod workload;

pub use config::OperatorConfig;
pub use controller::{error_policy, reconcile, Context, ControllerSettings};
pub use error::{OperatorError, Result};
