//! Error types shared by the KubeRDE crates
//!
//! Errors carry the workload or identity they relate to so that log lines
//! emitted far from the failure site still say which tenant was affected.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for KubeRDE operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for an AgentWorkload spec or an identity
    #[error("validation error for {workload}: {message}")]
    Validation {
        /// Name of the workload with invalid configuration
        workload: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.services[0].name")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error without workload context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            workload: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a workload
    pub fn validation_for(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            workload: workload.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a workload and field path
    pub fn validation_for_field(
        workload: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            workload: workload.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Validation errors need a spec change; everything else is treated as
    /// transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    /// The field path of a validation error, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_names_workload() {
        let err = Error::validation_for("alice-ws", "duplicate service name");
        assert_eq!(
            err.to_string(),
            "validation error for alice-ws: duplicate service name"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_error_without_context_uses_unknown() {
        let err = Error::validation("bad");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));
        assert_eq!(err.field(), None);
    }

    #[test]
    fn field_path_is_preserved() {
        let err = Error::validation_for_field("ws", "spec.services[1].port", "port out of range");
        assert_eq!(err.field(), Some("spec.services[1].port"));
    }

    #[test]
    fn internal_errors_are_retryable() {
        let err = Error::internal_with_context("reconciler", "relay unreachable");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "internal error [reconciler]: relay unreachable"
        );
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not-json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { kind: None, .. }));
    }
}
