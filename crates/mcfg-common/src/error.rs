//! Error types shared by the machine config controllers
//!
//! Errors carry the object they concern (pool or MachineConfig name) so that
//! log lines and degraded conditions can be traced back without extra context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for machine config operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A MachineConfig failed schema validation
    #[error("invalid MachineConfig {config}: {message}")]
    Validation {
        /// Name of the offending MachineConfig
        config: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.config.storage.files[0].path")
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

    /// An object the caller expected in the cache or store does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "queue", "poll_until")
        context: String,
    },
}

impl Error {
    /// Create a validation error without MachineConfig context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            config: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named MachineConfig
    pub fn validation_for(config: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            config: config.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named MachineConfig and field path
    pub fn validation_for_field(
        config: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            config: config.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
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

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Check if this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => {
                matches!(source, kube::Error::Api(ae) if ae.code == 404)
            }
            _ => false,
        }
    }

    /// Check if this error is a write conflict (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require an operator to fix the input.
    /// Kubernetes errors are retryable unless the server rejected the request (4xx),
    /// with conflicts treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::NotFound { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the MachineConfig name if this error concerns one
    pub fn config(&self) -> Option<&str> {
        match self {
            Error::Validation { config, .. } => Some(config),
            Error::NotFound { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a malformed fragment names itself in the error
    ///
    /// When one MachineConfig in a pool is broken, the degraded message on the
    /// pool must point the operator at the right object.
    #[test]
    fn story_validation_error_names_the_machine_config() {
        let err = Error::validation_for("99-worker-ssh", "file path must be absolute");
        assert!(err.to_string().contains("99-worker-ssh"));
        assert!(err.to_string().contains("absolute"));
        assert_eq!(err.config(), Some("99-worker-ssh"));
        assert!(!err.is_retryable());

        let err = Error::validation_for_field(
            "99-worker-ssh",
            "spec.config.storage.files[0].path",
            "must be absolute",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.config.storage.files[0].path"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn not_found_is_retryable_and_detected() {
        let err = Error::not_found("MachineConfig", "rendered-worker-abc");
        assert!(err.is_not_found());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "MachineConfig rendered-worker-abc not found");
    }

    #[test]
    fn kube_api_errors_classified_by_code() {
        let conflict = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let missing = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn internal_errors_carry_context() {
        let err = Error::internal_with_context("queue", "shut down");
        assert!(err.to_string().contains("[queue]"));
        assert!(Error::internal("boom").to_string().contains(UNKNOWN_CONTEXT));
    }

    #[test]
    fn serde_errors_become_serialization_errors() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(Error::serialization_for_kind("MachineConfig", "bad")
            .to_string()
            .contains("bad"));
    }
}
