//! Error types for rendering and reconciliation

use thiserror::Error;

use crate::selector::SelectorError;

/// Why a render did not produce a config.
///
/// `Deferred` means the inputs are not ready for this controller yet and the
/// render should simply be retried later. `Invalid` means the inputs are wrong
/// and the pool is degraded until someone fixes them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// Base settings or fragments come from another controller version
    #[error("render deferred: {0}")]
    Deferred(String),

    /// A fragment failed validation or the merge itself failed
    #[error("{0}")]
    Invalid(String),
}

impl RenderError {
    /// Create a deferral
    pub fn deferred(msg: impl Into<String>) -> Self {
        Self::Deferred(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Whether this is a deferral rather than a failure
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

/// Errors returned by a pool reconcile
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The pool's selector could not be parsed
    #[error("invalid label selector: {0}")]
    Selector(#[from] SelectorError),

    /// The pool's selector matched nothing
    #[error("no MachineConfigs found matching selector {selector}")]
    NoMatchingConfigs {
        /// Printed form of the selector
        selector: String,
    },

    /// Rendering failed
    #[error(transparent)]
    Render(#[from] RenderError),

    /// A read or write against the cluster failed
    #[error(transparent)]
    Store(#[from] mcfg_common::Error),
}

impl ReconcileError {
    /// Short machine-readable reason for the degraded condition
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Selector(_) => "InvalidSelector",
            Self::NoMatchingConfigs { .. } => "NoMatchingConfigs",
            Self::Render(RenderError::Deferred(_)) => "Deferred",
            Self::Render(RenderError::Invalid(_)) => "InvalidConfig",
            Self::Store(_) => "StoreError",
        }
    }
}
