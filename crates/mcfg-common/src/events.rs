//! Kubernetes Event recording for the machine config controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe mcp/<pool>`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "RenderedConfigGenerated")
    /// * `action` - What action was taken (e.g. "Render")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "machineconfigcontroller-rendercontroller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and offline bootstrap.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A new rendered MachineConfig was created for a pool
    pub const RENDERED_CONFIG_GENERATED: &str = "RenderedConfigGenerated";
    /// A spliced MachineConfig was created for a paused pool
    pub const SPLICED_CONFIG_GENERATED: &str = "SplicedConfigGenerated";
    /// The pool's selector matches every MachineConfig
    pub const SELECTING_ALL: &str = "SelectingAll";
    /// Rendering the pool's configuration failed
    pub const RENDER_FAILED: &str = "RenderFailed";
    /// A MachineConfig pins an OS image different from the release default
    pub const OS_IMAGE_URL_OVERRIDDEN: &str = "OSImageURLOverridden";
    /// Node cordoned before applying an update
    pub const CORDON: &str = "Cordon";
    /// Node drain requested or skipped
    pub const DRAIN: &str = "Drain";
    /// Node drain did not complete within the allowed time
    pub const FAILED_TO_DRAIN: &str = "FailedToDrain";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Rendering a pool's configuration
    pub const RENDER: &str = "Render";
    /// Splicing a sensitive change through a paused pool
    pub const SPLICE: &str = "Splice";
    /// Draining a node
    pub const DRAIN: &str = "Drain";
}
