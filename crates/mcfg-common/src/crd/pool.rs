//! MachineConfigPool CRD: a group of machines sharing one rendered config
//!
//! The render controller owns `spec.configuration` (the target rendered config
//! and its provenance) and the `RenderDegraded` status condition.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, ConditionStatus, PoolConfiguration};

/// Condition type set while the pool's configuration cannot be rendered
pub const POOL_RENDER_DEGRADED: &str = "RenderDegraded";

/// Condition type reporting all machines run the target configuration
pub const POOL_UPDATED: &str = "Updated";

/// Condition type reporting a rollout in progress
pub const POOL_UPDATING: &str = "Updating";

/// MachineConfigPool selects MachineConfigs by label and tracks the rendered result.
///
/// Example:
/// ```yaml
/// apiVersion: machineconfiguration.openshift.io/v1
/// kind: MachineConfigPool
/// metadata:
///   name: worker
/// spec:
///   machineConfigSelector:
///     matchLabels:
///       machineconfiguration.openshift.io/role: worker
///   nodeSelector:
///     matchLabels:
///       node-role.kubernetes.io/worker: ""
///   paused: false
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfigPool",
    shortname = "mcp",
    status = "MachineConfigPoolStatus",
    printcolumn = r#"{"name":"Config","type":"string","jsonPath":".status.configuration.name"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// Selects the MachineConfigs merged into this pool's rendered config.
    /// A missing selector selects nothing; an empty selector is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_config_selector: Option<LabelSelector>,

    /// Selects the nodes that belong to this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    /// Stops configuration rollout to the pool's machines
    #[serde(default)]
    pub paused: bool,

    /// Target rendered configuration
    #[serde(default)]
    pub configuration: PoolConfiguration,
}

/// Observed state of a MachineConfigPool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolStatus {
    /// Generation observed by the pool controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Rendered configuration currently applied to the pool's machines
    #[serde(default)]
    pub configuration: PoolConfiguration,

    /// Number of machines in the pool
    #[serde(default)]
    pub machine_count: i32,

    /// Number of machines running the target configuration
    #[serde(default)]
    pub updated_machine_count: i32,

    /// Number of machines that failed to apply configuration
    #[serde(default)]
    pub degraded_machine_count: i32,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MachineConfigPoolStatus {
    /// Insert or replace a condition
    pub fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.conditions, condition);
    }
}

impl MachineConfigPool {
    /// Name of the rendered config currently applied to the pool, if any
    pub fn current_config_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.configuration.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Name of the rendered config the pool targets, if any
    pub fn target_config_name(&self) -> Option<&str> {
        Some(self.spec.configuration.name.as_str()).filter(|n| !n.is_empty())
    }

    /// Conditions, or an empty slice when the pool has no status yet
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    /// Set the RenderDegraded condition to True with the given message
    pub fn mark_render_degraded(&mut self, reason: &str, message: impl Into<String>) {
        self.status
            .get_or_insert_with(Default::default)
            .set_condition(Condition::new(
                POOL_RENDER_DEGRADED,
                ConditionStatus::True,
                reason,
                message,
            ));
    }

    /// Set the RenderDegraded condition to False
    pub fn clear_render_degraded(&mut self) {
        self.status
            .get_or_insert_with(Default::default)
            .set_condition(Condition::new(
                POOL_RENDER_DEGRADED,
                ConditionStatus::False,
                "",
                "",
            ));
    }

    /// Provenance list of the target configuration
    pub fn target_source(&self) -> &[ObjectReference] {
        &self.spec.configuration.source
    }
}
