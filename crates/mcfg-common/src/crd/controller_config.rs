//! ControllerConfig CRD: cluster-wide base settings for rendering
//!
//! A singleton written by the operator. Rendering only proceeds once the
//! operator of the same version has finished processing it.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_condition_true, Condition};

/// Condition type set when the template controller finished a sync
pub const TEMPLATE_CONTROLLER_COMPLETED: &str = "TemplateControllerCompleted";

/// Condition type set while the template controller is syncing
pub const TEMPLATE_CONTROLLER_RUNNING: &str = "TemplateControllerRunning";

/// Condition type set when the template controller failed
pub const TEMPLATE_CONTROLLER_FAILING: &str = "TemplateControllerFailing";

/// ControllerConfig carries defaults every rendered config inherits.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "ControllerConfig",
    status = "ControllerConfigStatus",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfigSpec {
    /// Default OS image for the current release
    #[serde(rename = "osImageURL", default)]
    pub os_image_url: String,

    /// Release payload image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_image: String,

    /// Control plane topology of the cluster
    #[serde(default)]
    pub control_plane_topology: ControlPlaneTopology,
}

/// How the control plane is deployed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ControlPlaneTopology {
    /// Multiple control plane replicas
    #[default]
    HighlyAvailable,
    /// A single node runs everything
    SingleReplica,
    /// The control plane runs outside the cluster
    External,
}

/// Observed state of the ControllerConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfigStatus {
    /// Generation the template controller last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Template controller conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ControllerConfig {
    /// Check that the template controller has fully processed this object.
    ///
    /// Returns a human-readable reason when it has not.
    pub fn check_completed(&self) -> Result<(), String> {
        let status = self
            .status
            .as_ref()
            .ok_or_else(|| format!("ControllerConfig {} has no status", self.name_any()))?;

        let generation = self.metadata.generation.unwrap_or_default();
        if status.observed_generation.unwrap_or_default() != generation {
            return Err(format!(
                "ControllerConfig {} has not been observed: generation {} observed {}",
                self.name_any(),
                generation,
                status.observed_generation.unwrap_or_default()
            ));
        }

        let completed = is_condition_true(&status.conditions, TEMPLATE_CONTROLLER_COMPLETED);
        let running = is_condition_true(&status.conditions, TEMPLATE_CONTROLLER_RUNNING);
        let failing = is_condition_true(&status.conditions, TEMPLATE_CONTROLLER_FAILING);
        if completed && !running && !failing {
            return Ok(());
        }

        Err(format!(
            "ControllerConfig has not completed: completed({}) running({}) failing({})",
            completed, running, failing
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;

    fn completed_config() -> ControllerConfig {
        let mut cc = ControllerConfig::new(crate::CONTROLLER_CONFIG_NAME, Default::default());
        cc.metadata.generation = Some(3);
        cc.status = Some(ControllerConfigStatus {
            observed_generation: Some(3),
            conditions: vec![Condition::new(
                TEMPLATE_CONTROLLER_COMPLETED,
                ConditionStatus::True,
                "",
                "",
            )],
        });
        cc
    }

    #[test]
    fn completed_config_passes() {
        assert!(completed_config().check_completed().is_ok());
    }

    #[test]
    fn stale_generation_is_not_completed() {
        let mut cc = completed_config();
        cc.metadata.generation = Some(4);
        let reason = cc.check_completed().unwrap_err();
        assert!(reason.contains("generation 4 observed 3"));
    }

    #[test]
    fn running_or_failing_is_not_completed() {
        let mut cc = completed_config();
        cc.status.as_mut().unwrap().conditions.push(Condition::new(
            TEMPLATE_CONTROLLER_RUNNING,
            ConditionStatus::True,
            "",
            "",
        ));
        let reason = cc.check_completed().unwrap_err();
        assert!(reason.contains("running(true)"));
    }

    #[test]
    fn missing_status_is_not_completed() {
        let cc = ControllerConfig::new(crate::CONTROLLER_CONFIG_NAME, Default::default());
        assert!(cc.check_completed().unwrap_err().contains("no status"));
    }

    #[test]
    fn topology_defaults_to_highly_available() {
        let spec: ControllerConfigSpec =
            serde_json::from_value(serde_json::json!({"osImageURL": "quay.io/os:1"})).unwrap();
        assert_eq!(spec.control_plane_topology, ControlPlaneTopology::HighlyAvailable);
        assert_eq!(spec.os_image_url, "quay.io/os:1");
    }
}
