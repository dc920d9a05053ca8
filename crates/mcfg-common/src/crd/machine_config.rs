//! MachineConfig CRD: one fragment of machine configuration
//!
//! Fragments are written by users and other controllers. Rendered configs
//! are MachineConfigs too, produced by merging all fragments selected by a pool.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, ResourceExt};
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ignition::IgnitionConfig;

/// Kernel type requesting the default kernel
pub const KERNEL_TYPE_DEFAULT: &str = "default";

/// Kernel type requesting the realtime kernel
pub const KERNEL_TYPE_REALTIME: &str = "realtime";

/// A MachineConfig describes configuration applied to machines in a pool.
///
/// Example:
/// ```yaml
/// apiVersion: machineconfiguration.openshift.io/v1
/// kind: MachineConfig
/// metadata:
///   name: 99-worker-motd
///   labels:
///     machineconfiguration.openshift.io/role: worker
/// spec:
///   config:
///     ignition:
///       version: 3.2.0
///     storage:
///       files:
///         - path: /etc/motd
///           contents:
///             source: data:,hello
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfig",
    shortname = "mc",
    printcolumn = r#"{"name":"GeneratedByController","type":"string","jsonPath":".metadata.annotations.machineconfiguration\\.openshift\\.io/generated-by-controller-version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigSpec {
    /// OS image to boot. Empty means "use the release default".
    #[serde(rename = "osImageURL", default, skip_serializing_if = "String::is_empty")]
    pub os_image_url: String,

    /// Ignition document
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: IgnitionConfig,

    /// Extra kernel command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_arguments: Vec<String>,

    /// RHCOS extensions to layer onto the OS
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,

    /// Whether FIPS mode is enabled
    #[serde(default)]
    pub fips: bool,

    /// Kernel type ("", "default" or "realtime")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_type: String,
}

/// Object schema the API server stores without pruning.
///
/// Ignition documents carry sections this controller does not model; they
/// must reach the merge intact.
fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}

impl MachineConfig {
    /// The owner reference marked as controller, if any
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
    }

    /// Value of an annotation, if set
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    /// Labels as a plain map (empty when unset)
    pub fn label_map(&self) -> &BTreeMap<String, String> {
        self.labels()
    }

    /// Whether this object is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    #[test]
    fn os_image_url_uses_upper_case_acronym() {
        let spec = MachineConfigSpec {
            os_image_url: "quay.io/os@sha256:abc".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["osImageURL"], "quay.io/os@sha256:abc");
        assert!(json.get("osImageUrl").is_none());
    }

    #[test]
    fn crd_keeps_unmodeled_ignition_fields() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(MachineConfig::crd()).unwrap();
        let config = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
            ["properties"]["config"];
        assert_eq!(config["x-kubernetes-preserve-unknown-fields"], true);
        assert_eq!(config["type"], "object");
    }

    #[test]
    fn parses_yaml_fragment() {
        let mc: MachineConfig = serde_json::from_value(serde_json::json!({
            "apiVersion": "machineconfiguration.openshift.io/v1",
            "kind": "MachineConfig",
            "metadata": {"name": "99-worker-motd", "labels": {"role": "worker"}},
            "spec": {
                "config": {
                    "ignition": {"version": "3.2.0"},
                    "storage": {"files": [{"path": "/etc/motd", "contents": {"source": "data:,hi"}}]}
                },
                "kernelArguments": ["nosmt"]
            }
        }))
        .unwrap();

        assert_eq!(mc.name_any(), "99-worker-motd");
        assert_eq!(mc.spec.kernel_arguments, vec!["nosmt"]);
        assert_eq!(mc.spec.config.read_file("/etc/motd").unwrap().unwrap(), b"hi");
        assert_eq!(mc.label_map().get("role").map(String::as_str), Some("worker"));
    }

    #[test]
    fn controller_ref_ignores_non_controller_owners() {
        let mut mc = MachineConfig::new("rendered-worker-abc", MachineConfigSpec::default());
        mc.metadata = ObjectMeta {
            name: Some("rendered-worker-abc".to_string()),
            owner_references: Some(vec![
                OwnerReference {
                    kind: "ConfigMap".to_string(),
                    name: "unrelated".to_string(),
                    ..Default::default()
                },
                OwnerReference {
                    kind: "MachineConfigPool".to_string(),
                    name: "worker".to_string(),
                    uid: "uid-1".to_string(),
                    controller: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let owner = mc.controller_ref().unwrap();
        assert_eq!(owner.name, "worker");
        assert!(!mc.is_deleting());
    }
}
