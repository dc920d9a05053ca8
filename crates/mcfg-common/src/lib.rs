//! Common types for the machine config controllers: CRDs, errors, and utilities
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (MachineConfig, MachineConfigPool, ControllerConfig)
//! - [`ignition`] - The Ignition payload carried by a MachineConfig
//! - [`diff`] - Structural diff between two MachineConfig specs
//! - [`version`] - Identity of the running controller build
//! - [`events`] - Kubernetes Event publishing
//! - [`metrics`] - OpenTelemetry gauges and counters
//! - [`telemetry`] - Tracing subscriber and OTLP setup
//! - [`retry`] - Exponential backoff helpers
//! - [`kube_utils`] - Polling, hashing and client helpers
//! - [`certs`] - PEM bundle inspection
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod certs;
pub mod crd;
pub mod diff;
pub mod error;
pub mod events;
pub mod ignition;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod version;

pub use error::Error;
pub use version::ControllerVersion;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by every machine configuration resource
pub const API_GROUP: &str = "machineconfiguration.openshift.io";

/// Name of the singleton ControllerConfig
pub const CONTROLLER_CONFIG_NAME: &str = "machine-config-controller";

/// Prefix of every rendered MachineConfig name
pub const RENDERED_PREFIX: &str = "rendered-";

/// Prefix of MachineConfigs produced by the paused-pool splice
pub const SPLICED_PREFIX: &str = "spliced-";

/// Annotation on ControllerConfig recording the raw version of the operator that wrote it
pub const GENERATED_BY_VERSION_ANNOTATION: &str =
    "machineconfiguration.openshift.io/generated-by-version";

/// Annotation on MachineConfigs recording the controller build hash that generated them
pub const GENERATED_BY_CONTROLLER_VERSION_ANNOTATION: &str =
    "machineconfiguration.openshift.io/generated-by-controller-version";

/// Annotation recording the release version a rendered config targets
pub const RELEASE_IMAGE_VERSION_ANNOTATION: &str =
    "machineconfiguration.openshift.io/release-image-version";

/// Annotation set on rendered configs whose OS image differs from the release default
pub const OS_IMAGE_URL_OVERRIDDEN_ANNOTATION: &str =
    "machineconfiguration.openshift.io/os-image-url-overridden";

/// Annotation set on spliced configs that may roll out through a paused pool
pub const PAUSE_BYPASS_ANNOTATION: &str = "machineconfiguration.openshift.io/pause-bypass";

/// The trusted CA bundle used by the kubelet on every node
pub const KUBELET_CA_PATH: &str = "/etc/kubernetes/kubelet-ca.crt";

/// The container registry configuration consumed by CRI-O
pub const CONTAINER_REGISTRY_CONF_PATH: &str = "/etc/containers/registries.conf";

/// Files allowed to reach nodes while their pool is paused
pub const PAUSE_BYPASS_FILES: &[&str] = &[KUBELET_CA_PATH];
