//! Custom Resource Definitions for machine configuration
//!
//! All three kinds are cluster-scoped and live in the
//! `machineconfiguration.openshift.io/v1` API group.

mod controller_config;
mod machine_config;
mod pool;
mod types;

pub use controller_config::{
    ControlPlaneTopology, ControllerConfig, ControllerConfigSpec, ControllerConfigStatus,
    TEMPLATE_CONTROLLER_COMPLETED, TEMPLATE_CONTROLLER_FAILING, TEMPLATE_CONTROLLER_RUNNING,
};
pub use machine_config::{
    MachineConfig, MachineConfigSpec, KERNEL_TYPE_DEFAULT, KERNEL_TYPE_REALTIME,
};
pub use pool::{
    MachineConfigPool, MachineConfigPoolSpec, MachineConfigPoolStatus, POOL_RENDER_DEGRADED,
    POOL_UPDATED, POOL_UPDATING,
};
pub use types::{
    find_condition, is_condition_false, is_condition_true, set_condition, Condition,
    ConditionStatus, PoolConfiguration,
};

/// Kind string of MachineConfig, used in object and owner references
pub const MACHINE_CONFIG_KIND: &str = "MachineConfig";

/// Kind string of MachineConfigPool, used in owner references
pub const MACHINE_CONFIG_POOL_KIND: &str = "MachineConfigPool";

/// apiVersion of every kind in this module
pub const API_VERSION: &str = "machineconfiguration.openshift.io/v1";
