//! What a node must do after writing a new config to disk

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use mcfg_common::diff::MachineConfigDiff;
use mcfg_common::{CONTAINER_REGISTRY_CONF_PATH, KUBELET_CA_PATH};

/// Files that take effect without any action
const NO_ACTION_FILES: &[&str] = &[KUBELET_CA_PATH, "/var/lib/kubelet/config.json"];

/// Files that take effect after CRI-O reloads
const CRIO_RELOAD_FILES: &[&str] = &[CONTAINER_REGISTRY_CONF_PATH, "/etc/containers/policy.json"];

/// Directory whose files take effect after CRI-O reloads
const CRIO_RELOAD_DIR: &str = "/etc/containers/registries.d/";

/// Action needed for a config change to take effect
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PostConfigChangeAction {
    /// Nothing; the files are read on use
    None,
    /// Reboot the node
    Reboot,
    /// Reload the container runtime
    ReloadCrio,
    /// An action this version does not know
    Other(String),
}

impl fmt::Display for PostConfigChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Reboot => write!(f, "reboot"),
            Self::ReloadCrio => write!(f, "reload crio"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for PostConfigChangeAction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "reboot" => Self::Reboot,
            "reload crio" | "reload-service" => Self::ReloadCrio,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Work out the actions needed to apply `diff`.
///
/// Any change outside of files and users needs a reboot. User and SSH key
/// changes need nothing. File changes limited to the no-action set need
/// nothing, and those limited to the no-action and CRI-O sets need a CRI-O
/// reload. Every other file needs a reboot.
pub fn calculate_post_config_change_actions(
    diff: &MachineConfigDiff,
    diff_file_set: &BTreeSet<String>,
) -> Vec<PostConfigChangeAction> {
    if diff.has_non_file_changes() {
        return vec![PostConfigChangeAction::Reboot];
    }

    let mut reload_crio = false;
    for path in diff_file_set {
        if NO_ACTION_FILES.contains(&path.as_str()) {
            continue;
        }
        if CRIO_RELOAD_FILES.contains(&path.as_str()) || path.starts_with(CRIO_RELOAD_DIR) {
            reload_crio = true;
            continue;
        }
        return vec![PostConfigChangeAction::Reboot];
    }

    if reload_crio {
        vec![PostConfigChangeAction::ReloadCrio]
    } else {
        vec![PostConfigChangeAction::None]
    }
}
