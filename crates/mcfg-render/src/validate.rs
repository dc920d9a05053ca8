//! Fragment validation run before every merge

use mcfg_common::crd::{MachineConfigSpec, KERNEL_TYPE_DEFAULT, KERNEL_TYPE_REALTIME};
use mcfg_common::ignition::decode_data_url;

const UNIT_SUFFIXES: &[&str] = &[
    ".service",
    ".socket",
    ".target",
    ".timer",
    ".mount",
    ".automount",
    ".path",
    ".slice",
    ".scope",
    ".swap",
    ".device",
];

/// Check that a MachineConfig spec can be merged.
///
/// Returns a description of the first problem found.
pub fn validate_machine_config(spec: &MachineConfigSpec) -> Result<(), String> {
    let version = &spec.config.ignition.version;
    if !version.is_empty() && !is_v3(version) {
        return Err(format!(
            "unsupported Ignition version {:?}: only 3.x is supported",
            version
        ));
    }

    for file in &spec.config.storage.files {
        if !file.path.starts_with('/') {
            return Err(format!("file path {:?} is not absolute", file.path));
        }
        if let Some(source) = &file.contents.source {
            decode_data_url(source)
                .map_err(|e| format!("file {}: invalid contents: {}", file.path, e))?;
        }
    }

    for unit in &spec.config.systemd.units {
        if unit.name.is_empty() {
            return Err("systemd unit has an empty name".to_string());
        }
        if !UNIT_SUFFIXES.iter().any(|s| unit.name.ends_with(s)) {
            return Err(format!("systemd unit {:?} has no valid unit type suffix", unit.name));
        }
    }

    if spec.config.passwd.users.iter().any(|u| u.name.is_empty()) {
        return Err("passwd user has an empty name".to_string());
    }

    match spec.kernel_type.as_str() {
        "" | KERNEL_TYPE_DEFAULT | KERNEL_TYPE_REALTIME => {}
        other => {
            return Err(format!(
                "kernelType={} is invalid, must be one of \"{}\" or \"{}\"",
                other, KERNEL_TYPE_DEFAULT, KERNEL_TYPE_REALTIME
            ))
        }
    }

    if spec.extensions.iter().any(|e| e.trim().is_empty()) {
        return Err("extension names must not be empty".to_string());
    }

    Ok(())
}

fn is_v3(version: &str) -> bool {
    let mut parts = version.split('.');
    parts.next() == Some("3")
        && parts.clone().count() == 2
        && parts.all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}
