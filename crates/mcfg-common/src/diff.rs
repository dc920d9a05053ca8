//! Structural diff between two MachineConfig specs
//!
//! Used by the splice path to find which files changed between a pool's
//! applied config and a fresh render, and by the daemon to decide what a
//! node must do after applying a new config.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::MachineConfigSpec;
use crate::ignition::{File, IgnitionConfig};

/// Which parts of a MachineConfig changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineConfigDiff {
    /// OS image changed
    pub os_update: bool,
    /// Kernel arguments changed
    pub kargs: bool,
    /// FIPS mode changed
    pub fips: bool,
    /// Kernel type changed
    pub kernel_type: bool,
    /// Extension list changed
    pub extensions: bool,
    /// systemd units changed
    pub units: bool,
    /// Users or their SSH keys changed
    pub passwd: bool,
    /// Ignition content outside of files, units and users changed
    pub other: bool,
    /// Paths of files that were added, removed or modified
    pub files: BTreeSet<String>,
}

impl MachineConfigDiff {
    /// Compare two specs
    pub fn new(old: &MachineConfigSpec, new: &MachineConfigSpec) -> Self {
        Self {
            os_update: old.os_image_url != new.os_image_url,
            kargs: old.kernel_arguments != new.kernel_arguments,
            fips: old.fips != new.fips,
            kernel_type: normalized_kernel_type(&old.kernel_type)
                != normalized_kernel_type(&new.kernel_type),
            extensions: old.extensions != new.extensions,
            units: old.config.systemd != new.config.systemd,
            passwd: old.config.passwd != new.config.passwd,
            other: old.config.extra != new.config.extra
                || old.config.ignition.extra != new.config.ignition.extra
                || old.config.storage.extra != new.config.storage.extra,
            files: files_diff(&old.config, &new.config),
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        !self.has_non_file_changes() && !self.passwd && self.files.is_empty()
    }

    /// Whether anything besides file contents and users changed
    pub fn has_non_file_changes(&self) -> bool {
        self.os_update
            || self.kargs
            || self.fips
            || self.kernel_type
            || self.extensions
            || self.units
            || self.other
    }
}

/// Paths whose file entries differ between two Ignition documents.
///
/// A path is reported when it exists in only one document, or when its
/// contents, mode or overwrite flag differ.
pub fn files_diff(old: &IgnitionConfig, new: &IgnitionConfig) -> BTreeSet<String> {
    let old_files = index_files(old);
    let new_files = index_files(new);

    let mut changed: BTreeSet<String> = BTreeSet::new();
    for (path, old_file) in &old_files {
        match new_files.get(path) {
            Some(new_file) if new_file == old_file => {}
            _ => {
                changed.insert((*path).to_string());
            }
        }
    }
    for path in new_files.keys() {
        if !old_files.contains_key(path) {
            changed.insert((*path).to_string());
        }
    }
    changed
}

fn index_files(config: &IgnitionConfig) -> BTreeMap<&str, &File> {
    config
        .storage
        .files
        .iter()
        .map(|f| (f.path.as_str(), f))
        .collect()
}

fn normalized_kernel_type(kernel_type: &str) -> &str {
    if kernel_type.is_empty() {
        crate::crd::KERNEL_TYPE_DEFAULT
    } else {
        kernel_type
    }
}
