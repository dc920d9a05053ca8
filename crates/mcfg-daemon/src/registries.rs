//! Structural comparison of container registry configurations
//!
//! CRI-O reads `/etc/containers/registries.conf` on reload. Some edits to it
//! can be applied to a running node without evicting workloads; this module
//! decides which.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use mcfg_common::CONTAINER_REGISTRY_CONF_PATH;

/// Failure to read or parse a registries.conf
#[derive(Debug, Error)]
pub enum RegistriesError {
    /// The file could not be read from the config
    #[error("failed to get {which} registries.conf content: {message}")]
    Read {
        /// "old" or "new"
        which: &'static str,
        /// What went wrong
        message: String,
    },

    /// The file is not valid TOML for the registries schema
    #[error("failed decoding registries.conf TOML content: {source}")]
    Parse {
        /// Parse failure
        #[source]
        source: toml::de::Error,
    },
}

/// The parts of registries.conf (v2 format) that affect image resolution
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RegistriesConf {
    /// Registries tried, in order, for short image names
    #[serde(default)]
    pub unqualified_search_registries: Vec<String>,
    /// Per-registry settings
    #[serde(default, rename = "registry")]
    pub registries: Vec<Registry>,
}

/// One `[[registry]]` table
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Registry {
    /// Image name prefix this entry applies to; defaults to `location`
    #[serde(default)]
    pub prefix: String,
    /// Registry location
    #[serde(default)]
    pub location: String,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure: bool,
    /// Refuse pulls from this registry
    #[serde(default)]
    pub blocked: bool,
    /// Only use mirrors for digest references
    #[serde(default)]
    pub mirror_by_digest_only: bool,
    /// Mirrors tried before the registry itself
    #[serde(default, rename = "mirror")]
    pub mirrors: Vec<Endpoint>,
}

/// One `[[registry.mirror]]` table
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    /// Mirror location
    #[serde(default)]
    pub location: String,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure: bool,
}

impl Registry {
    /// The key the registry is matched by: its prefix, else its location
    pub fn scope(&self) -> &str {
        if self.prefix.is_empty() {
            &self.location
        } else {
            &self.prefix
        }
    }

    fn has_mirror(&self, location: &str) -> bool {
        self.mirrors.iter().any(|m| m.location == location)
    }
}

impl RegistriesConf {
    /// Parse registries.conf content
    pub fn parse(data: &[u8]) -> Result<Self, RegistriesError> {
        let text = String::from_utf8_lossy(data);
        toml::from_str(&text).map_err(|source| RegistriesError::Parse { source })
    }

    fn by_scope(&self) -> BTreeMap<&str, &Registry> {
        self.registries.iter().map(|r| (r.scope(), r)).collect()
    }
}

/// Whether going from `old` to `new` can be applied without a drain.
///
/// Safe changes are limited to adding mirrors under `mirror-by-digest-only`,
/// either to an existing registry that already has it or as a new registry
/// that sets it. Anything that changes where or whether tag references
/// resolve is unsafe.
pub fn is_safe_registries_change(old: &RegistriesConf, new: &RegistriesConf) -> bool {
    // Search order decides which registry a short name resolves to.
    if old.unqualified_search_registries != new.unqualified_search_registries {
        info!(
            path = CONTAINER_REGISTRY_CONF_PATH,
            old = ?old.unqualified_search_registries,
            new = ?new.unqualified_search_registries,
            "unqualified-search-registries changed"
        );
        return false;
    }

    let old_regs = old.by_scope();
    let new_regs = new.by_scope();

    if let Some(removed) = old_regs.keys().find(|scope| !new_regs.contains_key(*scope)) {
        info!(path = CONTAINER_REGISTRY_CONF_PATH, registry = %removed, "registry has been removed");
        return false;
    }

    for (scope, new_reg) in &new_regs {
        let Some(old_reg) = old_regs.get(scope) else {
            if !new_reg.mirror_by_digest_only {
                info!(
                    path = CONTAINER_REGISTRY_CONF_PATH,
                    registry = %scope,
                    "registry has been added with mirror-by-digest-only set to false"
                );
                return false;
            }
            continue;
        };

        if old_reg == new_reg {
            continue;
        }
        if let Some(field) = changed_field(old_reg, new_reg) {
            info!(
                path = CONTAINER_REGISTRY_CONF_PATH,
                registry = %scope,
                field,
                "registry setting changed"
            );
            return false;
        }

        if let Some(m) = old_reg.mirrors.iter().find(|m| !new_reg.has_mirror(&m.location)) {
            info!(
                path = CONTAINER_REGISTRY_CONF_PATH,
                registry = %scope,
                mirror = %m.location,
                "mirror has been removed"
            );
            return false;
        }

        if !new_reg.mirror_by_digest_only {
            if let Some(m) = new_reg.mirrors.iter().find(|m| !old_reg.has_mirror(&m.location)) {
                info!(
                    path = CONTAINER_REGISTRY_CONF_PATH,
                    registry = %scope,
                    mirror = %m.location,
                    "mirror has been added to a registry without mirror-by-digest-only"
                );
                return false;
            }
        }
    }

    info!(path = CONTAINER_REGISTRY_CONF_PATH, "changes made are safe to skip drain");
    true
}

/// First setting that must not change on a registry kept across configs
fn changed_field(old: &Registry, new: &Registry) -> Option<&'static str> {
    if old.prefix != new.prefix {
        Some("prefix")
    } else if old.location != new.location {
        Some("location")
    } else if old.blocked != new.blocked {
        Some("blocked")
    } else if old.insecure != new.insecure {
        Some("insecure")
    } else if old.mirror_by_digest_only != new.mirror_by_digest_only {
        Some("mirror-by-digest-only")
    } else {
        None
    }
}
