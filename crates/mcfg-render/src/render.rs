//! Version Gate and Merge Engine
//!
//! Turns the MachineConfigs selected for a pool into a single rendered
//! MachineConfig named after the pool and a hash of its content.
//!
//! Rendering is refused (deferred) while the base settings or any input were
//! written by a different controller build, so two controller versions never
//! race to render the same pool during an upgrade.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, warn};

use mcfg_common::crd::{
    ControllerConfig, MachineConfig, MachineConfigPool, MachineConfigSpec, API_VERSION,
    KERNEL_TYPE_DEFAULT, KERNEL_TYPE_REALTIME, MACHINE_CONFIG_KIND, MACHINE_CONFIG_POOL_KIND,
};
use mcfg_common::ignition::{merge_extra, File, IgnitionConfig, Unit};
use mcfg_common::kube_utils::content_hash;
use mcfg_common::{
    ControllerVersion, GENERATED_BY_CONTROLLER_VERSION_ANNOTATION,
    GENERATED_BY_VERSION_ANNOTATION, OS_IMAGE_URL_OVERRIDDEN_ANNOTATION,
    RELEASE_IMAGE_VERSION_ANNOTATION, RENDERED_PREFIX,
};

use crate::error::RenderError;
use crate::validate::validate_machine_config;

/// Output of a successful render
#[derive(Clone, Debug)]
pub struct RenderedConfig {
    /// The generated MachineConfig, ready to create
    pub config: MachineConfig,
    /// References to the fragments it was merged from, in merge order
    pub source: Vec<ObjectReference>,
    /// Whether the merged OS image differs from the base settings default
    pub os_image_overridden: bool,
}

impl RenderedConfig {
    /// Name of the generated MachineConfig
    pub fn name(&self) -> String {
        self.config.name_any()
    }
}

/// Refuse to render with inputs produced by another controller build.
///
/// The base settings must carry `generated-by-version` equal to our raw
/// version. Fragments that carry `generated-by-controller-version` must carry
/// our hash; fragments without it (user-authored) are accepted.
pub fn check_version_gate(
    base: &ControllerConfig,
    configs: &[Arc<MachineConfig>],
    version: &ControllerVersion,
) -> Result<(), RenderError> {
    match base.annotations().get(GENERATED_BY_VERSION_ANNOTATION) {
        Some(generated) if *generated == version.raw => {}
        Some(generated) => {
            return Err(RenderError::deferred(format!(
                "ignoring controller config generated from {} (my version: {})",
                generated, version.raw
            )))
        }
        None => {
            return Err(RenderError::deferred(format!(
                "ignoring controller config generated without {} annotation (my version: {})",
                GENERATED_BY_VERSION_ANNOTATION, version.raw
            )))
        }
    }

    for mc in configs {
        if let Some(generated) = mc.annotation(GENERATED_BY_CONTROLLER_VERSION_ANNOTATION) {
            if generated != version.hash {
                return Err(RenderError::deferred(format!(
                    "ignoring MachineConfig {} generated by controller {} (my version: {})",
                    mc.name_any(),
                    generated,
                    version.hash
                )));
            }
        }
    }

    Ok(())
}

/// Merge MachineConfig specs into one.
///
/// Inputs are merged in name order regardless of the order given. Files and
/// units are keyed by path and name, with later fragments winning. Users are
/// keyed by name with their SSH keys combined, and the remaining Ignition
/// sections are merged with [`merge_extra`]. The OS image starts at
/// `base_os_image_url` and is replaced by any fragment that sets one.
pub fn merge_machine_configs(
    configs: &[Arc<MachineConfig>],
    base_os_image_url: &str,
) -> MachineConfigSpec {
    let mut sorted: Vec<&Arc<MachineConfig>> = configs.iter().collect();
    sorted.sort_by_key(|mc| mc.name_any());

    let mut files: BTreeMap<String, File> = BTreeMap::new();
    let mut units: BTreeMap<String, Unit> = BTreeMap::new();
    let mut kernel_arguments = Vec::new();
    let mut extensions = Vec::new();
    let mut seen_extensions = BTreeSet::new();
    let mut fips = false;
    let mut realtime = false;
    let mut os_image_url = base_os_image_url.to_string();
    let mut config = IgnitionConfig::empty();

    for mc in sorted {
        let spec = &mc.spec;
        merge_extra(&mut config.extra, &spec.config.extra);
        merge_extra(&mut config.ignition.extra, &spec.config.ignition.extra);
        merge_extra(&mut config.storage.extra, &spec.config.storage.extra);
        merge_extra(&mut config.systemd.extra, &spec.config.systemd.extra);
        config.passwd.merge(&spec.config.passwd);
        for file in &spec.config.storage.files {
            files.insert(file.path.clone(), file.clone());
        }
        for unit in &spec.config.systemd.units {
            units.insert(unit.name.clone(), unit.clone());
        }
        kernel_arguments.extend(spec.kernel_arguments.iter().cloned());
        for ext in &spec.extensions {
            if seen_extensions.insert(ext.clone()) {
                extensions.push(ext.clone());
            }
        }
        fips |= spec.fips;
        realtime |= spec.kernel_type == KERNEL_TYPE_REALTIME;
        if !spec.os_image_url.is_empty() {
            os_image_url = spec.os_image_url.clone();
        }
    }

    config.storage.files = files.into_values().collect();
    config.systemd.units = units.into_values().collect();

    MachineConfigSpec {
        os_image_url,
        config,
        kernel_arguments,
        extensions,
        fips,
        kernel_type: if realtime {
            KERNEL_TYPE_REALTIME
        } else {
            KERNEL_TYPE_DEFAULT
        }
        .to_string(),
    }
}

/// `<prefix><pool>-<hash>` for a merged spec
pub fn hashed_name(
    prefix: &str,
    pool_name: &str,
    spec: &MachineConfigSpec,
) -> Result<String, RenderError> {
    let canonical = serde_json::to_vec(spec)
        .map_err(|e| RenderError::invalid(format!("failed to serialize merged config: {}", e)))?;
    Ok(format!("{}{}-{}", prefix, pool_name, content_hash(&canonical)))
}

/// Controller owner reference pointing at `pool`
pub fn pool_owner_reference(pool: &MachineConfigPool) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: MACHINE_CONFIG_POOL_KIND.to_string(),
        name: pool.name_any(),
        uid: pool.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Provenance list for a set of fragments, in name order
pub fn source_references(configs: &[Arc<MachineConfig>]) -> Vec<ObjectReference> {
    let mut names: Vec<String> = configs.iter().map(|mc| mc.name_any()).collect();
    names.sort();
    names
        .into_iter()
        .map(|name| ObjectReference {
            api_version: Some(API_VERSION.to_string()),
            kind: Some(MACHINE_CONFIG_KIND.to_string()),
            name: Some(name),
            ..Default::default()
        })
        .collect()
}

/// Release version to stamp on generated configs.
///
/// Taken from the base settings, falling back to the version that wrote them.
pub fn release_version(base: &ControllerConfig) -> String {
    let annotations = base.annotations();
    annotations
        .get(RELEASE_IMAGE_VERSION_ANNOTATION)
        .or_else(|| annotations.get(GENERATED_BY_VERSION_ANNOTATION))
        .cloned()
        .unwrap_or_default()
}

/// Render the MachineConfig for `pool` from its selected fragments.
///
/// Runs the version gate, validates every fragment, merges, and stamps the
/// result with its owner, controller version and release version.
pub fn generate_rendered_machine_config(
    pool: &MachineConfigPool,
    configs: &[Arc<MachineConfig>],
    base: &ControllerConfig,
    version: &ControllerVersion,
) -> Result<RenderedConfig, RenderError> {
    check_version_gate(base, configs, version)?;

    if base.spec.os_image_url.is_empty() {
        warn!(pool = %pool.name_any(), "no base OS image set in ControllerConfig");
    }

    for mc in configs {
        validate_machine_config(&mc.spec).map_err(|reason| {
            RenderError::invalid(format!("invalid MachineConfig {}: {}", mc.name_any(), reason))
        })?;
    }

    let spec = merge_machine_configs(configs, &base.spec.os_image_url);
    let name = hashed_name(RENDERED_PREFIX, &pool.name_any(), &spec)?;
    let os_image_overridden = spec.os_image_url != base.spec.os_image_url;

    let mut annotations = BTreeMap::from([
        (
            GENERATED_BY_CONTROLLER_VERSION_ANNOTATION.to_string(),
            version.hash.clone(),
        ),
        (
            RELEASE_IMAGE_VERSION_ANNOTATION.to_string(),
            release_version(base),
        ),
    ]);
    if os_image_overridden {
        annotations.insert(
            OS_IMAGE_URL_OVERRIDDEN_ANNOTATION.to_string(),
            "true".to_string(),
        );
    }

    debug!(
        pool = %pool.name_any(),
        rendered = %name,
        fragments = configs.len(),
        "merged machine configs"
    );

    let config = MachineConfig {
        metadata: ObjectMeta {
            name: Some(name),
            owner_references: Some(vec![pool_owner_reference(pool)]),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec,
    };

    Ok(RenderedConfig {
        config,
        source: source_references(configs),
        os_image_overridden,
    })
}
