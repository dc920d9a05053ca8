//! Splice Engine: sensitive file changes that bypass a paused pool
//!
//! A pool may be paused for unrelated reasons while the cluster rotates the
//! kubelet CA bundle. Nodes that never receive the new bundle eventually stop
//! trusting the API server, so that one file is allowed through: the pool's
//! applied config plus the new bundle becomes a "spliced" config the pool
//! can roll out without picking up anything else that changed.

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use mcfg_common::crd::{MachineConfig, MachineConfigPool};
use mcfg_common::diff::files_diff;
use mcfg_common::{
    ControllerVersion, GENERATED_BY_CONTROLLER_VERSION_ANNOTATION, PAUSE_BYPASS_ANNOTATION,
    PAUSE_BYPASS_FILES, RELEASE_IMAGE_VERSION_ANNOTATION, SPLICED_PREFIX,
};

use crate::error::RenderError;
use crate::render::{hashed_name, pool_owner_reference};

/// A spliced config and the allow-listed paths it carries over
#[derive(Clone, Debug)]
pub struct SplicedConfig {
    /// The spliced MachineConfig
    pub config: MachineConfig,
    /// Allow-listed paths whose content was taken from the candidate
    pub spliced_files: Vec<String>,
}

impl SplicedConfig {
    /// Name of the spliced MachineConfig
    pub fn name(&self) -> String {
        self.config.name_any()
    }
}

/// Build the spliced config for a paused pool, if one is needed.
///
/// `current` is the config the pool has applied and `candidate` the fresh
/// render. Returns `Ok(None)` when no allow-listed file differs between them.
/// Otherwise only the allow-listed changes are applied on top of `current`;
/// every other difference stays held back by the pause.
pub fn splice_paused_pool(
    pool: &MachineConfigPool,
    current: &MachineConfig,
    candidate: &MachineConfig,
    version: &ControllerVersion,
) -> Result<Option<SplicedConfig>, RenderError> {
    let changed = files_diff(&current.spec.config, &candidate.spec.config);
    let sensitive: Vec<String> = changed
        .into_iter()
        .filter(|path| PAUSE_BYPASS_FILES.contains(&path.as_str()))
        .collect();

    if sensitive.is_empty() {
        return Ok(None);
    }

    let mut spec = current.spec.clone();
    for path in &sensitive {
        match candidate.spec.config.file(path) {
            Some(file) => spec.config.upsert_file(file.clone()),
            None => {
                spec.config.remove_file(path);
            }
        }
    }
    spec.config.storage.files.sort_by(|a, b| a.path.cmp(&b.path));

    let name = hashed_name(SPLICED_PREFIX, &pool.name_any(), &spec)?;

    let mut annotations = BTreeMap::from([
        (
            GENERATED_BY_CONTROLLER_VERSION_ANNOTATION.to_string(),
            version.hash.clone(),
        ),
        (PAUSE_BYPASS_ANNOTATION.to_string(), "true".to_string()),
    ]);
    if let Some(release) = current.annotation(RELEASE_IMAGE_VERSION_ANNOTATION) {
        annotations.insert(
            RELEASE_IMAGE_VERSION_ANNOTATION.to_string(),
            release.to_string(),
        );
    }

    debug!(
        pool = %pool.name_any(),
        spliced = %name,
        files = ?sensitive,
        "splicing allow-listed files into paused pool"
    );

    Ok(Some(SplicedConfig {
        config: MachineConfig {
            metadata: ObjectMeta {
                name: Some(name),
                owner_references: Some(vec![pool_owner_reference(pool)]),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec,
        },
        spliced_files: sensitive,
    }))
}
