//! One-shot render of every pool from manifests on disk
//!
//! Used while installing a cluster, before there is an API server to watch.
//! Reads pools, MachineConfigs and the ControllerConfig from a directory of
//! YAML files and writes the rendered configs and updated pools back out.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::ResourceExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use mcfg_common::crd::{
    ControllerConfig, MachineConfig, MachineConfigPool, PoolConfiguration,
    MACHINE_CONFIG_KIND, MACHINE_CONFIG_POOL_KIND,
};
use mcfg_common::ControllerVersion;

use crate::error::RenderError;
use crate::render::generate_rendered_machine_config;
use crate::selector::{select_machine_configs, SelectorError};

const CONTROLLER_CONFIG_KIND: &str = "ControllerConfig";

/// Errors from the bootstrap render
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A pool's selector does not parse
    #[error("pool {pool}: invalid label selector: {source}")]
    Selector {
        /// Pool name
        pool: String,
        /// Parse failure
        source: SelectorError,
    },

    /// A pool selects no MachineConfig
    #[error("couldn't find any MachineConfigs for pool: {0}")]
    NoConfigs(String),

    /// Rendering a pool failed
    #[error("pool {pool}: {source}")]
    Render {
        /// Pool name
        pool: String,
        /// Render failure
        source: RenderError,
    },

    /// The manifests hold no ControllerConfig
    #[error("no ControllerConfig found in {0}")]
    MissingControllerConfig(PathBuf),

    /// Reading or writing a file failed
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying failure
        source: std::io::Error,
    },

    /// A manifest could not be parsed or an output serialized
    #[error("{path}: {source}")]
    Yaml {
        /// File involved
        path: PathBuf,
        /// Underlying failure
        source: serde_yaml::Error,
    },
}

/// Objects read from the manifest directory
#[derive(Debug, Default)]
pub struct Manifests {
    /// Every MachineConfigPool found
    pub pools: Vec<MachineConfigPool>,
    /// Every MachineConfig found
    pub configs: Vec<MachineConfig>,
    /// The ControllerConfig, if one was found
    pub controller_config: Option<ControllerConfig>,
}

/// Result of a bootstrap pass
#[derive(Debug, Default)]
pub struct BootstrapOutput {
    /// Pools targeting (and already at) their rendered config
    pub pools: Vec<MachineConfigPool>,
    /// One rendered config per pool
    pub configs: Vec<MachineConfig>,
}

/// Render every pool from a static snapshot.
///
/// Each pool's spec and status configuration point at its rendered config,
/// with the fragments it was rendered from as provenance. Fails on the first
/// pool that cannot be rendered.
pub fn run_bootstrap(
    pools: Vec<MachineConfigPool>,
    configs: &[MachineConfig],
    base: &ControllerConfig,
    version: &ControllerVersion,
) -> Result<BootstrapOutput, BootstrapError> {
    let configs: Vec<Arc<MachineConfig>> = configs.iter().cloned().map(Arc::new).collect();
    let mut output = BootstrapOutput::default();

    for mut pool in pools {
        let name = pool.name_any();
        let selected = select_machine_configs(pool.spec.machine_config_selector.as_ref(), &configs)
            .map_err(|source| BootstrapError::Selector {
                pool: name.clone(),
                source,
            })?;
        if selected.is_empty() {
            return Err(BootstrapError::NoConfigs(name));
        }

        let rendered = generate_rendered_machine_config(&pool, &selected, base, version)
            .map_err(|source| BootstrapError::Render {
                pool: name.clone(),
                source,
            })?;

        let configuration = PoolConfiguration {
            name: rendered.name(),
            source: rendered.source,
        };
        pool.spec.configuration = configuration.clone();
        pool.status.get_or_insert_with(Default::default).configuration = configuration;

        debug!(pool = %name, rendered = %rendered.config.name_any(), "bootstrap rendered pool");
        output.pools.push(pool);
        output.configs.push(rendered.config);
    }

    Ok(output)
}

/// Read every `.yaml`/`.yml` file in `dir`, keeping the kinds the render needs.
///
/// Files may hold several documents; documents of other kinds are skipped.
pub fn load_manifests(dir: &Path) -> Result<Manifests, BootstrapError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| BootstrapError::Io { path, source }
    };

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut manifests = Manifests::default();
    for path in paths {
        let contents = fs::read_to_string(&path).map_err(io_err(&path))?;
        let yaml_err = |source| BootstrapError::Yaml {
            path: path.clone(),
            source,
        };

        for document in serde_yaml::Deserializer::from_str(&contents) {
            let value = serde_yaml::Value::deserialize(document).map_err(yaml_err)?;
            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
            match kind {
                MACHINE_CONFIG_POOL_KIND => manifests
                    .pools
                    .push(serde_yaml::from_value(value).map_err(yaml_err)?),
                MACHINE_CONFIG_KIND => manifests
                    .configs
                    .push(serde_yaml::from_value(value).map_err(yaml_err)?),
                CONTROLLER_CONFIG_KIND => {
                    manifests.controller_config = Some(serde_yaml::from_value(value).map_err(yaml_err)?)
                }
                _ => debug!(path = %path.display(), kind, "skipping manifest"),
            }
        }
    }

    Ok(manifests)
}

/// Write each pool to `<dest>/machine-pools/` and each config to `<dest>/machine-configs/`
pub fn write_output(output: &BootstrapOutput, dest: &Path) -> Result<(), BootstrapError> {
    let pools_dir = dest.join("machine-pools");
    let configs_dir = dest.join("machine-configs");
    for dir in [&pools_dir, &configs_dir] {
        fs::create_dir_all(dir).map_err(|source| BootstrapError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    for pool in &output.pools {
        write_yaml(&pools_dir.join(format!("{}.yaml", pool.name_any())), pool)?;
    }
    for config in &output.configs {
        write_yaml(&configs_dir.join(format!("{}.yaml", config.name_any())), config)?;
    }

    info!(
        pools = output.pools.len(),
        configs = output.configs.len(),
        dest = %dest.display(),
        "bootstrap output written"
    );
    Ok(())
}

fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), BootstrapError> {
    let yaml = serde_yaml::to_string(value).map_err(|source| BootstrapError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, yaml).map_err(|source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load manifests from `manifests`, render every pool and write the result to `dest`
pub fn bootstrap_dir(
    manifests: &Path,
    dest: &Path,
    version: &ControllerVersion,
) -> Result<BootstrapOutput, BootstrapError> {
    let loaded = load_manifests(manifests)?;
    let base = loaded
        .controller_config
        .ok_or_else(|| BootstrapError::MissingControllerConfig(manifests.to_path_buf()))?;

    let output = run_bootstrap(loaded.pools, &loaded.configs, &base, version)?;
    write_output(&output, dest)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::tests::{base, fragment, pool, version};

    fn configs() -> Vec<MachineConfig> {
        vec![
            (*fragment("00-worker", "worker", &[("/etc/motd", "worker")])).clone(),
            (*fragment("00-master", "master", &[("/etc/motd", "master")])).clone(),
        ]
    }

    /// Story: the installer renders the initial worker and master configs
    /// before the cluster exists. Each pool gets its own config and records
    /// only its own fragments as provenance.
    #[test]
    fn story_every_pool_is_rendered_from_its_own_fragments() {
        let out = run_bootstrap(
            vec![pool("worker"), pool("master")],
            &configs(),
            &base(),
            &version(),
        )
        .unwrap();

        assert_eq!(out.pools.len(), 2);
        assert_eq!(out.configs.len(), 2);

        let worker = &out.pools[0];
        let target = worker.target_config_name().unwrap();
        assert!(target.starts_with("rendered-worker-"));
        assert_eq!(worker.current_config_name(), Some(target));

        let sources: Vec<_> = worker
            .target_source()
            .iter()
            .filter_map(|r| r.name.clone())
            .collect();
        assert_eq!(sources, vec!["00-worker"]);
    }

    #[test]
    fn pool_without_fragments_fails() {
        let err = run_bootstrap(vec![pool("infra")], &configs(), &base(), &version()).unwrap_err();
        assert!(matches!(err, BootstrapError::NoConfigs(p) if p == "infra"));
    }

    #[test]
    fn empty_selector_selects_nothing() {
        let mut greedy = pool("greedy");
        greedy.spec.machine_config_selector = Some(Default::default());
        let err = run_bootstrap(vec![greedy], &configs(), &base(), &version()).unwrap_err();
        assert!(matches!(err, BootstrapError::NoConfigs(_)));
    }

    #[test]
    fn round_trips_through_a_directory() {
        let manifests = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let mut docs = Vec::new();
        docs.push(serde_yaml::to_string(&pool("worker")).unwrap());
        for mc in configs() {
            docs.push(serde_yaml::to_string(&mc).unwrap());
        }
        fs::write(manifests.path().join("objects.yaml"), docs.join("---\n")).unwrap();
        fs::write(
            manifests.path().join("controllerconfig.yml"),
            serde_yaml::to_string(&base()).unwrap(),
        )
        .unwrap();
        fs::write(manifests.path().join("README.md"), "not a manifest").unwrap();

        let out = bootstrap_dir(manifests.path(), dest.path(), &version()).unwrap();
        let rendered = out.configs[0].name_any();

        let written = fs::read_to_string(
            dest.path()
                .join("machine-configs")
                .join(format!("{}.yaml", rendered)),
        )
        .unwrap();
        let parsed: MachineConfig = serde_yaml::from_str(&written).unwrap();
        assert_eq!(parsed.spec, out.configs[0].spec);
        assert!(dest.path().join("machine-pools/worker.yaml").exists());
    }

    #[test]
    fn missing_controller_config_is_reported() {
        let manifests = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(
            manifests.path().join("pool.yaml"),
            serde_yaml::to_string(&pool("worker")).unwrap(),
        )
        .unwrap();

        let err = bootstrap_dir(manifests.path(), dest.path(), &version()).unwrap_err();
        assert!(matches!(err, BootstrapError::MissingControllerConfig(_)));
    }
}
