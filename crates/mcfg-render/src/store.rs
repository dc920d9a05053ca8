//! Access to MachineConfigs, pools and the ControllerConfig
//!
//! Reads go through [`ConfigLister`], a view over the local watch caches that
//! may lag behind the API server. Writes go through [`ConfigWriter`] straight
//! to the API server. Cached objects are shared; callers clone before
//! mutating.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use mcfg_common::crd::{ControllerConfig, MachineConfig, MachineConfigPool};
use mcfg_common::kube_utils::patch_cluster_status;
use mcfg_common::Error;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "machine-config-controller";

/// Read-only view of cached objects
pub trait ConfigLister: Send + Sync {
    /// A pool by name
    fn get_pool(&self, name: &str) -> Option<Arc<MachineConfigPool>>;

    /// Every pool
    fn list_pools(&self) -> Vec<Arc<MachineConfigPool>>;

    /// A MachineConfig by name
    fn get_machine_config(&self, name: &str) -> Option<Arc<MachineConfig>>;

    /// Every MachineConfig
    fn list_machine_configs(&self) -> Vec<Arc<MachineConfig>>;

    /// A ControllerConfig by name
    fn get_controller_config(&self, name: &str) -> Option<Arc<ControllerConfig>>;
}

/// Writes against the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigWriter: Send + Sync {
    /// Create a MachineConfig.
    ///
    /// Returns `Ok(false)` if one with the same name already exists.
    async fn create_machine_config(&self, config: &MachineConfig) -> Result<bool, Error>;

    /// Create the MachineConfig, or update it if it drifted from `config`.
    ///
    /// Returns whether anything was written.
    async fn apply_machine_config(&self, config: &MachineConfig) -> Result<bool, Error>;

    /// Replace the pool's spec
    async fn update_pool(&self, pool: &MachineConfigPool) -> Result<MachineConfigPool, Error>;

    /// Write the pool's status conditions
    async fn update_pool_status(&self, pool: &MachineConfigPool) -> Result<(), Error>;
}

/// Bring `existing` in line with `required`.
///
/// Labels and annotations of `required` are added or overwritten, extra keys
/// on `existing` are kept. Owner references and spec are replaced when they
/// differ. Returns whether `existing` changed.
pub fn ensure_machine_config(existing: &mut MachineConfig, required: &MachineConfig) -> bool {
    let mut modified = false;

    modified |= merge_map(&mut existing.metadata.labels, &required.metadata.labels);
    modified |= merge_map(
        &mut existing.metadata.annotations,
        &required.metadata.annotations,
    );

    if required.metadata.owner_references.is_some()
        && existing.metadata.owner_references != required.metadata.owner_references
    {
        existing.metadata.owner_references = required.metadata.owner_references.clone();
        modified = true;
    }

    if existing.spec != required.spec {
        existing.spec = required.spec.clone();
        modified = true;
    }

    modified
}

fn merge_map(
    existing: &mut Option<BTreeMap<String, String>>,
    required: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(required) = required else {
        return false;
    };
    let existing = existing.get_or_insert_with(BTreeMap::new);
    let mut modified = false;
    for (k, v) in required {
        if existing.get(k) != Some(v) {
            existing.insert(k.clone(), v.clone());
            modified = true;
        }
    }
    modified
}

/// [`ConfigLister`] over kube-runtime reflector stores
#[derive(Clone)]
pub struct ReflectorLister {
    pools: Store<MachineConfigPool>,
    configs: Store<MachineConfig>,
    controller_configs: Store<ControllerConfig>,
}

impl ReflectorLister {
    /// Wrap the three reflector readers
    pub fn new(
        pools: Store<MachineConfigPool>,
        configs: Store<MachineConfig>,
        controller_configs: Store<ControllerConfig>,
    ) -> Self {
        Self {
            pools,
            configs,
            controller_configs,
        }
    }

    /// Wait until every store has received its initial list
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        let not_ready =
            |e: kube::runtime::reflector::store::WriterDropped| {
                Error::internal_with_context("cache sync", e.to_string())
            };
        self.pools.wait_until_ready().await.map_err(not_ready)?;
        self.configs.wait_until_ready().await.map_err(not_ready)?;
        self.controller_configs
            .wait_until_ready()
            .await
            .map_err(not_ready)?;
        Ok(())
    }
}

impl ConfigLister for ReflectorLister {
    fn get_pool(&self, name: &str) -> Option<Arc<MachineConfigPool>> {
        self.pools.get(&ObjectRef::new(name))
    }

    fn list_pools(&self) -> Vec<Arc<MachineConfigPool>> {
        self.pools.state()
    }

    fn get_machine_config(&self, name: &str) -> Option<Arc<MachineConfig>> {
        self.configs.get(&ObjectRef::new(name))
    }

    fn list_machine_configs(&self) -> Vec<Arc<MachineConfig>> {
        self.configs.state()
    }

    fn get_controller_config(&self, name: &str) -> Option<Arc<ControllerConfig>> {
        self.controller_configs.get(&ObjectRef::new(name))
    }
}

/// [`ConfigWriter`] backed by the API server
pub struct KubeConfigWriter {
    client: Client,
}

impl KubeConfigWriter {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machine_configs(&self) -> Api<MachineConfig> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ConfigWriter for KubeConfigWriter {
    async fn create_machine_config(&self, config: &MachineConfig) -> Result<bool, Error> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.machine_configs().create(&pp, config).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = Error::from(e);
                if err.is_conflict() {
                    debug!(name = %config.name_any(), "MachineConfig already exists");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn apply_machine_config(&self, config: &MachineConfig) -> Result<bool, Error> {
        let api = self.machine_configs();
        let name = config.name_any();

        let Some(mut existing) = api.get_opt(&name).await? else {
            return self.create_machine_config(config).await;
        };

        if !ensure_machine_config(&mut existing, config) {
            return Ok(false);
        }

        debug!(name = %name, "MachineConfig drifted, updating");
        api.replace(&name, &PostParams::default(), &existing).await?;
        Ok(true)
    }

    async fn update_pool(&self, pool: &MachineConfigPool) -> Result<MachineConfigPool, Error> {
        let api: Api<MachineConfigPool> = Api::all(self.client.clone());
        Ok(api
            .replace(&pool.name_any(), &PostParams::default(), pool)
            .await?)
    }

    async fn update_pool_status(&self, pool: &MachineConfigPool) -> Result<(), Error> {
        let conditions = pool.conditions();
        patch_cluster_status::<MachineConfigPool>(
            &self.client,
            &pool.name_any(),
            &serde_json::json!({ "conditions": conditions }),
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}
