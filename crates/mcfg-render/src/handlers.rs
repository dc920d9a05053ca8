//! Change notifications to pool keys
//!
//! Watch events never trigger work directly. They only decide which pools
//! need another sync and put those pool names on the queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, error};

use mcfg_common::crd::{MachineConfig, MachineConfigPool, MACHINE_CONFIG_POOL_KIND};

use crate::queue::WorkQueue;
use crate::selector::{PoolSelector, SelectorError};
use crate::store::ConfigLister;

/// Why a MachineConfig could not be routed to any pool
#[derive(Debug, Error)]
pub enum RouteError {
    /// Without labels no selector can ever match
    #[error("no MachineConfigPool found for MachineConfig {config} because it has no labels")]
    NoLabels {
        /// MachineConfig name
        config: String,
    },

    /// Some pool's selector does not parse
    #[error("invalid label selector: {0}")]
    InvalidSelector(#[from] SelectorError),

    /// No pool selects the MachineConfig
    #[error("could not find any MachineConfigPool set for MachineConfig {config} with labels: {labels:?}")]
    NoPools {
        /// MachineConfig name
        config: String,
        /// Its labels
        labels: BTreeMap<String, String>,
    },
}

/// Routes watch events to the render queue
#[derive(Clone)]
pub struct Handlers {
    lister: Arc<dyn ConfigLister>,
    queue: WorkQueue<String>,
    render_delay: Duration,
}

impl Handlers {
    /// Create handlers feeding `queue`; every enqueue waits `render_delay`
    pub fn new(lister: Arc<dyn ConfigLister>, queue: WorkQueue<String>, render_delay: Duration) -> Self {
        Self {
            lister,
            queue,
            render_delay,
        }
    }

    fn enqueue(&self, pool: &str) {
        self.queue.add_after(pool.to_string(), self.render_delay);
    }

    /// Handle one event from the pool watcher
    pub fn on_pool_event(&self, event: &Event<MachineConfigPool>) {
        match event {
            Event::Apply(pool) | Event::InitApply(pool) => {
                debug!(pool = %pool.name_any(), "MachineConfigPool changed");
                self.enqueue(&pool.name_any());
            }
            Event::Delete(pool) => {
                debug!(pool = %pool.name_any(), "MachineConfigPool deleted");
            }
            Event::Init | Event::InitDone => {}
        }
    }

    /// Handle one event from the MachineConfig watcher
    pub fn on_machine_config_event(&self, event: &Event<MachineConfig>) {
        match event {
            Event::Apply(mc) | Event::InitApply(mc) => {
                let what = if mc.is_deleting() { "deleted" } else { "changed" };
                self.machine_config_changed(mc, what);
            }
            Event::Delete(mc) => self.machine_config_changed(mc, "deleted"),
            Event::Init | Event::InitDone => {}
        }
    }

    fn machine_config_changed(&self, mc: &MachineConfig, what: &str) {
        if let Some(pool) = mc
            .controller_ref()
            .and_then(|owner| self.resolve_controller_ref(owner))
        {
            debug!(config = %mc.name_any(), pool = %pool, "MachineConfig {}", what);
            self.enqueue(&pool);
            return;
        }

        match self.pools_for_machine_config(mc) {
            Ok(pools) => {
                debug!(config = %mc.name_any(), pools = ?pools, "MachineConfig {}", what);
                for pool in pools {
                    self.enqueue(&pool);
                }
            }
            Err(e) => error!(
                config = %mc.name_any(),
                error = %e,
                "error finding pools for MachineConfig"
            ),
        }
    }

    /// Pool named by a controller owner reference, if it still exists with that uid
    fn resolve_controller_ref(&self, owner: &OwnerReference) -> Option<String> {
        if owner.kind != MACHINE_CONFIG_POOL_KIND {
            return None;
        }
        let pool = self.lister.get_pool(&owner.name)?;
        if pool.uid().as_deref() != Some(owner.uid.as_str()) {
            return None;
        }
        Some(pool.name_any())
    }

    /// Pools whose non-empty selector matches the MachineConfig's labels
    pub fn pools_for_machine_config(&self, mc: &MachineConfig) -> Result<Vec<String>, RouteError> {
        let labels = mc.label_map();
        if labels.is_empty() {
            return Err(RouteError::NoLabels {
                config: mc.name_any(),
            });
        }

        let mut pools = Vec::new();
        for pool in self.lister.list_pools() {
            let selector = PoolSelector::from_field(pool.spec.machine_config_selector.as_ref())?;
            if selector.matches(labels) {
                pools.push(pool.name_any());
            }
        }

        if pools.is_empty() {
            return Err(RouteError::NoPools {
                config: mc.name_any(),
                labels: labels.clone(),
            });
        }
        Ok(pools)
    }
}
