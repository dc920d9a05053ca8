//! Deciding whether a node must be drained, and driving the drain
//!
//! The daemon never evicts pods itself. It records the drain it wants in the
//! node's `desiredDrain` annotation and waits for the controller to echo the
//! same value into `lastAppliedDrain`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use mcfg_common::crd::ControlPlaneTopology;
use mcfg_common::events::{actions, reasons, EventPublisher};
use mcfg_common::kube_utils::poll_until;
use mcfg_common::metrics::set_drain_err;
use mcfg_common::retry::{retry_with_backoff, RetryConfig};
use mcfg_common::CONTAINER_REGISTRY_CONF_PATH;

use crate::actions::PostConfigChangeAction;
use crate::registries::{is_safe_registries_change, RegistriesConf, RegistriesError};

/// Node annotation naming the config the node should apply
pub const DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";

/// Node annotation carrying the drain the daemon asks for
pub const DESIRED_DRAINER_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredDrain";

/// Node annotation carrying the drain the controller last completed
pub const LAST_APPLIED_DRAINER_ANNOTATION: &str =
    "machineconfiguration.openshift.io/lastAppliedDrain";

/// How often the node is re-read while waiting for a drain
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long to wait for a drain before giving up
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const FIELD_MANAGER: &str = "machine-config-daemon";

/// Errors from drain decisions and drains
#[derive(Debug, Error)]
pub enum DrainError {
    /// registries.conf could not be compared
    #[error(transparent)]
    Registries(#[from] RegistriesError),

    /// The node has no desired config to drain for
    #[error("node {node} has no {} annotation", DESIRED_CONFIG_ANNOTATION)]
    MissingDesiredConfig {
        /// Node name
        node: String,
    },

    /// The controller did not finish the drain in time
    #[error("failed to drain node: {node} after {}. Please see machine-config-controller logs for more information", describe_timeout(.timeout))]
    Timeout {
        /// Node name
        node: String,
        /// How long we waited
        timeout: Duration,
    },

    /// Reading or annotating the node failed
    #[error(transparent)]
    Node(#[from] mcfg_common::Error),
}

fn describe_timeout(timeout: &Duration) -> String {
    match timeout.as_secs() {
        3600 => "1 hour".to_string(),
        s if s % 3600 == 0 => format!("{} hours", s / 3600),
        s => format!("{} seconds", s),
    }
}

/// Read a file from one side of a config change.
///
/// `Ok(None)` means the file does not exist on that side.
pub type ReadFile<'a> = &'a dyn Fn(&str) -> Result<Option<Vec<u8>>, mcfg_common::Error>;

/// Decide whether applying a change requires draining the node.
///
/// A reboot always drains. A CRI-O reload drains only when registries.conf
/// changed in a way [`is_safe_registries_change`] rejects. A change needing
/// no action never drains. Anything else drains.
pub fn is_drain_required(
    actions: &[PostConfigChangeAction],
    diff_file_set: &BTreeSet<String>,
    read_old: ReadFile<'_>,
    read_new: ReadFile<'_>,
) -> Result<bool, DrainError> {
    if actions.contains(&PostConfigChangeAction::Reboot) {
        return Ok(true);
    }
    if actions.contains(&PostConfigChangeAction::ReloadCrio) {
        if !diff_file_set.contains(CONTAINER_REGISTRY_CONF_PATH) {
            return Ok(false);
        }
        let old = read_registries(read_old, "old")?;
        let new = read_registries(read_new, "new")?;
        return Ok(!is_safe_registries_change(&old, &new));
    }
    if actions.contains(&PostConfigChangeAction::None) {
        return Ok(false);
    }
    Ok(true)
}

/// A missing registries.conf reads as an empty configuration
fn read_registries(read: ReadFile<'_>, which: &'static str) -> Result<RegistriesConf, DrainError> {
    let data = read(CONTAINER_REGISTRY_CONF_PATH).map_err(|e| RegistriesError::Read {
        which,
        message: e.to_string(),
    })?;
    match data {
        Some(data) => Ok(RegistriesConf::parse(&data)?),
        None => Ok(RegistriesConf::default()),
    }
}

/// Node operations the drain needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DrainActuator: Send + Sync {
    /// Current annotations of the node
    async fn node_annotations(&self, node: &str) -> Result<BTreeMap<String, String>, mcfg_common::Error>;

    /// Ask the controller to drain the node by setting its desired drainer
    async fn set_desired_drainer(&self, node: &str, drainer: &str) -> Result<(), mcfg_common::Error>;
}

/// [`DrainActuator`] that talks to the API server
pub struct KubeDrainActuator {
    client: Client,
}

impl KubeDrainActuator {
    /// Create an actuator using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DrainActuator for KubeDrainActuator {
    async fn node_annotations(&self, node: &str) -> Result<BTreeMap<String, String>, mcfg_common::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(node).await?.annotations().clone())
    }

    async fn set_desired_drainer(&self, node: &str, drainer: &str) -> Result<(), mcfg_common::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let annotations = BTreeMap::from([(DESIRED_DRAINER_ANNOTATION, drainer)]);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Timing of [`perform_drain`]
#[derive(Clone, Copy, Debug)]
pub struct DrainOptions {
    /// Delay between node reads
    pub poll_interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            poll_interval: DRAIN_POLL_INTERVAL,
            timeout: DRAIN_TIMEOUT,
        }
    }
}

/// How a drain request ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Single-node clusters have nowhere to move pods to
    NotRequired,
    /// The drain for the desired config had already completed
    AlreadyDrained,
    /// The controller drained the node
    Drained,
}

/// Request a drain of `node` for its desired config and wait for it.
///
/// Emits `Cordon` and `Drain` events when the request is made and a
/// `FailedToDrain` warning on timeout. The `mcd_drain_err` gauge tracks the
/// result.
pub async fn perform_drain(
    actuator: &dyn DrainActuator,
    events: &dyn EventPublisher,
    node_ref: &ObjectReference,
    node: &str,
    topology: ControlPlaneTopology,
    options: DrainOptions,
) -> Result<DrainOutcome, DrainError> {
    if topology == ControlPlaneTopology::SingleReplica {
        info!(node, "drain not required, skipping");
        events
            .publish(
                node_ref,
                EventType::Normal,
                reasons::DRAIN,
                actions::DRAIN,
                Some("Drain not required, skipping".to_string()),
            )
            .await;
        return Ok(DrainOutcome::NotRequired);
    }

    let annotations = actuator.node_annotations(node).await?;
    let desired_config =
        annotations
            .get(DESIRED_CONFIG_ANNOTATION)
            .ok_or_else(|| DrainError::MissingDesiredConfig {
                node: node.to_string(),
            })?;
    let drainer = format!("drain-{}", desired_config);

    if annotations.get(LAST_APPLIED_DRAINER_ANNOTATION) == Some(&drainer) {
        info!(node, drainer = %drainer, "drain is already completed on this node");
        set_drain_err(node, false);
        return Ok(DrainOutcome::AlreadyDrained);
    }

    info!(node, drainer = %drainer, "update prepared; requesting cordon and drain");
    let start = Instant::now();
    events
        .publish(
            node_ref,
            EventType::Normal,
            reasons::CORDON,
            actions::DRAIN,
            Some("Cordoned node to apply update".to_string()),
        )
        .await;
    events
        .publish(
            node_ref,
            EventType::Normal,
            reasons::DRAIN,
            actions::DRAIN,
            Some("Draining node to update config.".to_string()),
        )
        .await;

    retry_with_backoff(&RetryConfig::default(), "set desired drainer", || {
        actuator.set_desired_drainer(node, &drainer)
    })
    .await?;

    let waited = poll_until(
        options.timeout,
        options.poll_interval,
        format!("drain of node {} did not complete", node),
        move || async move {
            match actuator.node_annotations(node).await {
                Ok(a) => Ok(a.get(DESIRED_DRAINER_ANNOTATION)
                    == a.get(LAST_APPLIED_DRAINER_ANNOTATION)),
                Err(e) => {
                    warn!(node, error = %e, "failed to get node");
                    Ok(false)
                }
            }
        },
    )
    .await;

    if waited.is_err() {
        let err = DrainError::Timeout {
            node: node.to_string(),
            timeout: options.timeout,
        };
        events
            .publish(
                node_ref,
                EventType::Warning,
                reasons::FAILED_TO_DRAIN,
                actions::DRAIN,
                Some(err.to_string()),
            )
            .await;
        set_drain_err(node, true);
        return Err(err);
    }

    info!(
        node,
        seconds = start.elapsed().as_secs_f64(),
        "drain complete"
    );
    set_drain_err(node, false);
    Ok(DrainOutcome::Drained)
}

/// Drain `node` for a config change if the change needs it.
///
/// Returns `Ok(None)` without touching the node when [`is_drain_required`]
/// says the change can be applied in place.
#[allow(clippy::too_many_arguments)]
pub async fn drain_if_required(
    actions: &[PostConfigChangeAction],
    diff_file_set: &BTreeSet<String>,
    read_old: ReadFile<'_>,
    read_new: ReadFile<'_>,
    actuator: &dyn DrainActuator,
    events: &dyn EventPublisher,
    node_ref: &ObjectReference,
    node: &str,
    topology: ControlPlaneTopology,
    options: DrainOptions,
) -> Result<Option<DrainOutcome>, DrainError> {
    if !is_drain_required(actions, diff_file_set, read_old, read_new)? {
        info!(node, "changes do not require drain, skipping");
        return Ok(None);
    }
    perform_drain(actuator, events, node_ref, node, topology, options)
        .await
        .map(Some)
}
