//! Kubernetes helpers shared by the controllers
//!
//! Client construction, polling, CRD readiness and content hashing.

use std::fmt::Write as _;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, trace};

use crate::Error;

/// Connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until `check_fn` returns `Ok(true)` or `timeout` elapses.
///
/// Errors returned by `check_fn` are treated as "not yet" and polling
/// continues. On timeout an internal error carrying `timeout_msg` is returned.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("poll condition not yet met"),
            Err(e) => trace!(error = %e, "poll check failed, retrying"),
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the in-cluster or default kubeconfig is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Whether a CRD with the given name is installed
pub async fn crd_exists(client: &Client, crd_name: &str) -> Result<bool, Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    Ok(crds.get_opt(crd_name).await?.is_some())
}

/// Wait until a CRD is installed
pub async fn wait_for_crd(client: &Client, crd_name: &str, timeout: Duration) -> Result<(), Error> {
    debug!(crd = crd_name, "waiting for CRD");
    poll_until(
        timeout,
        Duration::from_secs(2),
        format!("timed out waiting for CRD {}", crd_name),
        || async move { crd_exists(client, crd_name).await },
    )
    .await
}

/// Merge-patch the status sub-resource of a cluster-scoped object.
pub async fn patch_cluster_status<T>(
    client: &Client,
    name: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> Result<T, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(field_manager),
        &Patch::Merge(&patch),
    )
    .await
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, data);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// First 32 hex characters of the SHA-256 of `data`.
///
/// Used for generated object names, which must stay stable across releases.
pub fn content_hash(data: &[u8]) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(32);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn sha256_of_empty_input_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_hash_is_stable_and_truncated() {
        let a = content_hash(b"rendered");
        assert_eq!(a.len(), 32);
        assert_eq!(a, content_hash(b"rendered"));
        assert_ne!(a, content_hash(b"rendered "));
    }

    #[tokio::test]
    async fn poll_until_returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            "never",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n >= 3) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_with_message() {
        let result = poll_until(
            Duration::from_secs(30),
            Duration::from_secs(10),
            "drain did not finish",
            || async { Err(Error::internal("still evicting")) },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("drain did not finish"));
    }
}
