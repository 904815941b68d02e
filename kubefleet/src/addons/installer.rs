use std::collections::HashMap;

use kubefleet_apis::ResourceKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::charts;
use crate::{
    client::{ClusterApi, HelmInstall, ReleaseInfo, kinds::new_object},
    config::Configuration,
    errors::{Error, Result},
    metrics::Metrics,
    utils::poll_until,
};

/// kubectl failures worth retrying while the control plane comes up.
const RETRYABLE: &[&str] = &["connection refused", "unable to recognize"];

fn is_retryable(e: &Error) -> bool {
    let msg = e.to_string();
    e.is_temporary() || RETRYABLE.iter().any(|r| msg.contains(r))
}

/// Installs bundled charts and raw manifests into member clusters.
pub struct AddonInstaller {
    config: Configuration,
    metrics: Metrics,
    overrides: HashMap<String, Vec<u8>>,
}

impl AddonInstaller {
    pub fn new(config: Configuration, metrics: Metrics) -> Self {
        Self {
            config,
            metrics,
            overrides: HashMap::new(),
        }
    }

    /// Adds a chart or shadows a bundled one.
    pub fn with_chart(mut self, key: &str, archive: Vec<u8>) -> Self {
        self.overrides.insert(key.to_string(), archive);
        self
    }

    pub fn chart(&self, key: &str) -> Result<&[u8]> {
        self.overrides
            .get(key)
            .map(|c| c.as_slice())
            .or_else(|| charts::bundled(key))
            .ok_or_else(|| Error::NotFound(format!("chart {} is not bundled", key)))
    }

    /// `kubectl apply -f -`, retried while the apiserver is not ready yet.
    pub async fn apply_manifest(
        &self,
        client: &dyn ClusterApi,
        manifest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let what = format!("kubectl apply on cluster {}", client.cluster_id());
        let outcome = poll_until(
            &what,
            self.config.kubectl_retry,
            self.config.kubectl_timeout,
            cancel,
            || async {
                match client.kubectl(&["apply", "-f", "-"], Some(manifest)).await {
                    Ok(_) => Ok(Some(())),
                    Err(e) if is_retryable(&e) => Err(Error::Transient(e.to_string())),
                    Err(e) => Err(e),
                }
            },
        )
        .await;
        self.metrics.addon_installed("manifest", outcome.is_ok());
        outcome
    }

    pub async fn delete_manifest(&self, client: &dyn ClusterApi, manifest: &str) -> Result<()> {
        client
            .kubectl(&["delete", "--ignore-not-found", "-f", "-"], Some(manifest))
            .await
            .map(|_| ())
    }

    /// Creates `namespace` unless it exists.
    pub async fn ensure_namespace(&self, client: &dyn ClusterApi, namespace: &str) -> Result<()> {
        match client.get(ResourceKind::Namespace, None, namespace).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => (),
            Err(e) => return Err(e),
        }
        let object = new_object(ResourceKind::Namespace, None, namespace)?;
        match client.create(ResourceKind::Namespace, &object).await {
            Ok(_) => {
                info!(
                    "created namespace {} in cluster {}",
                    namespace,
                    client.cluster_id()
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Installs the bundled chart `key` as `name`.
    pub async fn install_chart(
        &self,
        client: &dyn ClusterApi,
        key: &str,
        name: &str,
        namespace: &str,
        values: Value,
    ) -> Result<ReleaseInfo> {
        let archive = self.chart(key)?.to_vec();
        self.install_archive(client, name, namespace, archive, values)
            .await
    }

    /// Moves the release `name` to the bundled chart `key` with `values`,
    /// installing it when absent.
    pub async fn upgrade_chart(
        &self,
        client: &dyn ClusterApi,
        key: &str,
        name: &str,
        namespace: &str,
        values: Value,
    ) -> Result<ReleaseInfo> {
        let archive = self.chart(key)?.to_vec();
        self.release(client, name, namespace, archive, values, true)
            .await
    }

    /// Installs a chart archive with `atomic` and `replace` set.
    pub async fn install_archive(
        &self,
        client: &dyn ClusterApi,
        name: &str,
        namespace: &str,
        archive: Vec<u8>,
        values: Value,
    ) -> Result<ReleaseInfo> {
        self.release(client, name, namespace, archive, values, false)
            .await
    }

    async fn release(
        &self,
        client: &dyn ClusterApi,
        name: &str,
        namespace: &str,
        archive: Vec<u8>,
        values: Value,
        upgrade: bool,
    ) -> Result<ReleaseInfo> {
        self.ensure_namespace(client, namespace).await?;
        let install = HelmInstall {
            name: name.to_string(),
            namespace: namespace.to_string(),
            chart: archive,
            values,
            atomic: true,
            replace: !upgrade,
        };
        let outcome = if upgrade {
            client.helm_upgrade(&install).await
        } else {
            client.helm_install(&install).await
        };
        self.metrics.addon_installed(name, outcome.is_ok());
        match &outcome {
            Ok(release) => info!(
                "installed release {}/{} revision {} in cluster {}",
                namespace,
                name,
                release.revision,
                client.cluster_id()
            ),
            Err(e) => warn!(
                "failed to install release {}/{} in cluster {}: {}",
                namespace,
                name,
                client.cluster_id(),
                e
            ),
        }
        outcome.map_err(|e| e.context(format!("install {}/{}", namespace, name)))
    }

    pub async fn uninstall_chart(
        &self,
        client: &dyn ClusterApi,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        match client.helm_uninstall(namespace, name).await {
            Err(e) if e.is_not_found() => {
                debug!("release {}/{} already gone", namespace, name);
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeBackend, FakeCluster};
    use std::time::Duration;

    fn installer() -> AddonInstaller {
        let config = Configuration {
            kubectl_retry: Duration::from_secs(10),
            kubectl_timeout: Duration::from_secs(900),
            ..Default::default()
        };
        AddonInstaller::new(config, Metrics::new()).with_chart("FLUENT_BIT_2_8_12_TGZ", b"fluent-bit".to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn apply_retries_while_apiserver_starts() {
        let backend = FakeBackend::new();
        let client = FakeCluster::new("c1", backend.clone());
        backend.fail_kubectl("dial tcp 10.0.0.5:6443: connection refused", 3);
        installer()
            .apply_manifest(&client, "kind: DaemonSet", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vec!["kind: DaemonSet".to_string()], backend.applied());
    }

    #[tokio::test]
    async fn apply_gives_up_on_other_errors() {
        let backend = FakeBackend::new();
        let client = FakeCluster::new("c1", backend.clone());
        backend.fail_kubectl("error validating data: unknown field", 1);
        let err = installer()
            .apply_manifest(&client, "kind: Foo", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
        assert!(backend.applied().is_empty());
    }

    #[tokio::test]
    async fn install_creates_namespace_first() {
        let backend = FakeBackend::new();
        let client = FakeCluster::new("c1", backend.clone());
        let installer = installer();
        let release = installer
            .install_chart(
                &client,
                "FLUENT_BIT_2_8_12_TGZ",
                "fluent-bit",
                "onecloud-system",
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(1, release.revision);
        assert!(
            backend
                .object(ResourceKind::Namespace, None, "onecloud-system")
                .is_some()
        );
        let taken = installer
            .install_chart(
                &client,
                "FLUENT_BIT_2_8_12_TGZ",
                "fluent-bit",
                "onecloud-system",
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(taken.to_string().contains("still in use"));
        assert!(
            installer
                .install_chart(&client, "MISSING_TGZ", "x", "default", Value::Null)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn upgrade_moves_a_deployed_release() {
        let backend = FakeBackend::new();
        let client = FakeCluster::new("c1", backend.clone());
        let installer = installer();
        let first = installer
            .upgrade_chart(
                &client,
                "FLUENT_BIT_2_8_12_TGZ",
                "fluent-bit",
                "onecloud-logging",
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(1, first.revision);
        let second = installer
            .upgrade_chart(
                &client,
                "FLUENT_BIT_2_8_12_TGZ",
                "fluent-bit",
                "onecloud-logging",
                serde_json::json!({"clusterName": "c1"}),
            )
            .await
            .unwrap();
        assert_eq!(2, second.revision);
        assert_eq!("deployed", second.status);
        assert_eq!(1, backend.releases().len());
    }

    #[tokio::test]
    async fn uninstall_tolerates_missing_release() {
        let client = FakeCluster::new("c1", FakeBackend::new());
        installer()
            .uninstall_chart(&client, "fluent-bit", "onecloud-system")
            .await
            .unwrap();
    }
}
