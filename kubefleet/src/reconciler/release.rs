use async_trait::async_trait;
use kube::api::DynamicObject;
use kubefleet_apis::{ClusterResource, ResourceCreateInput, ResourceKind, ResourceStatus};

use super::{ClusterResourceManager, RemoteObject};
use crate::{
    client::{ClusterApi, ReleaseInfo},
    errors::{Error, Result},
};

/// Manager for helm releases, identified by `cluster/namespace/name`.
/// The release revision serves as resource version.
pub struct ReleaseManager;

impl From<ReleaseInfo> for RemoteObject {
    fn from(release: ReleaseInfo) -> Self {
        let body = serde_json::to_value(&release).unwrap_or_default();
        Self {
            uid: String::new(),
            namespace: Some(release.namespace),
            name: release.name,
            resource_version: release.revision,
            labels: Default::default(),
            phase: Some(release.status),
            body,
        }
    }
}

#[async_trait]
impl ClusterResourceManager for ReleaseManager {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Release
    }

    async fn list_remote(&self, client: &dyn ClusterApi) -> Result<Vec<RemoteObject>> {
        Ok(client
            .helm_list(None)
            .await?
            .into_iter()
            .map(RemoteObject::from)
            .collect())
    }

    fn global_id(&self, cluster_id: &str, remote: &RemoteObject) -> String {
        format!(
            "{}/{}/{}",
            cluster_id,
            remote.namespace.as_deref().unwrap_or_default(),
            remote.name
        )
    }

    /// A failed release is recorded, never reinstalled.
    fn observed_status(&self, remote: &RemoteObject) -> Option<ResourceStatus> {
        match remote.phase.as_deref() {
            Some("deployed") => Some(ResourceStatus::Deployed),
            Some("failed") => Some(ResourceStatus::DeployFail),
            _ => None,
        }
    }

    fn new_remote_from_input(&self, input: &ResourceCreateInput) -> Result<DynamicObject> {
        Err(Error::Unsupported(format!(
            "release {} must be installed from a chart",
            input.name
        )))
    }

    async fn create_remote(
        &self,
        _client: &dyn ClusterApi,
        _object: &DynamicObject,
    ) -> Result<RemoteObject> {
        Err(Error::Unsupported(
            "releases are installed from charts".to_string(),
        ))
    }

    async fn delete_remote(&self, client: &dyn ClusterApi, row: &ClusterResource) -> Result<()> {
        let namespace = row.namespace.as_deref().unwrap_or("default");
        match client.helm_uninstall(namespace, &row.base.name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
