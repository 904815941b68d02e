//! Per-cluster API access.
//!
//! [`ClusterApi`] is everything the control plane does against one member
//! cluster: typed object access backed by informer caches, helm and
//! kubectl. [`ClusterClient`] implements it against a real apiserver.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kubefleet_apis::{Cluster, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

#[cfg(test)]
pub(crate) mod fake;
pub mod kinds;
mod kube_client;

pub use kube_client::{ClusterClient, KubeClientFactory};

/// Change observed by a member cluster informer.
#[derive(Clone, Debug)]
pub enum InformerEvent {
    Applied {
        cluster_id: String,
        kind: ResourceKind,
        object: DynamicObject,
    },
    Deleted {
        cluster_id: String,
        kind: ResourceKind,
        object: DynamicObject,
    },
}

impl InformerEvent {
    pub fn cluster_id(&self) -> &str {
        match self {
            InformerEvent::Applied { cluster_id, .. } | InformerEvent::Deleted { cluster_id, .. } => {
                cluster_id
            }
        }
    }
}

/// A helm release as reported by `helm list`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    /// `deployed`, `failed`, `pending-install`, ...
    pub status: String,
    pub chart: String,
    #[serde(default)]
    pub app_version: String,
}

/// Arguments of a chart installation.
#[derive(Clone, Debug, PartialEq)]
pub struct HelmInstall {
    pub name: String,
    pub namespace: String,
    /// Chart archive (`.tgz`).
    pub chart: Vec<u8>,
    pub values: Value,
    pub atomic: bool,
    /// Reuse the name of a failed or uninstalled release. Install only.
    pub replace: bool,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn cluster_id(&self) -> &str;

    /// Materialized kubeconfig for command line tools.
    fn kubeconfig_path(&self) -> &Path;

    fn is_closed(&self) -> bool;

    /// Stops informers and unlinks the kubeconfig file. Runs once.
    fn close(&self);

    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str)
    -> Result<DynamicObject>;

    /// Cached objects of `kind`, with type information stamped.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject>;

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject>;

    /// Deleting an absent object succeeds.
    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<()>;

    async fn server_version(&self) -> Result<String>;

    /// Waits until every informer cache has listed its kind.
    async fn resync(&self) -> Result<()>;

    async fn helm_list(&self, namespace: Option<&str>) -> Result<Vec<ReleaseInfo>>;

    /// `helm install`. Fails while a deployed release holds the name.
    async fn helm_install(&self, install: &HelmInstall) -> Result<ReleaseInfo>;

    /// `helm upgrade --install`. Installs the release when it is absent.
    async fn helm_upgrade(&self, install: &HelmInstall) -> Result<ReleaseInfo>;

    /// `NotFound` if the release does not exist.
    async fn helm_uninstall(&self, namespace: &str, name: &str) -> Result<()>;

    /// Runs kubectl against the cluster and returns its stdout.
    async fn kubectl(&self, args: &[&str], stdin: Option<&str>) -> Result<String>;
}

/// Builds clients for clusters. The registry's only way to connect.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>>;
}
