//! Helm releases installed on request, from the chart store.

use std::sync::Arc;

use async_trait::async_trait;
use kubefleet_apis::{
    Cluster, ClusterResource, Record, ReleaseCreateInput, RepoType, ResourceKind, ResourceStatus,
    UserCred,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AddonInstaller;
use crate::{
    drivers::{DriverRegistry, ReleaseDriver},
    errors::{Error, Result},
    providers::{ChartStore, IdentityProvider},
    reconciler::{Reconciler, RemoteObject},
    registry::ClusterRegistry,
    store::{Query, Store, StoreExt},
    tasks::{Step, TaskContext, TaskHandler},
};

/// Namespaces the bundled system charts may be installed into.
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "kube-system",
    "onecloud-system",
    "onecloud-monitoring",
    "onecloud-logging",
    "ceph-csi",
];

/// Releases of the bundled system repository.
pub struct InternalReleaseDriver;

#[async_trait]
impl ReleaseDriver for InternalReleaseDriver {
    fn repo_type(&self) -> RepoType {
        RepoType::Internal
    }

    async fn validate_create(&self, cred: &UserCred, input: &ReleaseCreateInput) -> Result<()> {
        if !cred.is_system_admin {
            return Err(Error::Validation(format!(
                "user {} may not install from internal repo {}",
                cred.user_name, input.repo
            )));
        }
        if !SYSTEM_NAMESPACES.contains(&input.namespace.as_str()) {
            return Err(Error::Validation(format!(
                "internal charts only go to system namespaces, not {}",
                input.namespace
            )));
        }
        Ok(())
    }
}

/// Releases of user managed repositories, gated by the identity broker.
pub struct ExternalReleaseDriver {
    identity: Arc<dyn IdentityProvider>,
}

impl ExternalReleaseDriver {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl ReleaseDriver for ExternalReleaseDriver {
    fn repo_type(&self) -> RepoType {
        RepoType::External
    }

    async fn validate_create(&self, cred: &UserCred, input: &ReleaseCreateInput) -> Result<()> {
        if cred.is_system_admin {
            return Ok(());
        }
        if !self.identity.has_permission(cred, "releases", "create").await? {
            return Err(Error::Validation(format!(
                "user {} may not create release {}/{}",
                cred.user_name, input.namespace, input.name
            )));
        }
        Ok(())
    }
}

pub struct ReleaseService {
    store: Arc<dyn Store>,
    registry: Arc<ClusterRegistry>,
    drivers: Arc<DriverRegistry>,
    reconciler: Arc<Reconciler>,
    installer: Arc<AddonInstaller>,
    charts: Arc<dyn ChartStore>,
}

impl ReleaseService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ClusterRegistry>,
        drivers: Arc<DriverRegistry>,
        reconciler: Arc<Reconciler>,
        installer: Arc<AddonInstaller>,
        charts: Arc<dyn ChartStore>,
    ) -> Self {
        Self {
            store,
            registry,
            drivers,
            reconciler,
            installer,
            charts,
        }
    }

    /// Admits the request and files the release row as `creating`.
    pub async fn prepare(&self, cred: &UserCred, input: &ReleaseCreateInput) -> Result<ClusterResource> {
        if input.name.is_empty() || input.chart.is_empty() {
            return Err(Error::Validation(
                "release name and chart are required".to_string(),
            ));
        }
        let cluster: Cluster = self.store.fetch(&input.cluster_id).await?;
        if !cluster.is_running() {
            return Err(Error::Validation(format!(
                "cluster {} is {}",
                cluster.ident(),
                cluster.status
            )));
        }
        self.drivers
            .release(input.repo_type)?
            .validate_create(cred, input)
            .await?;
        let existing: Option<ClusterResource> = self
            .store
            .find(
                &Query::new()
                    .eq("cluster_id", &input.cluster_id)
                    .eq("kind", ResourceKind::Release)
                    .eq("namespace", &input.namespace)
                    .eq("name", &input.name),
            )
            .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "release {}/{} already exists in cluster {}",
                input.namespace,
                input.name,
                cluster.ident()
            )));
        }
        let mut row = ClusterResource::new(
            &input.cluster_id,
            ResourceKind::Release,
            Some(&input.namespace),
            &input.name,
        );
        row.namespace_id = self
            .reconciler
            .namespace_id(&input.cluster_id, Some(&input.namespace))
            .await?;
        row.status = ResourceStatus::Creating;
        row.spec = json!({
            "repo": input.repo,
            "chart": input.chart,
            "version": input.version,
        });
        self.store.create(&row).await?;
        Ok(row)
    }

    async fn install(&self, row_id: &str, input: &ReleaseCreateInput) -> Result<ClusterResource> {
        let chart = self
            .charts
            .show(&input.repo, &input.chart, input.version.clone())
            .await
            .map_err(|e| e.context(format!("resolve chart {}/{}", input.repo, input.chart)))?;
        let client = self.registry.get(&input.cluster_id).await?;
        let release = self
            .installer
            .install_archive(
                client.as_ref(),
                &input.name,
                &input.namespace,
                chart.archive,
                input.values.clone(),
            )
            .await?;
        let manager = self.reconciler.manager(ResourceKind::Release)?;
        let remote = RemoteObject::from(release);
        let global_id = manager.global_id(&input.cluster_id, &remote);
        self.store
            .modify::<ClusterResource, _>(row_id, move |row| {
                manager.update_local_from_remote(row, &remote, &global_id)
            })
            .await
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReleaseParams {
    pub row_id: String,
    pub input: ReleaseCreateInput,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum ReleaseStage {
    #[default]
    Init,
}

/// Installs a filed release. The task owns the release row so the
/// reconciler leaves it alone until the install settles.
pub struct ReleaseInstallTask(pub Arc<ReleaseService>);

#[async_trait]
impl TaskHandler for ReleaseInstallTask {
    const NAME: &'static str = "ReleaseInstall";
    const OWNER_KIND: &'static str = ClusterResource::KIND;
    type Params = ReleaseParams;
    type Stage = ReleaseStage;

    async fn run(&self, _ctx: &TaskContext, params: &ReleaseParams, _stage: ReleaseStage) -> Result<Step<ReleaseStage>> {
        let row = self.0.install(&params.row_id, &params.input).await?;
        info!("{} is {}", row.ident(), row.status);
        Ok(Step::Complete)
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &ReleaseParams, reason: &str) {
        let reason = reason.to_string();
        let outcome = self
            .0
            .store
            .modify::<ClusterResource, _>(&params.row_id, move |row| {
                row.status = ResourceStatus::CreateFail;
                row.status_reason = Some(reason);
                Ok(())
            })
            .await;
        if let Err(e) = outcome {
            error!("failed to record install failure of release {}: {}", params.row_id, e);
        }
    }
}
