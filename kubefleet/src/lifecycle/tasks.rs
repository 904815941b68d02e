//! Task handlers driving the cluster and machine state machines.

use std::sync::Arc;

use async_trait::async_trait;
use kubefleet_apis::{
    Cluster, ClusterComponent, ClusterKeyPair, ClusterMode, ClusterResource, ClusterStatus,
    Component, FederatedJointCluster, Machine, MachineStatus, Record, ResourceKind,
};
use serde::{Deserialize, Serialize};

use super::{
    LifecycleEngine, pki,
    userdata::{self, BootstrapRole, UserDataContext},
};
use crate::{
    client::ClusterApi,
    errors::{Error, Result},
    store::{Query, StoreExt, Transaction},
    tasks::{Step, TaskContext, TaskHandler, TaskSpec},
};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClusterParams {
    pub cluster_id: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MachineParams {
    pub machine_id: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MachineDeleteParams {
    pub machine_id: String,
    /// Terminate failures are logged instead of failing the task.
    #[serde(default)]
    pub best_effort: bool,
}

fn machine_create(machine: &Machine, ctx: &TaskContext) -> Result<TaskSpec> {
    TaskSpec::new::<MachineCreateTask>(
        &machine.base.id,
        &MachineParams {
            machine_id: machine.base.id.clone(),
        },
        ctx.user_cred.clone(),
    )
}

/// Runs `f` with a client outside the registry and closes it afterwards.
async fn with_transient_client<T, F, Fut>(engine: &LifecycleEngine, cluster: &Cluster, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn ClusterApi>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let client = engine.registry.connect(cluster).await?;
    let outcome = f(client.clone()).await;
    client.close();
    outcome
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum ClusterCreateStage {
    #[default]
    Init,
    ControlPlanes,
    Nodes,
    Addons,
    Import,
}

/// Brings a cluster up: the first controlplane, the other controlplanes,
/// the nodes, then the add-ons. Imported clusters only get probed.
pub struct ClusterCreateTask(pub Arc<LifecycleEngine>);

impl ClusterCreateTask {
    async fn init(&self, ctx: &TaskContext, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let engine = &self.0;
        let cluster = engine
            .set_cluster_status(cluster_id, ClusterStatus::Creating, None)
            .await?;
        if cluster.mode == ClusterMode::Import {
            return Ok(Step::Next(ClusterCreateStage::Import));
        }
        engine.ensure_credentials(&cluster).await?;
        let first = engine.first_node(cluster_id).await?.ok_or_else(|| {
            Error::Validation(format!("cluster {} has no controlplane", cluster.ident()))
        })?;
        let children = if first.status.is_running() {
            vec![]
        } else {
            vec![machine_create(&first, ctx)?]
        };
        Ok(Step::Wait {
            next: ClusterCreateStage::ControlPlanes,
            children,
        })
    }

    /// Records how to reach the control plane, then joins the remaining
    /// controlplanes.
    async fn control_planes(&self, ctx: &TaskContext, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let engine = &self.0;
        let cluster: Cluster = engine.store.fetch(cluster_id).await?;
        let machines = engine.machines(cluster_id).await?;
        let first = machines
            .iter()
            .find(|m| m.is_first_node)
            .ok_or_else(|| Error::Fatal(format!("cluster {} lost its first node", cluster.ident())))?;
        let api_server = LifecycleEngine::api_server(&LifecycleEngine::endpoint(&cluster, first)?);
        let keypairs = engine.keypairs(cluster_id).await?;
        let kubeconfig = pki::admin_kubeconfig(&cluster.base.name, &api_server, &keypairs)?;
        engine
            .store
            .modify::<Cluster, _>(cluster_id, move |c| {
                c.api_server = Some(api_server);
                c.kubeconfig = Some(kubeconfig);
                Ok(())
            })
            .await?;
        let children = machines
            .iter()
            .filter(|m| m.is_controlplane() && !m.is_first_node && !m.status.is_running())
            .map(|m| machine_create(m, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Step::Wait {
            next: ClusterCreateStage::Nodes,
            children,
        })
    }

    async fn nodes(&self, ctx: &TaskContext, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let children = self
            .0
            .machines(cluster_id)
            .await?
            .iter()
            .filter(|m| !m.is_controlplane() && !m.status.is_running())
            .map(|m| machine_create(m, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Step::Wait {
            next: ClusterCreateStage::Addons,
            children,
        })
    }

    async fn addons(&self, ctx: &TaskContext, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let engine = &self.0;
        let cluster: Cluster = engine.store.fetch(cluster_id).await?;
        let manifests = engine
            .drivers
            .cluster(cluster.provider)?
            .addon_manifests(&cluster, &engine.config)?;
        if !manifests.is_empty() {
            with_transient_client(engine, &cluster, |client| async move {
                for manifest in &manifests {
                    engine
                        .installer
                        .apply_manifest(client.as_ref(), manifest, &ctx.cancel)
                        .await?;
                }
                Ok(())
            })
            .await?;
        }
        self.running(cluster_id).await
    }

    async fn import(&self, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let engine = &self.0;
        let cluster: Cluster = engine.store.fetch(cluster_id).await?;
        let version = with_transient_client(engine, &cluster, |client| async move {
            client.server_version().await
        })
        .await
        .map_err(|e| e.context(format!("import {}", cluster.ident())))?;
        info!("imported cluster {} runs {}", cluster.ident(), version);
        engine
            .store
            .modify::<Cluster, _>(cluster_id, move |c| {
                c.version = version;
                Ok(())
            })
            .await?;
        self.running(cluster_id).await
    }

    async fn running(&self, cluster_id: &str) -> Result<Step<ClusterCreateStage>> {
        let cluster = self
            .0
            .set_cluster_status(cluster_id, ClusterStatus::Running, None)
            .await?;
        self.0.registry.update(&cluster).await?;
        info!("cluster {} is running", cluster.ident());
        Ok(Step::Complete)
    }
}

#[async_trait]
impl TaskHandler for ClusterCreateTask {
    const NAME: &'static str = "ClusterCreate";
    const OWNER_KIND: &'static str = Cluster::KIND;
    type Params = ClusterParams;
    type Stage = ClusterCreateStage;

    async fn run(
        &self,
        ctx: &TaskContext,
        params: &ClusterParams,
        stage: ClusterCreateStage,
    ) -> Result<Step<ClusterCreateStage>> {
        let id = params.cluster_id.as_str();
        match stage {
            ClusterCreateStage::Init => self.init(ctx, id).await,
            ClusterCreateStage::ControlPlanes => self.control_planes(ctx, id).await,
            ClusterCreateStage::Nodes => self.nodes(ctx, id).await,
            ClusterCreateStage::Addons => self.addons(ctx, id).await,
            ClusterCreateStage::Import => self.import(id).await,
        }
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &ClusterParams, reason: &str) {
        if let Err(e) = self
            .0
            .set_cluster_status(
                &params.cluster_id,
                ClusterStatus::CreateFail,
                Some(reason.to_string()),
            )
            .await
        {
            error!("failed to record create failure of cluster {}: {}", params.cluster_id, e);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum MachineCreateStage {
    #[default]
    Init,
    Prepare,
}

/// Allocates the machine's resource, then bootstraps it with kubeadm. The
/// prepare stage runs as a local task.
pub struct MachineCreateTask(pub Arc<LifecycleEngine>);

impl MachineCreateTask {
    /// Renders the bootstrap script. Without `address` the script finds the
    /// machine's private address itself.
    async fn user_data(&self, cluster: &Cluster, machine: &Machine, address: Option<&str>) -> Result<String> {
        let engine = &self.0;
        let role = if machine.is_first_node {
            BootstrapRole::Init
        } else if machine.is_controlplane() {
            BootstrapRole::JoinControlPlane
        } else {
            BootstrapRole::JoinNode
        };
        let endpoint = if machine.is_first_node {
            match address {
                Some(_) => LifecycleEngine::endpoint(cluster, machine)?,
                None => cluster.lb_address.clone().unwrap_or_default(),
            }
        } else {
            let first = engine.first_node(&cluster.base.id).await?.ok_or_else(|| {
                Error::Fatal(format!("cluster {} has no first node", cluster.ident()))
            })?;
            LifecycleEngine::endpoint(cluster, &first)?
        };
        let token = cluster.bootstrap_token.clone().ok_or_else(|| {
            Error::Fatal(format!("cluster {} has no bootstrap token", cluster.ident()))
        })?;
        let keypairs = engine.keypairs(&cluster.base.id).await?;
        let hash = pki::ca_cert_hash(&keypairs.root_ca.cert)?;
        let context = UserDataContext::new(
            cluster,
            &keypairs,
            &token,
            &hash,
            &endpoint,
            address.unwrap_or_default(),
        );
        debug!("rendering {:?} script for {}", role, machine.ident());
        userdata::render(role, &context)
    }

    async fn create(&self, machine_id: &str) -> Result<Step<MachineCreateStage>> {
        let engine = &self.0;
        let machine: Machine = engine.store.fetch(machine_id).await?;
        if machine.status.is_running() {
            return Ok(Step::Complete);
        }
        let cluster: Cluster = engine.store.fetch(&machine.cluster_id).await?;
        let driver = engine
            .drivers
            .machine(machine.provider, machine.resource_type)?;
        let mut machine = engine
            .set_machine_status(machine_id, MachineStatus::Creating, None)
            .await?;
        if driver.boots_with_user_data() {
            // The address is resolved on the machine at boot.
            let script = self.user_data(&cluster, &machine, None).await?;
            machine = engine
                .store
                .modify::<Machine, _>(machine_id, move |m| {
                    m.user_data = Some(script);
                    Ok(())
                })
                .await?;
        }
        let resource_id = driver
            .create_resource(&cluster, &machine)
            .await
            .map_err(|e| e.context(format!("create {}", machine.ident())))?;
        engine
            .store
            .modify::<Machine, _>(machine_id, move |m| {
                m.resource_id = Some(resource_id);
                Ok(())
            })
            .await?;
        Ok(Step::Local(MachineCreateStage::Prepare))
    }

    async fn prepare(&self, ctx: &TaskContext, machine_id: &str) -> Result<Step<MachineCreateStage>> {
        let engine = &self.0;
        let machine = engine
            .set_machine_status(machine_id, MachineStatus::Prepare, None)
            .await?;
        let cluster: Cluster = engine.store.fetch(&machine.cluster_id).await?;
        let driver = engine
            .drivers
            .machine(machine.provider, machine.resource_type)?;
        let address = driver
            .wait_resource(&machine, &ctx.cancel)
            .await
            .map_err(|e| e.context(format!("prepare {}", machine.ident())))?;
        let addr = address.clone();
        let machine = engine
            .store
            .modify::<Machine, _>(machine_id, move |m| {
                m.address = Some(addr);
                Ok(())
            })
            .await?;

        let script = match machine.user_data.clone() {
            Some(script) if driver.boots_with_user_data() => script,
            _ => {
                let script = self.user_data(&cluster, &machine, Some(&address)).await?;
                let user_data = script.clone();
                engine
                    .store
                    .modify::<Machine, _>(machine_id, move |m| {
                        m.user_data = Some(user_data);
                        Ok(())
                    })
                    .await?;
                script
            }
        };
        info!("bootstrapping {}", machine.ident());
        driver
            .run_bootstrap(&machine, &address, &script)
            .await
            .map_err(|e| e.context(format!("bootstrap {}", machine.ident())))?;
        engine
            .set_machine_status(machine_id, MachineStatus::Running, None)
            .await?;
        info!("machine {} is running", machine.ident());
        Ok(Step::Complete)
    }
}

#[async_trait]
impl TaskHandler for MachineCreateTask {
    const NAME: &'static str = "MachineCreate";
    const OWNER_KIND: &'static str = Machine::KIND;
    type Params = MachineParams;
    type Stage = MachineCreateStage;

    async fn run(
        &self,
        ctx: &TaskContext,
        params: &MachineParams,
        stage: MachineCreateStage,
    ) -> Result<Step<MachineCreateStage>> {
        match stage {
            MachineCreateStage::Init => self.create(&params.machine_id).await,
            MachineCreateStage::Prepare => self.prepare(ctx, &params.machine_id).await,
        }
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &MachineParams, reason: &str) {
        let reason = reason.to_string();
        let outcome = self
            .0
            .store
            .modify::<Machine, _>(&params.machine_id, move |m| {
                m.status = match m.status {
                    MachineStatus::Prepare => MachineStatus::PrepareFail,
                    _ => MachineStatus::CreateFail,
                };
                m.status_reason = Some(reason);
                Ok(())
            })
            .await;
        if let Err(e) = outcome {
            error!("failed to record create failure of machine {}: {}", params.machine_id, e);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum MachineDeleteStage {
    #[default]
    Init,
}

/// Drains the Node, releases the resource and deletes the row.
pub struct MachineDeleteTask(pub Arc<LifecycleEngine>);

#[async_trait]
impl TaskHandler for MachineDeleteTask {
    const NAME: &'static str = "MachineDelete";
    const OWNER_KIND: &'static str = Machine::KIND;
    type Params = MachineDeleteParams;
    type Stage = MachineDeleteStage;

    async fn run(
        &self,
        ctx: &TaskContext,
        params: &MachineDeleteParams,
        _stage: MachineDeleteStage,
    ) -> Result<Step<MachineDeleteStage>> {
        let engine = &self.0;
        let machine: Machine = match engine.store.fetch(&params.machine_id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(Step::Complete),
            Err(e) => return Err(e),
        };
        engine
            .set_machine_status(&machine.base.id, MachineStatus::Deleting, None)
            .await?;
        if engine.registry.contains(&machine.cluster_id).await {
            let outcome = match engine.registry.get(&machine.cluster_id).await {
                Ok(client) => {
                    client
                        .delete(ResourceKind::Node, None, &machine.base.name)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!("failed to remove node of {}: {}", machine.ident(), e);
            }
        }
        let machine = engine
            .set_machine_status(&machine.base.id, MachineStatus::Terminating, None)
            .await?;
        let driver = engine
            .drivers
            .machine(machine.provider, machine.resource_type)?;
        if let Err(e) = driver.terminate_resource(&machine, &ctx.cancel).await {
            if !params.best_effort {
                return Err(e.context(format!("terminate {}", machine.ident())));
            }
            warn!("ignoring terminate failure of {}: {}", machine.ident(), e);
        }
        engine.store.remove::<Machine>(&machine.base.id).await?;
        info!("deleted machine {}", machine.ident());
        Ok(Step::Complete)
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &MachineDeleteParams, reason: &str) {
        let reason = reason.to_string();
        let outcome = self
            .0
            .store
            .modify::<Machine, _>(&params.machine_id, move |m| {
                m.status = match m.status {
                    MachineStatus::Terminating => MachineStatus::TerminateFail,
                    _ => MachineStatus::DeleteFail,
                };
                m.status_reason = Some(reason);
                Ok(())
            })
            .await;
        match outcome {
            Err(e) if !e.is_not_found() => {
                error!("failed to record delete failure of machine {}: {}", params.machine_id, e)
            }
            _ => (),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum ClusterDeleteStage {
    #[default]
    Init,
    Cleanup,
}

/// Tears a cluster down: its client, its machines, then every row it owns.
pub struct ClusterDeleteTask(pub Arc<LifecycleEngine>);

impl ClusterDeleteTask {
    async fn cleanup(&self, cluster_id: &str) -> Result<()> {
        let store = self.0.store.as_ref();
        let by_cluster = Query::new().eq("cluster_id", cluster_id);
        let mut tx = Transaction::new();
        let joints: Vec<FederatedJointCluster> = store.list(&by_cluster).await?;
        for joint in &joints {
            tx.delete::<FederatedJointCluster>(&joint.base.id);
        }
        let links: Vec<ClusterComponent> = store.list(&by_cluster).await?;
        let components: Vec<Component> = store
            .list(&Query::new().any_of("id", links.iter().map(|l| l.component_id.as_str())))
            .await?;
        for link in &links {
            tx.delete::<ClusterComponent>(&link.base.id);
        }
        for component in &components {
            tx.delete::<Component>(&component.base.id);
        }
        let keypairs: Vec<ClusterKeyPair> = store.list(&by_cluster).await?;
        for row in &keypairs {
            tx.delete::<ClusterKeyPair>(&row.base.id);
        }
        let resources: Vec<ClusterResource> = store.list(&by_cluster).await?;
        for row in &resources {
            tx.delete::<ClusterResource>(&row.base.id);
        }
        tx.delete::<Cluster>(cluster_id);
        debug!(
            "removing cluster {} with {} rows",
            cluster_id,
            tx.len()
        );
        store.commit(tx).await
    }
}

#[async_trait]
impl TaskHandler for ClusterDeleteTask {
    const NAME: &'static str = "ClusterDelete";
    const OWNER_KIND: &'static str = Cluster::KIND;
    type Params = ClusterParams;
    type Stage = ClusterDeleteStage;

    async fn run(
        &self,
        ctx: &TaskContext,
        params: &ClusterParams,
        stage: ClusterDeleteStage,
    ) -> Result<Step<ClusterDeleteStage>> {
        let engine = &self.0;
        let id = params.cluster_id.as_str();
        match stage {
            ClusterDeleteStage::Init => {
                let cluster = engine
                    .set_cluster_status(id, ClusterStatus::Deleting, None)
                    .await?;
                engine.registry.remove(id).await;
                let children = engine
                    .machines(id)
                    .await?
                    .iter()
                    .map(|m| {
                        TaskSpec::new::<MachineDeleteTask>(
                            &m.base.id,
                            &MachineDeleteParams {
                                machine_id: m.base.id.clone(),
                                best_effort: true,
                            },
                            ctx.user_cred.clone(),
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                info!(
                    "deleting cluster {} with {} machines",
                    cluster.ident(),
                    children.len()
                );
                Ok(Step::Wait {
                    next: ClusterDeleteStage::Cleanup,
                    children,
                })
            }
            ClusterDeleteStage::Cleanup => {
                self.cleanup(id).await?;
                info!("deleted cluster {}", id);
                Ok(Step::Complete)
            }
        }
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &ClusterParams, reason: &str) {
        if let Err(e) = self
            .0
            .set_cluster_status(
                &params.cluster_id,
                ClusterStatus::DeleteFail,
                Some(reason.to_string()),
            )
            .await
        {
            error!("failed to record delete failure of cluster {}: {}", params.cluster_id, e);
        }
    }
}

/// Probes the apiserver and records `running` or `unknown`. The registry
/// entry follows the new status. Returns the refreshed row.
async fn probe_cluster(engine: &LifecycleEngine, cluster_id: &str) -> Result<Cluster> {
    let cluster: Cluster = engine.store.fetch(cluster_id).await?;
    if !matches!(cluster.status, ClusterStatus::Running | ClusterStatus::Unknown) {
        return Err(Error::Validation(format!(
            "cluster {} is {}",
            cluster.ident(),
            cluster.status
        )));
    }
    let probe = with_transient_client(engine, &cluster, |client| async move {
        client.server_version().await
    })
    .await;
    let (status, reason, version) = match probe {
        Ok(version) => (ClusterStatus::Running, None, Some(version)),
        Err(e) => {
            warn!("cluster {} is unreachable: {}", cluster.ident(), e);
            (ClusterStatus::Unknown, Some(e.to_string()), None)
        }
    };
    let updated = engine
        .store
        .modify::<Cluster, _>(cluster_id, move |c| {
            c.status = status;
            c.status_reason = reason;
            if let Some(version) = version {
                c.version = version;
            }
            Ok(())
        })
        .await?;
    if updated.status != cluster.status || !engine.registry.contains(cluster_id).await {
        engine.registry.update(&updated).await?;
    }
    Ok(updated)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum SyncStage {
    #[default]
    Init,
}

/// Refreshes the informer caches and the rows of a reachable cluster.
pub struct ClusterSyncTask(pub Arc<LifecycleEngine>);

#[async_trait]
impl TaskHandler for ClusterSyncTask {
    const NAME: &'static str = "ClusterSync";
    const OWNER_KIND: &'static str = Cluster::KIND;
    type Params = ClusterParams;
    type Stage = SyncStage;

    async fn run(&self, _ctx: &TaskContext, params: &ClusterParams, _stage: SyncStage) -> Result<Step<SyncStage>> {
        let engine = &self.0;
        let cluster = probe_cluster(engine, &params.cluster_id).await?;
        if !cluster.is_running() {
            return Ok(Step::Complete);
        }
        let client = engine.registry.get(&cluster.base.id).await?;
        client.resync().await?;
        let result = engine.reconciler.sync_all(client.as_ref()).await;
        info!(
            "synced cluster {}: {} added, {} updated, {} deleted, {} errors",
            cluster.ident(),
            result.added,
            result.updated,
            result.deleted,
            result.error_count()
        );
        result.into_result()?;
        Ok(Step::Complete)
    }
}

/// Liveness probe of the apiserver.
pub struct ClusterSyncStatusTask(pub Arc<LifecycleEngine>);

#[async_trait]
impl TaskHandler for ClusterSyncStatusTask {
    const NAME: &'static str = "ClusterSyncStatus";
    const OWNER_KIND: &'static str = Cluster::KIND;
    type Params = ClusterParams;
    type Stage = SyncStage;

    async fn run(&self, _ctx: &TaskContext, params: &ClusterParams, _stage: SyncStage) -> Result<Step<SyncStage>> {
        let cluster = probe_cluster(&self.0, &params.cluster_id).await?;
        debug!("cluster {} is {}", cluster.ident(), cluster.status);
        Ok(Step::Complete)
    }
}
