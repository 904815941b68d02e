//! The control plane root.
//!
//! [`Control`] owns every subsystem and is the only entry point callers
//! use. Requests are admitted synchronously: rows are validated and filed,
//! then a task is queued to do the slow part. Member cluster informers feed
//! [`Control::handle_event`] through the event pump.

use std::{sync::Arc, time::Duration};

use kube::ResourceExt;
use kubefleet_apis::{
    Cluster, ClusterCreateInput, ClusterMode, ClusterProvider, ClusterResource, ClusterStatus,
    Component, ComponentSettings, ComponentType, FEDERATED_ANNOTATION, FederatedCreateInput,
    FederatedJointCluster, FederatedKind, FederatedResource, Machine, MachineCreateInput,
    ReleaseCreateInput, ResourceCreateInput, ResourceKind, SecretCreateInput,
    TaskRecord, UserCred,
};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    addons::{
        AddonInstaller,
        components::{
            CephCsiDriver, ComponentAction, ComponentManager, ComponentParams, ComponentTask,
            FluentBitDriver, MonitorDriver,
        },
        releases::{
            ExternalReleaseDriver, InternalReleaseDriver, ReleaseInstallTask, ReleaseParams,
            ReleaseService,
        },
        secrets::{self, CephCsiSecretDriver, DockerConfigJsonDriver},
    },
    client::{ClientFactory, InformerEvent, KubeClientFactory},
    config::Configuration,
    drivers::DriverRegistry,
    errors::{Error, Result},
    federation::FederationEngine,
    hosts::StaticHostProvider,
    lifecycle::{
        BaremetalDriver, LifecycleEngine, MachineTimings, OneCloudClusterDriver,
        SystemClusterDriver, VmDriver,
        ssh::{RemoteExecutor, ThrusshExecutor},
        tasks::{
            ClusterCreateTask, ClusterDeleteTask, ClusterParams, ClusterSyncStatusTask,
            ClusterSyncTask, MachineCreateTask, MachineDeleteParams, MachineDeleteTask,
            MachineParams,
        },
    },
    locks::LockManager,
    metrics::Metrics,
    providers::{
        AllowAllIdentity, AuditSink, ChartStore, EmptyChartStore, HostProvider, IdentityProvider,
        LogAuditSink,
    },
    reconciler::{Reconciler, RemoteObject},
    registry::ClusterRegistry,
    store::{MemoryStore, Query, Store, StoreExt},
    tasks::{TaskHandler, TaskScheduler, TaskSchedulerBuilder, TaskSpec},
};

const EVENT_QUEUE: usize = 1024;

/// Assembles a [`Control`]. Every collaborator has a default suitable for a
/// standalone control plane.
pub struct ControlBuilder {
    config: Configuration,
    store: Option<Arc<dyn Store>>,
    factory: Option<Arc<dyn ClientFactory>>,
    hosts: Option<Arc<dyn HostProvider>>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    charts: Option<Arc<dyn ChartStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    installer: Option<AddonInstaller>,
    metrics: Option<Metrics>,
}

impl ControlBuilder {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            store: None,
            factory: None,
            hosts: None,
            executor: None,
            identity: None,
            charts: None,
            audit: None,
            installer: None,
            metrics: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the kube-rs backed client factory.
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn hosts(mut self, hosts: Arc<dyn HostProvider>) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn charts(mut self, charts: Arc<dyn ChartStore>) -> Self {
        self.charts = Some(charts);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn installer(mut self, installer: AddonInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn drivers(
        config: &Configuration,
        hosts: Arc<dyn HostProvider>,
        executor: Arc<dyn RemoteExecutor>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<DriverRegistry> {
        let timings = MachineTimings::from(config);
        let mut drivers = DriverRegistry::new();
        drivers.register_cluster(Arc::new(OneCloudClusterDriver))?;
        drivers.register_cluster(Arc::new(SystemClusterDriver))?;
        drivers.register_machine(Arc::new(VmDriver::new(
            ClusterProvider::OneCloud,
            hosts.clone(),
            executor.clone(),
            timings.clone(),
        )))?;
        drivers.register_machine(Arc::new(BaremetalDriver::new(
            ClusterProvider::OneCloud,
            hosts,
            executor,
            timings,
        )))?;
        drivers.register_component(Arc::new(CephCsiDriver))?;
        drivers.register_component(Arc::new(MonitorDriver))?;
        drivers.register_component(Arc::new(FluentBitDriver))?;
        drivers.register_secret(Arc::new(DockerConfigJsonDriver))?;
        drivers.register_secret(Arc::new(CephCsiSecretDriver))?;
        drivers.register_release(Arc::new(InternalReleaseDriver))?;
        drivers.register_release(Arc::new(ExternalReleaseDriver::new(identity)))?;
        Ok(drivers)
    }

    pub fn build(self) -> Result<Arc<Control>> {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_else(Metrics::new);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(LogAuditSink));
        let identity = self.identity.unwrap_or_else(|| Arc::new(AllowAllIdentity));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(KubeClientFactory::new(config.clone(), events_tx.clone()))
        });
        let hosts = self
            .hosts
            .unwrap_or_else(|| Arc::new(StaticHostProvider::new(vec![], None)));
        let executor = self.executor.unwrap_or_else(|| Arc::new(ThrusshExecutor));
        let charts = self.charts.unwrap_or_else(|| Arc::new(EmptyChartStore));
        let installer = Arc::new(
            self.installer
                .unwrap_or_else(|| AddonInstaller::new(config.clone(), metrics.clone())),
        );

        let locks = LockManager::new();
        let drivers = Arc::new(Self::drivers(&config, hosts, executor, identity)?);
        let registry = Arc::new(ClusterRegistry::new(
            store.clone(),
            factory,
            metrics.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            locks.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let lifecycle = Arc::new(LifecycleEngine::new(
            store.clone(),
            registry.clone(),
            drivers.clone(),
            locks.clone(),
            reconciler.clone(),
            installer.clone(),
            config.clone(),
        ));
        let components = Arc::new(ComponentManager::new(
            store.clone(),
            registry.clone(),
            drivers.clone(),
            installer.clone(),
            config.image_repository.clone(),
        ));
        let releases = Arc::new(ReleaseService::new(
            store.clone(),
            registry.clone(),
            drivers.clone(),
            reconciler.clone(),
            installer,
            charts,
        ));
        let federation = Arc::new(FederationEngine::new(
            store.clone(),
            registry.clone(),
            locks.clone(),
        ));
        let scheduler = TaskSchedulerBuilder::new(
            store.clone(),
            locks,
            audit,
            metrics,
            config.task_workers,
        )
        .register(ClusterCreateTask(lifecycle.clone()))?
        .register(MachineCreateTask(lifecycle.clone()))?
        .register(MachineDeleteTask(lifecycle.clone()))?
        .register(ClusterDeleteTask(lifecycle.clone()))?
        .register(ClusterSyncTask(lifecycle.clone()))?
        .register(ClusterSyncStatusTask(lifecycle.clone()))?
        .register(ComponentTask(components.clone()))?
        .register(ReleaseInstallTask(releases.clone()))?
        .build();

        Ok(Arc::new(Control {
            config,
            store,
            registry,
            reconciler,
            drivers,
            lifecycle,
            components,
            releases,
            federation,
            scheduler,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }
}

pub struct Control {
    config: Configuration,
    store: Arc<dyn Store>,
    registry: Arc<ClusterRegistry>,
    reconciler: Arc<Reconciler>,
    drivers: Arc<DriverRegistry>,
    lifecycle: Arc<LifecycleEngine>,
    components: Arc<ComponentManager>,
    releases: Arc<ReleaseService>,
    federation: Arc<FederationEngine>,
    scheduler: Arc<TaskScheduler>,
    events_tx: mpsc::Sender<InformerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<InformerEvent>>>,
}

impl Control {
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Sender the informers of every member cluster publish to.
    pub fn events(&self) -> mpsc::Sender<InformerEvent> {
        self.events_tx.clone()
    }

    pub async fn wait_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.scheduler.wait_task(task_id).await
    }

    async fn submit<H: TaskHandler>(
        &self,
        owner_id: &str,
        params: &H::Params,
        cred: &UserCred,
    ) -> Result<TaskRecord> {
        self.scheduler
            .submit(TaskSpec::new::<H>(owner_id, params, cred.clone())?)
            .await
    }

    async fn ensure_idle(&self, owner_id: &str, what: &str) -> Result<()> {
        if self.scheduler.is_owner_busy(owner_id).await? {
            return Err(Error::Conflict(format!("{} has a task in progress", what)));
        }
        Ok(())
    }

    async fn submit_cluster_create(&self, cred: &UserCred, cluster: &Cluster) -> Result<TaskRecord> {
        self.submit::<ClusterCreateTask>(
            &cluster.base.id,
            &ClusterParams {
                cluster_id: cluster.base.id.clone(),
            },
            cred,
        )
        .await
    }

    /// Files a cluster with its machines. Returns the create task unless the
    /// cluster waits for its first controlplane.
    pub async fn create_cluster(
        &self,
        cred: &UserCred,
        input: &ClusterCreateInput,
    ) -> Result<(Cluster, Option<TaskRecord>)> {
        self.lifecycle.validate_cluster_create(input).await?;
        let (cluster, machines) = self.lifecycle.new_cluster(input).await?;
        if cluster.mode == ClusterMode::Customize && machines.is_empty() {
            return Ok((cluster, None));
        }
        let task = self.submit_cluster_create(cred, &cluster).await?;
        Ok((cluster, Some(task)))
    }

    /// Restarts whatever a cluster was doing when it failed.
    pub async fn retry_cluster(&self, cred: &UserCred, cluster_id: &str) -> Result<TaskRecord> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        self.ensure_idle(cluster_id, &cluster.ident()).await?;
        match cluster.status {
            ClusterStatus::CreateFail => self.submit_cluster_create(cred, &cluster).await,
            ClusterStatus::DeleteFail => self.delete_cluster(cred, cluster_id).await,
            ClusterStatus::Unknown => self.sync_cluster_status(cred, cluster_id).await,
            status => Err(Error::Validation(format!(
                "cluster {} is {}",
                cluster.ident(),
                status
            ))),
        }
    }

    /// Adds a machine. The first controlplane of an empty cluster brings the
    /// whole cluster up.
    pub async fn add_machine(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        input: &MachineCreateInput,
    ) -> Result<(Machine, TaskRecord)> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        let _guard = self.lifecycle.lock_machines(cluster_id).await;
        self.lifecycle.validate_machine_create(&cluster, input).await?;
        if self.lifecycle.first_node(cluster_id).await?.is_none() {
            self.ensure_idle(cluster_id, &cluster.ident()).await?;
            if !cluster.status.permits_retry() {
                return Err(Error::Validation(format!(
                    "cluster {} is {}",
                    cluster.ident(),
                    cluster.status
                )));
            }
            let machine = self.lifecycle.new_machine(&cluster, input).await?;
            let task = self.submit_cluster_create(cred, &cluster).await?;
            return Ok((machine, task));
        }
        let machine = self.lifecycle.new_machine(&cluster, input).await?;
        let task = self
            .submit::<MachineCreateTask>(
                &machine.base.id,
                &MachineParams {
                    machine_id: machine.base.id.clone(),
                },
                cred,
            )
            .await?;
        Ok((machine, task))
    }

    /// The first node goes last.
    pub async fn delete_machine(&self, cred: &UserCred, machine_id: &str) -> Result<TaskRecord> {
        let machine: Machine = self.store.fetch(machine_id).await?;
        if machine.is_first_node && self.lifecycle.machines(&machine.cluster_id).await?.len() > 1 {
            return Err(Error::Validation(format!(
                "first controlplane {} cannot be deleted while other machines remain",
                machine.ident()
            )));
        }
        self.ensure_idle(machine_id, &machine.ident()).await?;
        self.submit::<MachineDeleteTask>(
            machine_id,
            &MachineDeleteParams {
                machine_id: machine_id.to_string(),
                best_effort: false,
            },
            cred,
        )
        .await
    }

    pub async fn delete_cluster(&self, cred: &UserCred, cluster_id: &str) -> Result<TaskRecord> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        self.ensure_idle(cluster_id, &cluster.ident()).await?;
        self.submit::<ClusterDeleteTask>(
            cluster_id,
            &ClusterParams {
                cluster_id: cluster_id.to_string(),
            },
            cred,
        )
        .await
    }

    /// Probes the cluster and resyncs every tracked kind.
    pub async fn sync_cluster(&self, cred: &UserCred, cluster_id: &str) -> Result<TaskRecord> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        self.ensure_idle(cluster_id, &cluster.ident()).await?;
        self.submit::<ClusterSyncTask>(
            cluster_id,
            &ClusterParams {
                cluster_id: cluster_id.to_string(),
            },
            cred,
        )
        .await
    }

    pub async fn sync_cluster_status(&self, cred: &UserCred, cluster_id: &str) -> Result<TaskRecord> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        self.ensure_idle(cluster_id, &cluster.ident()).await?;
        self.submit::<ClusterSyncStatusTask>(
            cluster_id,
            &ClusterParams {
                cluster_id: cluster_id.to_string(),
            },
            cred,
        )
        .await
    }

    pub async fn create_resource(&self, input: &ResourceCreateInput) -> Result<ClusterResource> {
        let client = self.registry.get(&input.cluster_id).await?;
        self.reconciler.create(client.as_ref(), input).await
    }

    pub async fn delete_resource(&self, row_id: &str) -> Result<()> {
        let row: ClusterResource = self.store.fetch(row_id).await?;
        let client = self.registry.get(&row.cluster_id).await?;
        self.reconciler.delete(client.as_ref(), row_id).await
    }

    pub async fn create_secret(&self, input: &SecretCreateInput) -> Result<ClusterResource> {
        let resource = secrets::secret_input(&self.drivers, input)?;
        self.create_resource(&resource).await
    }

    pub async fn create_release(
        &self,
        cred: &UserCred,
        input: &ReleaseCreateInput,
    ) -> Result<(ClusterResource, TaskRecord)> {
        let row = self.releases.prepare(cred, input).await?;
        let task = self
            .submit::<ReleaseInstallTask>(
                &row.base.id,
                &ReleaseParams {
                    row_id: row.base.id.clone(),
                    input: input.clone(),
                },
                cred,
            )
            .await?;
        Ok((row, task))
    }

    async fn submit_component(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        component: Component,
        action: ComponentAction,
    ) -> Result<(Component, TaskRecord)> {
        let task = self
            .submit::<ComponentTask>(
                &component.base.id,
                &ComponentParams {
                    cluster_id: cluster_id.to_string(),
                    component_id: component.base.id.clone(),
                    action,
                },
                cred,
            )
            .await?;
        Ok((component, task))
    }

    pub async fn enable_component(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        settings: ComponentSettings,
    ) -> Result<(Component, TaskRecord)> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        let component = self.components.enable(&cluster, settings).await?;
        self.submit_component(cred, cluster_id, component, ComponentAction::Deploy)
            .await
    }

    pub async fn update_component(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        settings: ComponentSettings,
    ) -> Result<(Component, TaskRecord)> {
        let component = self.components.update(cluster_id, settings).await?;
        self.submit_component(cred, cluster_id, component, ComponentAction::Update)
            .await
    }

    pub async fn disable_component(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        component_type: ComponentType,
    ) -> Result<(Component, TaskRecord)> {
        let component = self.components.disable(cluster_id, component_type).await?;
        self.submit_component(cred, cluster_id, component, ComponentAction::Undeploy)
            .await
    }

    pub async fn delete_component(
        &self,
        cred: &UserCred,
        cluster_id: &str,
        component_type: ComponentType,
    ) -> Result<(Component, TaskRecord)> {
        let component = self.components.delete(cluster_id, component_type).await?;
        self.submit_component(cred, cluster_id, component, ComponentAction::Delete)
            .await
    }

    pub async fn create_federated(&self, input: &FederatedCreateInput) -> Result<FederatedResource> {
        self.federation.create(input).await
    }

    pub async fn attach_federated(
        &self,
        fed_id: &str,
        cluster_id: &str,
    ) -> Result<FederatedJointCluster> {
        self.federation.attach(fed_id, cluster_id).await
    }

    pub async fn detach_federated(&self, fed_id: &str, cluster_id: &str) -> Result<()> {
        self.federation.detach(fed_id, cluster_id).await
    }

    pub async fn delete_federated(&self, fed_id: &str) -> Result<()> {
        self.federation.delete(fed_id).await
    }

    pub async fn update_federated_template(
        &self,
        fed_id: &str,
        template: Value,
    ) -> Result<FederatedResource> {
        self.federation.update_template(fed_id, template).await
    }

    pub async fn federated_joints(&self, fed_id: &str) -> Result<Vec<FederatedJointCluster>> {
        self.federation.joints(fed_id).await
    }

    /// Reapplies every federated template attached to a cluster.
    pub async fn reconcile_federated(&self, cluster_id: &str) -> Result<usize> {
        self.federation.reconcile_cluster(cluster_id).await
    }

    /// Applies one informer event to the local mirror.
    pub async fn handle_event(&self, event: InformerEvent) -> Result<()> {
        match event {
            InformerEvent::Applied {
                cluster_id,
                kind,
                object,
            } => {
                if kind.is_tracked() {
                    let remote = RemoteObject::from_object(kind, &object)?;
                    self.reconciler
                        .on_remote_update(&cluster_id, kind, &remote)
                        .await?;
                }
                if kind == ResourceKind::Node {
                    self.lifecycle.on_node_event(&cluster_id, &object, false).await?;
                }
            }
            InformerEvent::Deleted {
                cluster_id,
                kind,
                object,
            } => {
                if kind.is_tracked() {
                    let remote = RemoteObject::from_object(kind, &object)?;
                    self.reconciler
                        .on_remote_delete(&cluster_id, kind, &remote)
                        .await?;
                }
                if kind == ResourceKind::Node {
                    self.lifecycle.on_node_event(&cluster_id, &object, true).await?;
                }
                let federated = FederatedKind::ALL.iter().any(|k| k.target() == kind);
                if federated && object.annotations().contains_key(FEDERATED_ANNOTATION) {
                    self.federation.on_remote_delete(&cluster_id, &object).await?;
                }
            }
        }
        Ok(())
    }

    /// Drains informer events until `shutdown`. Events of one cluster are
    /// applied in order.
    pub async fn run_event_pump(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Conflict("event pump already running".to_string()))?;
        info!("informer event pump started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let cluster_id = event.cluster_id().to_string();
            if let Err(e) = self.handle_event(event).await {
                if e.is_not_found() || e.is_conflict() {
                    debug!("informer event of cluster {}: {}", cluster_id, e);
                } else {
                    warn!("informer event of cluster {}: {}", cluster_id, e);
                }
            }
        }
        info!("informer event pump stopped");
        Ok(())
    }

    /// Full sync of every running cluster. Catches deletes the informers
    /// missed across a relist and release status, which no informer watches.
    pub async fn resync_clusters(&self) {
        let clusters: Vec<Cluster> = match self
            .store
            .list(&Query::new().eq("status", ClusterStatus::Running))
            .await
        {
            Ok(clusters) => clusters,
            Err(e) => {
                error!("failed to list clusters to resync: {}", e);
                return;
            }
        };
        for cluster in clusters {
            let client = match self.registry.get(&cluster.base.id).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("resync of cluster {}: {}", cluster.ident(), e);
                    continue;
                }
            };
            let result = self.reconciler.sync_all(client.as_ref()).await;
            debug!(
                "resynced cluster {}: {} added, {} updated, {} deleted, {} errors",
                cluster.ident(),
                result.added,
                result.updated,
                result.deleted,
                result.error_count()
            );
        }
    }

    pub async fn run_resync_loop(&self, interval: Duration, shutdown: CancellationToken) {
        info!("cluster resync loop started, every {:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.resync_clusters().await,
            }
        }
        info!("cluster resync loop stopped");
    }

    /// Loads running clusters and resumes interrupted tasks.
    pub async fn start(&self) -> Result<()> {
        let tally = self.registry.startup().await;
        if tally.failed > 0 {
            warn!("{} clusters could not be connected at startup", tally.failed);
        }
        self.scheduler.resume_pending().await?;
        Ok(())
    }

    /// Runs the background loops until `shutdown`, then stops the scheduler.
    /// Call [`Control::start`] first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let interval = self.config.registry_refresh;
        let (_, pump, _, _) = tokio::join!(
            self.registry.run_refresh_loop(interval, shutdown.clone()),
            self.run_event_pump(shutdown.clone()),
            self.federation.run_reconcile_loop(interval, shutdown.clone()),
            self.run_resync_loop(self.config.informer_resync, shutdown.clone()),
        );
        self.scheduler.shutdown();
        pump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{fake::FakeClientFactory, kinds::new_object},
        lifecycle::ssh::MockRemoteExecutor,
        providers::{MockHostProvider, RecordingAuditSink, ServerInfo, ServerNetwork},
    };
    use kubefleet_apis::{
        ClusterKeyPair, JointStatus, MachineResourceType, MachineRole, MachineStatus, Record,
        ResourceStatus, TaskStatus,
    };
    use serde_json::json;
    use std::{collections::HashSet, sync::Mutex as StdMutex};

    struct Fixture {
        control: Arc<Control>,
        factory: Arc<FakeClientFactory>,
        store: Arc<MemoryStore>,
        audit: Arc<RecordingAuditSink>,
    }

    /// Servers boot instantly and vanish once deleted.
    fn hosts() -> MockHostProvider {
        let deleted = Arc::new(StdMutex::new(HashSet::<String>::new()));
        let mut hosts = MockHostProvider::new();
        hosts
            .expect_create_server()
            .withf(|input| {
                input
                    .user_data
                    .as_deref()
                    .and_then(|d| crate::lifecycle::userdata::decode(d).ok())
                    .is_some_and(|script| script.contains("kubeadm"))
            })
            .returning(|input| {
                Ok(ServerInfo {
                    id: format!("srv-{}", input.name),
                    name: input.name.clone(),
                    status: "running".to_string(),
                })
            });
        let gone = deleted.clone();
        hosts.expect_get_server().returning(move |id| {
            if gone.lock().unwrap().contains(id) {
                return Err(Error::NotFound(format!("server {} not found", id)));
            }
            Ok(ServerInfo {
                id: id.to_string(),
                name: id.to_string(),
                status: "running".to_string(),
            })
        });
        hosts.expect_delete_server().returning(move |id, _| {
            deleted.lock().unwrap().insert(id.to_string());
            Ok(())
        });
        hosts.expect_list_server_networks().returning(|_| {
            Ok(vec![ServerNetwork {
                ip_addr: "10.0.0.11".to_string(),
                is_public: false,
            }])
        });
        hosts
            .expect_get_cloud_ssh_private_key()
            .returning(|| Ok("cloud-key".to_string()));
        hosts
    }

    fn executor() -> MockRemoteExecutor {
        let mut executor = MockRemoteExecutor::new();
        executor.expect_probe().returning(|_, _| Ok(()));
        executor.expect_run().returning(|_, _| Ok(String::new()));
        executor
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let audit = Arc::new(RecordingAuditSink::default());
        let control = ControlBuilder::new(Configuration::default())
            .store(store.clone())
            .client_factory(factory.clone())
            .hosts(Arc::new(hosts()))
            .executor(Arc::new(executor()))
            .audit(audit.clone())
            .build()
            .unwrap();
        Fixture {
            control,
            factory,
            store,
            audit,
        }
    }

    fn vm(name: &str, role: MachineRole) -> MachineCreateInput {
        MachineCreateInput {
            name: name.to_string(),
            role,
            resource_type: MachineResourceType::Vm,
            resource_id: None,
            vm_config: None,
        }
    }

    fn customize(name: &str, machines: Vec<MachineCreateInput>) -> ClusterCreateInput {
        let mut input: ClusterCreateInput = serde_json::from_value(json!({
            "name": name,
            "provider": "onecloud",
            "mode": "customize",
        }))
        .unwrap();
        input.machines = machines;
        input
    }

    fn import(name: &str) -> ClusterCreateInput {
        serde_json::from_value(json!({
            "name": name,
            "provider": "system",
            "mode": "import",
            "kubeconfig": format!("kubeconfig-{}", name),
        }))
        .unwrap()
    }

    async fn create(f: &Fixture, input: &ClusterCreateInput) -> Cluster {
        let (cluster, task) = f
            .control
            .create_cluster(&UserCred::system(), input)
            .await
            .unwrap();
        let done = f.control.wait_task(&task.unwrap().base.id).await.unwrap();
        assert_eq!(TaskStatus::Complete, done.status, "{:?}", done.status_reason);
        f.store.fetch(&cluster.base.id).await.unwrap()
    }

    async fn machine(f: &Fixture, cluster: &Cluster, name: &str) -> Machine {
        f.store
            .find(
                &Query::new()
                    .eq("cluster_id", &cluster.base.id)
                    .eq("name", name),
            )
            .await
            .unwrap()
            .unwrap()
    }

    async fn namespace_fed(f: &Fixture) -> FederatedResource {
        f.control
            .create_federated(&FederatedCreateInput {
                kind: FederatedKind::Namespace,
                name: "team-a".to_string(),
                namespace: None,
                template: json!({"spec": {}}),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn customize_cluster_comes_up_with_its_first_controlplane() {
        let f = fixture();
        let cluster = create(&f, &customize("c1", vec![vm("m1", MachineRole::ControlPlane)])).await;
        assert_eq!(ClusterStatus::Running, cluster.status);
        assert!(cluster.kubeconfig.is_some());
        assert_eq!(Some("https://10.0.0.11:6443"), cluster.api_server.as_deref());
        assert_eq!(5, f.store.count(ClusterKeyPair::KIND));
        let token = regex::Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").unwrap();
        assert!(token.is_match(cluster.bootstrap_token.as_deref().unwrap()));

        let m1 = machine(&f, &cluster, "m1").await;
        assert_eq!(MachineStatus::Running, m1.status);
        assert!(m1.is_first_node);
        assert_eq!(Some("srv-c1-m1"), m1.resource_id.as_deref());
        assert!(m1.user_data.as_deref().unwrap().contains("kubeadm init"));
        assert!(f.control.registry().contains(&cluster.base.id).await);
        assert!(!f.factory.backend(&cluster.base.id).applied().is_empty());
    }

    #[tokio::test]
    async fn worker_joins_a_running_cluster() {
        let f = fixture();
        let cluster = create(&f, &customize("c1", vec![vm("m1", MachineRole::ControlPlane)])).await;
        let (m2, task) = f
            .control
            .add_machine(&UserCred::system(), &cluster.base.id, &vm("m2", MachineRole::Node))
            .await
            .unwrap();
        assert!(!m2.is_first_node);
        let done = f.control.wait_task(&task.base.id).await.unwrap();
        assert_eq!(TaskStatus::Complete, done.status, "{:?}", done.status_reason);

        let m2: Machine = f.store.fetch(&m2.base.id).await.unwrap();
        assert_eq!(MachineStatus::Running, m2.status);
        let script = m2.user_data.unwrap();
        assert!(script.contains("kubeadm join"));
        assert!(!script.contains("kubeadm init"));
        assert!(script.contains(cluster.bootstrap_token.as_deref().unwrap()));
        let after: Cluster = f.store.fetch(&cluster.base.id).await.unwrap();
        assert_eq!(cluster.status, after.status);
        assert_eq!(cluster.kubeconfig, after.kubeconfig);

        let first = machine(&f, &cluster, "m1").await;
        assert!(matches!(
            f.control.delete_machine(&UserCred::system(), &first.base.id).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn empty_customize_cluster_waits_for_a_controlplane() {
        let f = fixture();
        let (cluster, task) = f
            .control
            .create_cluster(&UserCred::system(), &customize("c1", vec![]))
            .await
            .unwrap();
        assert!(task.is_none());
        assert_eq!(ClusterStatus::Init, cluster.status);
        let (m1, task) = f
            .control
            .add_machine(&UserCred::system(), &cluster.base.id, &vm("m1", MachineRole::ControlPlane))
            .await
            .unwrap();
        assert!(m1.is_first_node);
        assert_eq!(Cluster::KIND, task.owner_kind);
        f.control.wait_task(&task.base.id).await.unwrap();
        let cluster: Cluster = f.store.fetch(&cluster.base.id).await.unwrap();
        assert_eq!(ClusterStatus::Running, cluster.status);
    }

    #[tokio::test]
    async fn federated_namespace_follows_attachments() {
        let f = fixture();
        let c1 = create(&f, &import("c1")).await;
        let c2 = create(&f, &import("c2")).await;
        assert_eq!("v1.15.12", c1.version);
        let fed = namespace_fed(&f).await;
        f.control.attach_federated(&fed.base.id, &c1.base.id).await.unwrap();
        f.control.attach_federated(&fed.base.id, &c2.base.id).await.unwrap();
        for cluster in [&c1, &c2] {
            let backend = f.factory.backend(&cluster.base.id);
            assert!(backend.object(ResourceKind::Namespace, None, "team-a").is_some());
        }
        let joints = f.control.federated_joints(&fed.base.id).await.unwrap();
        assert_eq!(2, joints.len());
        assert!(joints.iter().all(|j| j.status == JointStatus::Synced));

        f.control.detach_federated(&fed.base.id, &c2.base.id).await.unwrap();
        let joints = f.control.federated_joints(&fed.base.id).await.unwrap();
        assert_eq!(vec![c1.base.id.clone()], joints.iter().map(|j| j.cluster_id.clone()).collect::<Vec<_>>());
        assert!(
            f.factory
                .backend(&c2.base.id)
                .object(ResourceKind::Namespace, None, "team-a")
                .is_some()
        );
    }

    #[tokio::test]
    async fn deleted_federated_role_is_recreated() {
        let f = fixture();
        let c1 = create(&f, &import("c1")).await;
        let ns = namespace_fed(&f).await;
        f.control.attach_federated(&ns.base.id, &c1.base.id).await.unwrap();
        let role = f
            .control
            .create_federated(&FederatedCreateInput {
                kind: FederatedKind::Role,
                name: "reader".to_string(),
                namespace: Some("team-a".to_string()),
                template: json!({"rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get"]}]}),
            })
            .await
            .unwrap();
        let joint = f.control.attach_federated(&role.base.id, &c1.base.id).await.unwrap();
        let old_uid = joint.resource_id.clone().unwrap();

        let backend = f.factory.backend(&c1.base.id);
        let gone = backend
            .remove(ResourceKind::Role, Some("team-a"), "reader")
            .unwrap();
        f.control
            .handle_event(InformerEvent::Deleted {
                cluster_id: c1.base.id.clone(),
                kind: ResourceKind::Role,
                object: gone,
            })
            .await
            .unwrap();

        let recreated = backend
            .object(ResourceKind::Role, Some("team-a"), "reader")
            .unwrap();
        let joint: FederatedJointCluster = f.store.fetch(&joint.base.id).await.unwrap();
        assert_eq!(recreated.metadata.uid, joint.resource_id);
        assert_ne!(Some(old_uid), joint.resource_id);
        assert_eq!(JointStatus::Synced, joint.status);

        backend.remove(ResourceKind::Role, Some("team-a"), "reader");
        assert_eq!(2, f.control.reconcile_federated(&c1.base.id).await.unwrap());
        assert!(backend.object(ResourceKind::Role, Some("team-a"), "reader").is_some());
    }

    #[tokio::test]
    async fn pod_delete_event_removes_the_row() {
        let f = fixture();
        let c1 = create(&f, &import("c1")).await;
        let backend = f.factory.backend(&c1.base.id);
        let pod = backend.insert(
            ResourceKind::Pod,
            new_object(ResourceKind::Pod, Some("default"), "web-0").unwrap(),
        );
        let events = f.control.events();
        let shutdown = CancellationToken::new();
        let pump = {
            let control = f.control.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { control.run_event_pump(shutdown).await })
        };
        events
            .send(InformerEvent::Applied {
                cluster_id: c1.base.id.clone(),
                kind: ResourceKind::Pod,
                object: pod.clone(),
            })
            .await
            .unwrap();
        let gone = backend.remove(ResourceKind::Pod, Some("default"), "web-0").unwrap();
        events
            .send(InformerEvent::Deleted {
                cluster_id: c1.base.id.clone(),
                kind: ResourceKind::Pod,
                object: gone,
            })
            .await
            .unwrap();
        // The pump applies events in order; wait for the delete to land.
        let deleted = ("delete".to_string(), "web-0".to_string(), true);
        while !f.audit.actions().contains(&deleted) {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        pump.await.unwrap().unwrap();

        let rows: Vec<ClusterResource> = f
            .store
            .list(&Query::new().eq("kind", ResourceKind::Pod))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(matches!(
            f.control.run_event_pump(CancellationToken::new()).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn resync_converges_without_events() {
        let f = fixture();
        let c1 = create(&f, &import("c1")).await;
        let backend = f.factory.backend(&c1.base.id);
        backend.insert(
            ResourceKind::Namespace,
            new_object(ResourceKind::Namespace, None, "apps").unwrap(),
        );
        backend.insert(
            ResourceKind::Pod,
            new_object(ResourceKind::Pod, Some("apps"), "web-0").unwrap(),
        );
        let client = f.control.registry().get(&c1.base.id).await.unwrap();
        client
            .helm_install(&crate::client::HelmInstall {
                name: "web".to_string(),
                namespace: "apps".to_string(),
                chart: b"nginx".to_vec(),
                values: Value::Null,
                atomic: true,
                replace: true,
            })
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let resync = {
            let control = f.control.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                control
                    .run_resync_loop(Duration::from_millis(5), shutdown)
                    .await
            })
        };
        let pods = Query::new().eq("kind", ResourceKind::Pod);
        let releases = Query::new().eq("kind", ResourceKind::Release);
        while f.store.find::<ClusterResource>(&pods).await.unwrap().is_none()
            || f.store.find::<ClusterResource>(&releases).await.unwrap().is_none()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        backend.remove(ResourceKind::Pod, Some("apps"), "web-0");
        backend.set_release_status("apps", "web", "failed");
        loop {
            let pod: Option<ClusterResource> = f.store.find(&pods).await.unwrap();
            let release: Option<ClusterResource> = f.store.find(&releases).await.unwrap();
            if pod.is_none() && release.is_some_and(|r| r.status == ResourceStatus::DeployFail) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        resync.await.unwrap();
        assert_eq!(1, backend.releases().len());
    }

    #[tokio::test]
    async fn kubeconfig_change_swaps_the_client() {
        let f = fixture();
        let c1 = create(&f, &import("c1")).await;
        let registry = f.control.registry();
        let old = registry.get(&c1.base.id).await.unwrap();
        f.store
            .modify::<Cluster, _>(&c1.base.id, |c| {
                c.kubeconfig = Some("kubeconfig-rotated".to_string());
                Ok(())
            })
            .await
            .unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let control = f.control.clone();
                let id = c1.base.id.clone();
                tokio::spawn(async move { control.registry().get(&id).await })
            })
            .collect();
        registry.refresh().await.unwrap();
        for reader in readers {
            assert!(reader.await.unwrap().is_ok());
        }

        assert!(old.is_closed());
        let new = registry.get(&c1.base.id).await.unwrap();
        assert!(!new.is_closed());
        assert!(!Arc::ptr_eq(&old, &new));
    }

    #[tokio::test]
    async fn deleting_a_cluster_removes_its_rows() {
        let f = fixture();
        let cluster = create(
            &f,
            &customize(
                "c1",
                vec![vm("m1", MachineRole::ControlPlane), vm("w1", MachineRole::Node)],
            ),
        )
        .await;
        assert_eq!(2, f.store.count(Machine::KIND));
        let task = f
            .control
            .delete_cluster(&UserCred::system(), &cluster.base.id)
            .await
            .unwrap();
        let done = f.control.wait_task(&task.base.id).await.unwrap();
        assert_eq!(TaskStatus::Complete, done.status, "{:?}", done.status_reason);
        assert!(
            f.store
                .fetch::<Cluster>(&cluster.base.id)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(0, f.store.count(Machine::KIND));
        assert_eq!(0, f.store.count(ClusterKeyPair::KIND));
        assert!(!f.control.registry().contains(&cluster.base.id).await);
    }
}
