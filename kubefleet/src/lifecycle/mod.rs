//! Cluster and machine lifecycle.
//!
//! Clusters go `init → creating → running → deleting`, machines go
//! `init → creating → prepare → running → deleting`. The transitions are
//! driven by the task handlers in [`tasks`]. The engine holds the shared
//! state and the checks callers run before rows are filed.

use std::sync::Arc;

use kube::{ResourceExt, api::DynamicObject};
use kubefleet_apis::{
    Cluster, ClusterCreateInput, ClusterKeyPair, ClusterMode, ClusterStatus, KeyPairSet, Machine,
    MachineCreateInput, MachineRole, MachineStatus, Record, ResourceKind,
};

use crate::{
    addons::AddonInstaller,
    config::Configuration,
    drivers::DriverRegistry,
    errors::{Error, Result},
    locks::{LockGuard, LockManager},
    reconciler::{Reconciler, RemoteObject},
    registry::ClusterRegistry,
    store::{Query, Store, StoreExt, Transaction},
};

mod clusters;
mod machines;
pub mod pki;
pub mod ssh;
pub mod tasks;
pub mod token;
pub mod userdata;

pub use clusters::{OneCloudClusterDriver, SystemClusterDriver};
pub use machines::{BaremetalDriver, MachineTimings, VmDriver};

const APISERVER_PORT: u16 = 6443;

pub struct LifecycleEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<ClusterRegistry>,
    pub(crate) drivers: Arc<DriverRegistry>,
    pub(crate) locks: LockManager,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) installer: Arc<AddonInstaller>,
    pub(crate) config: Configuration,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ClusterRegistry>,
        drivers: Arc<DriverRegistry>,
        locks: LockManager,
        reconciler: Arc<Reconciler>,
        installer: Arc<AddonInstaller>,
        config: Configuration,
    ) -> Self {
        Self {
            store,
            registry,
            drivers,
            locks,
            reconciler,
            installer,
            config,
        }
    }

    pub async fn validate_cluster_create(&self, input: &ClusterCreateInput) -> Result<()> {
        self.drivers.cluster(input.provider)?.validate_create(input)?;
        let existing: Option<Cluster> = self
            .store
            .find(&Query::new().eq("name", &input.name))
            .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "cluster {} already exists",
                input.name
            )));
        }
        let cluster = Cluster::new(input);
        for machine in &input.machines {
            self.drivers
                .machine(input.provider, machine.resource_type)?
                .validate_create(&cluster, machine)
                .await?;
        }
        Ok(())
    }

    /// Files the cluster and its machines. The first controlplane becomes
    /// the first node.
    pub async fn new_cluster(&self, input: &ClusterCreateInput) -> Result<(Cluster, Vec<Machine>)> {
        let cluster = Cluster::new(input);
        let mut machines: Vec<Machine> = input
            .machines
            .iter()
            .map(|m| Machine::new(&cluster.base.id, cluster.provider, m))
            .collect();
        if let Some(first) = machines.iter_mut().find(|m| m.is_controlplane()) {
            first.is_first_node = true;
        }
        let mut tx = Transaction::new();
        tx.insert(&cluster)?;
        for machine in &machines {
            tx.insert(machine)?;
        }
        self.store.commit(tx).await?;
        info!(
            "filed cluster {} with {} machines",
            cluster.ident(),
            machines.len()
        );
        Ok((cluster, machines))
    }

    pub async fn machines(&self, cluster_id: &str) -> Result<Vec<Machine>> {
        self.store
            .list(&Query::new().eq("cluster_id", cluster_id))
            .await
    }

    pub async fn first_node(&self, cluster_id: &str) -> Result<Option<Machine>> {
        self.store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("is_first_node", true),
            )
            .await
    }

    /// A machine may join once the first controlplane runs. A cluster
    /// without machines only accepts a controlplane, which becomes its
    /// first node.
    pub async fn validate_machine_create(
        &self,
        cluster: &Cluster,
        input: &MachineCreateInput,
    ) -> Result<()> {
        if cluster.mode != ClusterMode::Customize {
            return Err(Error::Validation(format!(
                "cannot add machines to {} cluster {}",
                cluster.mode,
                cluster.ident()
            )));
        }
        if matches!(
            cluster.status,
            ClusterStatus::Deleting | ClusterStatus::DeleteFail
        ) {
            return Err(Error::Validation(format!(
                "cluster {} is {}",
                cluster.ident(),
                cluster.status
            )));
        }
        let machines = self.machines(&cluster.base.id).await?;
        if machines.iter().any(|m| m.base.name == input.name) {
            return Err(Error::Conflict(format!(
                "machine {} already exists in cluster {}",
                input.name,
                cluster.ident()
            )));
        }
        match machines.iter().find(|m| m.is_first_node) {
            Some(first) if !first.status.is_running() => {
                return Err(Error::Validation(format!(
                    "first controlplane {} of cluster {} is {}",
                    first.ident(),
                    cluster.ident(),
                    first.status
                )));
            }
            Some(_) => (),
            None if input.role != MachineRole::ControlPlane => {
                return Err(Error::Validation(format!(
                    "the first machine of cluster {} must be a controlplane",
                    cluster.ident()
                )));
            }
            None => (),
        }
        self.drivers
            .machine(cluster.provider, input.resource_type)?
            .validate_create(cluster, input)
            .await
    }

    /// Serializes machine filing within a cluster. Hold it across
    /// [`Self::validate_machine_create`] and [`Self::new_machine`] so only
    /// one machine becomes the first node.
    pub async fn lock_machines(&self, cluster_id: &str) -> LockGuard {
        let holder = format!("machine-create/{}", uuid::Uuid::new_v4());
        self.locks
            .lock_class(Machine::KIND, cluster_id, &holder)
            .await
    }

    pub async fn new_machine(&self, cluster: &Cluster, input: &MachineCreateInput) -> Result<Machine> {
        let mut machine = Machine::new(&cluster.base.id, cluster.provider, input);
        machine.is_first_node = self.first_node(&cluster.base.id).await?.is_none();
        self.store.create(&machine).await?;
        info!(
            "filed machine {} in cluster {}",
            machine.ident(),
            cluster.ident()
        );
        Ok(machine)
    }

    pub async fn keypairs(&self, cluster_id: &str) -> Result<KeyPairSet> {
        let rows: Vec<ClusterKeyPair> = self
            .store
            .list(&Query::new().eq("cluster_id", cluster_id))
            .await?;
        KeyPairSet::from_rows(rows)
            .ok_or_else(|| Error::NotFound(format!("keypairs of cluster {} not found", cluster_id)))
    }

    /// Generates the keypairs and the bootstrap token unless stored.
    pub(crate) async fn ensure_credentials(&self, cluster: &Cluster) -> Result<Cluster> {
        match self.keypairs(&cluster.base.id).await {
            Ok(_) => (),
            Err(e) if e.is_not_found() => {
                let keypairs = pki::generate_keypairs(&cluster.base.id)?;
                let mut tx = Transaction::new();
                for row in keypairs.into_vec() {
                    tx.insert(&row)?;
                }
                self.store.commit(tx).await?;
                info!("generated keypairs of cluster {}", cluster.ident());
            }
            Err(e) => return Err(e),
        }
        if cluster.bootstrap_token.is_some() {
            return Ok(cluster.clone());
        }
        let token = token::bootstrap_token();
        self.store
            .modify::<Cluster, _>(&cluster.base.id, move |c| {
                c.bootstrap_token.get_or_insert(token);
                Ok(())
            })
            .await
    }

    /// Host the control plane is reached at.
    pub(crate) fn endpoint(cluster: &Cluster, first: &Machine) -> Result<String> {
        cluster
            .lb_address
            .clone()
            .or_else(|| first.address.clone())
            .ok_or_else(|| {
                Error::Driver(format!(
                    "cluster {} has no control plane address yet",
                    cluster.ident()
                ))
            })
    }

    pub(crate) fn api_server(endpoint: &str) -> String {
        format!("https://{}:{}", endpoint, APISERVER_PORT)
    }

    pub(crate) async fn set_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        reason: Option<String>,
    ) -> Result<Cluster> {
        self.store
            .modify::<Cluster, _>(cluster_id, move |c| {
                c.status = status;
                c.status_reason = reason;
                Ok(())
            })
            .await
    }

    pub(crate) async fn set_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
        reason: Option<String>,
    ) -> Result<Machine> {
        self.store
            .modify::<Machine, _>(machine_id, move |m| {
                m.status = status;
                m.status_reason = reason;
                Ok(())
            })
            .await
    }

    /// Moves a joined machine between `running` and `ready` after its Node.
    pub async fn on_node_event(&self, cluster_id: &str, node: &DynamicObject, deleted: bool) -> Result<()> {
        let machine: Option<Machine> = self
            .store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("name", node.name_any()),
            )
            .await?;
        let Some(machine) = machine else {
            return Ok(());
        };
        let ready = !deleted
            && RemoteObject::from_object(ResourceKind::Node, node)?
                .phase
                .as_deref()
                == Some("Ready");
        let next = if ready {
            MachineStatus::Ready
        } else {
            MachineStatus::Running
        };
        if !machine.status.is_running() || machine.status == next {
            return Ok(());
        }
        self.store
            .modify::<Machine, _>(&machine.base.id, move |m| {
                if m.status.is_running() {
                    m.status = next;
                }
                Ok(())
            })
            .await?;
        debug!("machine {} is {}", machine.ident(), next);
        Ok(())
    }
}
