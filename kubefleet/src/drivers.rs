//! Provider pluggable behaviour, looked up by key.
//!
//! Registering a second driver for a key fails. Looking up a key nobody
//! registered returns `Unsupported`. The registry is built once and then
//! shared read-only.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use kubefleet_apis::{
    Cluster, ClusterCreateInput, ClusterProvider, ComponentSettings, ComponentType, Machine,
    MachineCreateInput, MachineResourceType, ReleaseCreateInput, RepoType, UserCred,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Configuration,
    errors::{Error, Result},
};

/// Provisions the servers or hosts machines run on.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    fn provider(&self) -> ClusterProvider;

    fn resource_type(&self) -> MachineResourceType;

    async fn validate_create(&self, cluster: &Cluster, input: &MachineCreateInput) -> Result<()>;

    /// Whether the bootstrap script rides along the create request. Other
    /// machines get it piped over ssh once reachable.
    fn boots_with_user_data(&self) -> bool {
        false
    }

    /// Allocates the server or host and returns its resource id.
    async fn create_resource(&self, cluster: &Cluster, machine: &Machine) -> Result<String>;

    /// Waits until the resource is reachable over ssh and returns its
    /// private address.
    async fn wait_resource(&self, machine: &Machine, cancel: &CancellationToken)
    -> Result<String>;

    /// Runs the bootstrap script on the machine as the ssh user, or waits
    /// for the script handed over at create time to finish.
    async fn run_bootstrap(&self, machine: &Machine, address: &str, script: &str) -> Result<()>;

    /// Releases the resource. A machine without resource id is a no-op.
    async fn terminate_resource(&self, machine: &Machine, cancel: &CancellationToken)
    -> Result<()>;
}

/// Cluster level behaviour of a provider.
pub trait ClusterDriver: Send + Sync {
    fn provider(&self) -> ClusterProvider;

    fn validate_create(&self, input: &ClusterCreateInput) -> Result<()>;

    /// Manifests applied once the control plane is up (CNI, cloud
    /// integration). Empty for imported clusters.
    fn addon_manifests(&self, cluster: &Cluster, config: &Configuration) -> Result<Vec<String>>;
}

/// How a component type maps onto a bundled chart.
pub trait ComponentDriver: Send + Sync {
    fn component_type(&self) -> ComponentType;

    fn validate(&self, settings: &ComponentSettings) -> Result<()>;

    /// Key of the embedded chart, e.g. `FLUENT_BIT_2_8_12_TGZ`.
    fn chart_key(&self) -> &'static str;

    fn release_name(&self) -> &'static str;

    fn namespace(&self) -> &'static str;

    /// Helm values for `settings`, with images pulled from `image_repository`.
    fn values(
        &self,
        cluster: &Cluster,
        settings: &ComponentSettings,
        image_repository: &str,
    ) -> Result<Value>;
}

/// Renders typed secrets.
pub trait SecretDriver: Send + Sync {
    /// The kubernetes secret `type`.
    fn secret_type(&self) -> &'static str;

    fn validate(&self, params: &Value) -> Result<()>;

    /// The secret's `data`, base64 encoded.
    fn render(&self, params: &Value) -> Result<BTreeMap<String, String>>;
}

/// Admission of release installs per repository type.
#[async_trait]
pub trait ReleaseDriver: Send + Sync {
    fn repo_type(&self) -> RepoType;

    async fn validate_create(&self, cred: &UserCred, input: &ReleaseCreateInput) -> Result<()>;
}

#[derive(Default)]
pub struct DriverRegistry {
    machines: HashMap<(ClusterProvider, MachineResourceType), Arc<dyn MachineDriver>>,
    clusters: HashMap<ClusterProvider, Arc<dyn ClusterDriver>>,
    components: HashMap<ComponentType, Arc<dyn ComponentDriver>>,
    secrets: HashMap<String, Arc<dyn SecretDriver>>,
    releases: HashMap<RepoType, Arc<dyn ReleaseDriver>>,
}

fn register<K, V>(table: &mut HashMap<K, V>, key: K, driver: V, what: &str) -> Result<()>
where
    K: std::hash::Hash + Eq + std::fmt::Debug,
{
    if table.contains_key(&key) {
        return Err(Error::Conflict(format!(
            "{} driver for {:?} already registered",
            what, key
        )));
    }
    table.insert(key, driver);
    Ok(())
}

fn lookup<K, V>(table: &HashMap<K, V>, key: &K, what: &str) -> Result<V>
where
    K: std::hash::Hash + Eq + std::fmt::Debug,
    V: Clone,
{
    table
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Unsupported(format!("unsupported {} {:?}", what, key)))
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_machine(&mut self, driver: Arc<dyn MachineDriver>) -> Result<()> {
        let key = (driver.provider(), driver.resource_type());
        register(&mut self.machines, key, driver, "machine")
    }

    pub fn register_cluster(&mut self, driver: Arc<dyn ClusterDriver>) -> Result<()> {
        register(&mut self.clusters, driver.provider(), driver, "cluster")
    }

    pub fn register_component(&mut self, driver: Arc<dyn ComponentDriver>) -> Result<()> {
        register(
            &mut self.components,
            driver.component_type(),
            driver,
            "component",
        )
    }

    pub fn register_secret(&mut self, driver: Arc<dyn SecretDriver>) -> Result<()> {
        register(
            &mut self.secrets,
            driver.secret_type().to_string(),
            driver,
            "secret",
        )
    }

    pub fn register_release(&mut self, driver: Arc<dyn ReleaseDriver>) -> Result<()> {
        register(&mut self.releases, driver.repo_type(), driver, "release")
    }

    pub fn machine(
        &self,
        provider: ClusterProvider,
        resource_type: MachineResourceType,
    ) -> Result<Arc<dyn MachineDriver>> {
        lookup(&self.machines, &(provider, resource_type), "machine provider")
    }

    pub fn cluster(&self, provider: ClusterProvider) -> Result<Arc<dyn ClusterDriver>> {
        lookup(&self.clusters, &provider, "cluster provider")
    }

    pub fn component(&self, component_type: ComponentType) -> Result<Arc<dyn ComponentDriver>> {
        lookup(&self.components, &component_type, "component type")
    }

    pub fn secret(&self, secret_type: &str) -> Result<Arc<dyn SecretDriver>> {
        lookup(&self.secrets, &secret_type.to_string(), "secret type")
    }

    pub fn release(&self, repo_type: RepoType) -> Result<Arc<dyn ReleaseDriver>> {
        lookup(&self.releases, &repo_type, "repo type")
    }
}
