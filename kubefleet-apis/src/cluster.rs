use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{MachineCreateInput, ObjectBase, Record};

closed_enum! {
    /// Infrastructure a cluster (and its machines) comes from.
    pub enum ClusterProvider {
        System => "system",
        OneCloud => "onecloud",
        Aws => "aws",
        Aliyun => "aliyun",
        Azure => "azure",
        Qcloud => "qcloud",
    }
}

closed_enum! {
    pub enum ClusterMode {
        /// Machines are provisioned and bootstrapped with kubeadm by us.
        Customize => "customize",
        /// A provider-hosted control plane.
        Managed => "managed",
        /// An existing cluster reached through a supplied kubeconfig.
        Import => "import",
    }
}

closed_enum! {
    pub enum ClusterStatus {
        Init => "init",
        Creating => "creating",
        CreateFail => "create_fail",
        Running => "running",
        Unknown => "unknown",
        Deleting => "deleting",
        DeleteFail => "delete_fail",
    }
}

impl ClusterStatus {
    /// States from which a create or delete may be (re)started.
    pub fn permits_retry(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Init
                | ClusterStatus::CreateFail
                | ClusterStatus::DeleteFail
                | ClusterStatus::Unknown
        )
    }
}

/// One managed Kubernetes cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Cluster {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub provider: ClusterProvider,
    pub mode: ClusterMode,
    pub version: String,
    pub service_cidr: String,
    pub pod_cidr: String,
    pub service_domain: String,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// `https://host:port` of the kube-apiserver, once known.
    #[serde(default)]
    pub api_server: Option<String>,
    /// Admin kubeconfig, stored verbatim.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// kubeadm bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`.
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    /// Load balancer in front of the control plane, if any.
    #[serde(default)]
    pub lb_address: Option<String>,
    /// Image mirror used when rendering add-on values.
    #[serde(default)]
    pub image_repository: Option<String>,
}

impl Record for Cluster {
    const KIND: &'static str = "clusters";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl Cluster {
    pub fn new(input: &ClusterCreateInput) -> Self {
        Self {
            base: ObjectBase::new(input.name.as_str()),
            provider: input.provider,
            mode: input.mode,
            version: input.version.clone(),
            service_cidr: input.service_cidr.clone(),
            pod_cidr: input.pod_cidr.clone(),
            service_domain: input.service_domain.clone(),
            status: ClusterStatus::Init,
            status_reason: None,
            api_server: None,
            kubeconfig: input.kubeconfig.clone(),
            bootstrap_token: None,
            lb_address: input.lb_address.clone(),
            image_repository: input.image_repository.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ClusterStatus::Running
    }

    /// Human readable identity used in log lines and error contexts.
    pub fn ident(&self) -> String {
        format!("{}({})", self.base.name, self.base.id)
    }
}

/// Request to create a cluster, validated by the cluster driver.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterCreateInput {
    pub name: String,
    pub provider: ClusterProvider,
    pub mode: ClusterMode,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    #[serde(default = "default_service_domain")]
    pub service_domain: String,
    /// Required for `import` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,
    #[serde(default)]
    pub machines: Vec<MachineCreateInput>,
}

fn default_version() -> String {
    "v1.15.12".to_string()
}

fn default_service_cidr() -> String {
    "10.43.0.0/16".to_string()
}

fn default_pod_cidr() -> String {
    "10.44.0.0/16".to_string()
}

fn default_service_domain() -> String {
    "cluster.local".to_string()
}

closed_enum! {
    /// The five keypairs a customized cluster is bootstrapped with.
    pub enum KeyPairPurpose {
        RootCa => "ca",
        EtcdCa => "etcd",
        FrontProxyCa => "front-proxy",
        ServiceAccount => "sa",
        Admin => "admin",
    }
}

/// A PEM keypair owned by a cluster. For the service-account entry `cert`
/// holds the PEM public key rather than a certificate.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClusterKeyPair {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub cluster_id: String,
    pub purpose: KeyPairPurpose,
    pub cert: String,
    pub key: String,
}

impl Record for ClusterKeyPair {
    const KIND: &'static str = "cluster_keypairs";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

/// The complete set of cluster keypairs, in [`KeyPairPurpose`] order.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPairSet {
    pub root_ca: ClusterKeyPair,
    pub etcd_ca: ClusterKeyPair,
    pub front_proxy_ca: ClusterKeyPair,
    pub service_account: ClusterKeyPair,
    pub admin: ClusterKeyPair,
}

impl KeyPairSet {
    pub fn into_vec(self) -> Vec<ClusterKeyPair> {
        vec![
            self.root_ca,
            self.etcd_ca,
            self.front_proxy_ca,
            self.service_account,
            self.admin,
        ]
    }

    /// Reassemble a set from stored rows, `None` if any purpose is missing.
    pub fn from_rows(rows: Vec<ClusterKeyPair>) -> Option<Self> {
        let find = |purpose: KeyPairPurpose| {
            rows.iter().find(|r| r.purpose == purpose).cloned()
        };
        Some(Self {
            root_ca: find(KeyPairPurpose::RootCa)?,
            etcd_ca: find(KeyPairPurpose::EtcdCa)?,
            front_proxy_ca: find(KeyPairPurpose::FrontProxyCa)?,
            service_account: find(KeyPairPurpose::ServiceAccount)?,
            admin: find(KeyPairPurpose::Admin)?,
        })
    }
}
