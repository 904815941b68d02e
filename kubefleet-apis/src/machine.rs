use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ClusterProvider, ObjectBase, Record};

closed_enum! {
    pub enum MachineRole {
        ControlPlane => "controlplane",
        Node => "node",
    }
}

closed_enum! {
    pub enum MachineResourceType {
        Vm => "vm",
        Baremetal => "baremetal",
    }
}

closed_enum! {
    pub enum MachineStatus {
        Init => "init",
        Creating => "creating",
        CreateFail => "create_fail",
        Prepare => "prepare",
        PrepareFail => "prepare_fail",
        Running => "running",
        /// Running and the Node object reports `Ready=True`.
        Ready => "ready",
        Deleting => "deleting",
        DeleteFail => "delete_fail",
        Terminating => "terminating",
        TerminateFail => "terminate_fail",
    }
}

impl MachineStatus {
    /// Whether the node has joined the cluster.
    pub fn is_running(&self) -> bool {
        matches!(self, MachineStatus::Running | MachineStatus::Ready)
    }
}

/// VM sizing passed through to the host provider.
#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
pub struct VmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,
}

/// One node of a cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Machine {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub cluster_id: String,
    pub role: MachineRole,
    pub resource_type: MachineResourceType,
    pub provider: ClusterProvider,
    /// Opaque handle of the server/host at the provider.
    #[serde(default)]
    pub resource_id: Option<String>,
    pub is_first_node: bool,
    /// Private address the node registers with.
    #[serde(default)]
    pub address: Option<String>,
    pub status: MachineStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// The rendered bootstrap script, kept for inspection.
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub vm_config: Option<VmConfig>,
}

impl Record for Machine {
    const KIND: &'static str = "machines";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl Machine {
    pub fn new(cluster_id: &str, provider: ClusterProvider, input: &MachineCreateInput) -> Self {
        Self {
            base: ObjectBase::new(input.name.as_str()),
            cluster_id: cluster_id.to_string(),
            role: input.role,
            resource_type: input.resource_type,
            provider,
            resource_id: input.resource_id.clone(),
            is_first_node: false,
            address: None,
            status: MachineStatus::Init,
            status_reason: None,
            user_data: None,
            vm_config: input.vm_config.clone(),
        }
    }

    pub fn is_controlplane(&self) -> bool {
        self.role == MachineRole::ControlPlane
    }

    pub fn ident(&self) -> String {
        format!("{}({})", self.base.name, self.base.id)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct MachineCreateInput {
    pub name: String,
    pub role: MachineRole,
    #[serde(default = "default_resource_type")]
    pub resource_type: MachineResourceType,
    /// Pre-existing host for baremetal machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_config: Option<VmConfig>,
}

fn default_resource_type() -> MachineResourceType {
    MachineResourceType::Vm
}
