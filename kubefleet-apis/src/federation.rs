use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ObjectBase, Record, ResourceKind};

closed_enum! {
    pub enum FederatedKind {
        Namespace => "federatednamespaces",
        Role => "federatedroles",
        RoleBinding => "federatedrolebindings",
        ClusterRole => "federatedclusterroles",
        ClusterRoleBinding => "federatedclusterrolebindings",
    }
}

impl FederatedKind {
    /// The member-cluster kind a template materializes as.
    pub fn target(&self) -> ResourceKind {
        match self {
            FederatedKind::Namespace => ResourceKind::Namespace,
            FederatedKind::Role => ResourceKind::Role,
            FederatedKind::RoleBinding => ResourceKind::RoleBinding,
            FederatedKind::ClusterRole => ResourceKind::ClusterRole,
            FederatedKind::ClusterRoleBinding => ResourceKind::ClusterRoleBinding,
        }
    }

    /// Namespaced kinds live inside a FederatedNamespace.
    pub fn is_namespaced(&self) -> bool {
        matches!(self, FederatedKind::Role | FederatedKind::RoleBinding)
    }

    /// Name of the joint relation, e.g. `FederatedNamespaceCluster`.
    pub fn joint_name(&self) -> &'static str {
        match self {
            FederatedKind::Namespace => "FederatedNamespaceCluster",
            FederatedKind::Role => "FederatedRoleCluster",
            FederatedKind::RoleBinding => "FederatedRoleBindingCluster",
            FederatedKind::ClusterRole => "FederatedClusterRoleCluster",
            FederatedKind::ClusterRoleBinding => "FederatedClusterRoleBindingCluster",
        }
    }
}

/// A control-plane-only template materialized into attached clusters.
///
/// `template` holds the top-level fields copied onto the member object
/// (`spec` for namespaces, `rules` for roles, `subjects` and `roleRef` for
/// bindings). `metadata.labels` and `metadata.annotations` inside the
/// template are merged into the object's metadata.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FederatedResource {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub kind: FederatedKind,
    /// Id of the owning FederatedNamespace, for namespaced kinds.
    #[serde(default)]
    pub namespace_id: Option<String>,
    pub template: Value,
}

impl Record for FederatedResource {
    const KIND: &'static str = "federated_resources";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl FederatedResource {
    pub fn ident(&self) -> String {
        format!("{} {}({})", self.kind, self.base.name, self.base.id)
    }
}

/// Request for a federated resource.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FederatedCreateInput {
    pub kind: FederatedKind,
    pub name: String,
    /// The FederatedNamespace holding a namespaced kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub template: Value,
}

closed_enum! {
    pub enum JointStatus {
        Pending => "pending",
        Synced => "synced",
        SyncFail => "sync_fail",
    }
}

/// Links exactly one federated resource to exactly one cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FederatedJointCluster {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub kind: FederatedKind,
    pub federated_id: String,
    pub cluster_id: String,
    /// UID of the materialized object, once created or adopted.
    #[serde(default)]
    pub resource_id: Option<String>,
    pub status: JointStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl Record for FederatedJointCluster {
    const KIND: &'static str = "federated_joint_clusters";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl FederatedJointCluster {
    pub fn new(fed: &FederatedResource, cluster_id: &str) -> Self {
        Self {
            base: ObjectBase::new(fed.base.name.as_str()),
            kind: fed.kind,
            federated_id: fed.base.id.clone(),
            cluster_id: cluster_id.to_string(),
            resource_id: None,
            status: JointStatus::Pending,
            status_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_targets() {
        assert_eq!(ResourceKind::Namespace, FederatedKind::Namespace.target());
        assert!(FederatedKind::Role.is_namespaced());
        assert!(!FederatedKind::ClusterRoleBinding.is_namespaced());
        assert!(FederatedKind::ALL.iter().all(|k| k.target().info().is_some()));
    }

    #[test]
    fn joint_row_from_template() {
        let fed = FederatedResource {
            base: ObjectBase::new("team-a"),
            kind: FederatedKind::Namespace,
            namespace_id: None,
            template: serde_json::json!({"spec": {}}),
        };
        let joint = FederatedJointCluster::new(&fed, "c1");
        assert_eq!("team-a", joint.name());
        assert_eq!(fed.id(), joint.federated_id);
        assert_eq!(JointStatus::Pending, joint.status);
        assert_eq!("FederatedNamespaceCluster", joint.kind.joint_name());
    }
}
