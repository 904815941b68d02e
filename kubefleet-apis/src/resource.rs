use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ObjectBase, Record};

closed_enum! {
    /// Every kind the control plane watches or tracks in a member cluster.
    pub enum ResourceKind {
        Pod => "pods",
        Deployment => "deployments",
        ReplicaSet => "replicasets",
        StatefulSet => "statefulsets",
        DaemonSet => "daemonsets",
        CronJob => "cronjobs",
        Job => "jobs",
        Service => "services",
        Endpoints => "endpoints",
        Ingress => "ingresses",
        ConfigMap => "configmaps",
        Secret => "secrets",
        PersistentVolume => "persistentvolumes",
        PersistentVolumeClaim => "persistentvolumeclaims",
        StorageClass => "storageclasses",
        Namespace => "namespaces",
        Node => "nodes",
        Role => "roles",
        RoleBinding => "rolebindings",
        ClusterRole => "clusterroles",
        ClusterRoleBinding => "clusterrolebindings",
        ServiceAccount => "serviceaccounts",
        HorizontalPodAutoscaler => "horizontalpodautoscalers",
        LimitRange => "limitranges",
        ResourceQuota => "resourcequotas",
        ReplicationController => "replicationcontrollers",
        /// A helm release. Not an informer kind.
        Release => "releases",
    }
}

/// Group/version/kind coordinates of an informer kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

const fn core_kind(kind: &'static str, plural: &'static str, namespaced: bool) -> KindInfo {
    KindInfo {
        group: "",
        version: "v1",
        kind,
        plural,
        namespaced,
    }
}

const fn grouped(
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
    namespaced: bool,
) -> KindInfo {
    KindInfo {
        group,
        version,
        kind,
        plural,
        namespaced,
    }
}

impl ResourceKind {
    /// API coordinates, `None` for releases.
    pub fn info(&self) -> Option<KindInfo> {
        use ResourceKind::*;
        let info = match self {
            Pod => core_kind("Pod", "pods", true),
            Service => core_kind("Service", "services", true),
            Endpoints => core_kind("Endpoints", "endpoints", true),
            ConfigMap => core_kind("ConfigMap", "configmaps", true),
            Secret => core_kind("Secret", "secrets", true),
            PersistentVolume => core_kind("PersistentVolume", "persistentvolumes", false),
            PersistentVolumeClaim => {
                core_kind("PersistentVolumeClaim", "persistentvolumeclaims", true)
            }
            Namespace => core_kind("Namespace", "namespaces", false),
            Node => core_kind("Node", "nodes", false),
            ServiceAccount => core_kind("ServiceAccount", "serviceaccounts", true),
            LimitRange => core_kind("LimitRange", "limitranges", true),
            ResourceQuota => core_kind("ResourceQuota", "resourcequotas", true),
            ReplicationController => {
                core_kind("ReplicationController", "replicationcontrollers", true)
            }
            Deployment => grouped("apps", "v1", "Deployment", "deployments", true),
            ReplicaSet => grouped("apps", "v1", "ReplicaSet", "replicasets", true),
            StatefulSet => grouped("apps", "v1", "StatefulSet", "statefulsets", true),
            DaemonSet => grouped("apps", "v1", "DaemonSet", "daemonsets", true),
            CronJob => grouped("batch", "v1", "CronJob", "cronjobs", true),
            Job => grouped("batch", "v1", "Job", "jobs", true),
            Ingress => grouped("networking.k8s.io", "v1", "Ingress", "ingresses", true),
            StorageClass => grouped(
                "storage.k8s.io",
                "v1",
                "StorageClass",
                "storageclasses",
                false,
            ),
            Role => grouped("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
            RoleBinding => grouped(
                "rbac.authorization.k8s.io",
                "v1",
                "RoleBinding",
                "rolebindings",
                true,
            ),
            ClusterRole => grouped(
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRole",
                "clusterroles",
                false,
            ),
            ClusterRoleBinding => grouped(
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
                false,
            ),
            HorizontalPodAutoscaler => grouped(
                "autoscaling",
                "v2",
                "HorizontalPodAutoscaler",
                "horizontalpodautoscalers",
                true,
            ),
            Release => return None,
        };
        Some(info)
    }

    /// Kinds a member cluster runs an informer for.
    pub fn informer_kinds() -> impl Iterator<Item = ResourceKind> {
        ResourceKind::ALL
            .iter()
            .copied()
            .filter(|k| *k != ResourceKind::Release)
    }

    /// Kinds mirrored into `cluster_resources` rows.
    pub fn is_tracked(&self) -> bool {
        use ResourceKind::*;
        matches!(
            self,
            Namespace
                | Deployment
                | Pod
                | Service
                | ConfigMap
                | Secret
                | PersistentVolumeClaim
                | PersistentVolume
                | Ingress
                | Role
                | ClusterRole
                | RoleBinding
                | ClusterRoleBinding
                | DaemonSet
                | StatefulSet
                | CronJob
                | Node
                | LimitRange
                | ResourceQuota
                | Release
        )
    }

    /// Whether rows of this kind reference a Namespace row.
    pub fn is_namespaced(&self) -> bool {
        match self.info() {
            Some(info) => info.namespaced,
            None => true,
        }
    }
}

closed_enum! {
    pub enum ResourceStatus {
        Init => "init",
        Creating => "creating",
        CreateFail => "create_fail",
        Active => "active",
        Deployed => "deployed",
        DeployFail => "deploy_fail",
        Deleting => "deleting",
        DeleteFail => "delete_fail",
    }
}

/// Local mirror of one object in a member cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClusterResource {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub cluster_id: String,
    pub kind: ResourceKind,
    /// Row id of the owning Namespace row, for namespaced kinds.
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// `metadata.uid`, or `cluster/ns/name` for releases. Immutable once set.
    #[serde(default)]
    pub external_id: Option<String>,
    pub resource_version: u64,
    pub status: ResourceStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Pod phase, node readiness or release status as last observed.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Last observed remote object.
    #[serde(default)]
    pub spec: Value,
}

impl Record for ClusterResource {
    const KIND: &'static str = "cluster_resources";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl ClusterResource {
    pub fn new(cluster_id: &str, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            base: ObjectBase::new(name),
            cluster_id: cluster_id.to_string(),
            kind,
            namespace_id: None,
            namespace: namespace.map(|n| n.to_string()),
            external_id: None,
            resource_version: 0,
            status: ResourceStatus::Init,
            status_reason: None,
            phase: None,
            labels: Default::default(),
            spec: Value::Null,
        }
    }

    /// `kind cluster/ns/name` for log lines.
    pub fn ident(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}/{}", self.kind, self.cluster_id, ns, self.base.name),
            None => format!("{} {}/{}", self.kind, self.cluster_id, self.base.name),
        }
    }
}

/// Request to create an object in a member cluster from the control plane.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResourceCreateInput {
    pub cluster_id: String,
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Kind specific body merged into the object (`spec`, `data`, `rules`, ...).
    #[serde(default)]
    pub body: Value,
}

closed_enum! {
    pub enum RepoType {
        /// Bundled system charts. System namespaces and admins only.
        Internal => "internal",
        External => "external",
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ReleaseCreateInput {
    pub cluster_id: String,
    pub namespace: String,
    pub name: String,
    pub repo: String,
    pub repo_type: RepoType,
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub values: Value,
}

/// Request for a typed secret, rendered into `data` by its secret driver.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SecretCreateInput {
    pub cluster_id: String,
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub secret_type: String,
    #[serde(default)]
    pub params: Value,
}
