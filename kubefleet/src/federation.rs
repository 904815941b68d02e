//! Federated resources: templates kept in the control plane and
//! materialized into every cluster they are attached to.
//!
//! Each attachment is a [`FederatedJointCluster`] row carrying the UID of
//! the object it materialized. Reconciling a joint patches the member
//! object back to the template, adopting an object of the same name or
//! recreating it when it went missing.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kube::{ResourceExt, api::DynamicObject};
use kubefleet_apis::{
    Cluster, ClusterStatus, FEDERATED_ANNOTATION, FederatedCreateInput, FederatedJointCluster,
    FederatedKind, FederatedResource, JointStatus, MANAGED_BY_LABEL, ObjectBase, Record,
    ResourceKind,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    MANAGER,
    client::{ClusterApi, kinds::new_object},
    errors::{Error, Result},
    locks::{LockGuard, LockManager},
    registry::ClusterRegistry,
    store::{Query, Store, StoreExt, Transaction},
    utils::overlay_patch,
};

fn holder() -> String {
    format!("federation-{}", uuid::Uuid::new_v4())
}

/// Namespaces first so namespaced kinds find theirs.
fn rank(kind: FederatedKind) -> u8 {
    match kind {
        FederatedKind::Namespace => 0,
        FederatedKind::ClusterRole => 1,
        FederatedKind::Role => 2,
        FederatedKind::ClusterRoleBinding => 3,
        FederatedKind::RoleBinding => 4,
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// The member object `fed` should materialize as.
fn desired_object(fed: &FederatedResource, namespace: Option<&str>) -> Result<DynamicObject> {
    let mut object = new_object(fed.kind.target(), namespace, &fed.base.name)?;
    let empty = serde_json::Map::new();
    let template = fed.template.as_object().unwrap_or(&empty);
    let metadata = template.get("metadata");
    let mut labels = string_map(metadata.and_then(|m| m.get("labels")));
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    let mut annotations = string_map(metadata.and_then(|m| m.get("annotations")));
    annotations.insert(FEDERATED_ANNOTATION.to_string(), fed.base.id.clone());
    object.metadata.labels = Some(labels);
    object.metadata.annotations = Some(annotations);
    object.data = Value::Object(
        template
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "metadata" | "apiVersion" | "kind"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    Ok(object)
}

fn validate_template(template: &Value) -> Result<()> {
    match template {
        Value::Null | Value::Object(_) => Ok(()),
        _ => Err(Error::Validation(
            "federated template must be an object".to_string(),
        )),
    }
}

pub struct FederationEngine {
    store: Arc<dyn Store>,
    registry: Arc<ClusterRegistry>,
    locks: LockManager,
}

impl FederationEngine {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ClusterRegistry>, locks: LockManager) -> Self {
        Self {
            store,
            registry,
            locks,
        }
    }

    async fn lock(&self, fed_id: &str, holder: &str) -> LockGuard {
        self.locks
            .lock_object(FederatedResource::KIND, fed_id, holder)
            .await
    }

    async fn namespace_by_name(&self, name: &str) -> Result<Option<FederatedResource>> {
        self.store
            .find(
                &Query::new()
                    .eq("kind", FederatedKind::Namespace)
                    .eq("name", name),
            )
            .await
    }

    pub async fn joints(&self, fed_id: &str) -> Result<Vec<FederatedJointCluster>> {
        self.store
            .list(&Query::new().eq("federated_id", fed_id))
            .await
    }

    async fn joint(&self, fed_id: &str, cluster_id: &str) -> Result<Option<FederatedJointCluster>> {
        self.store
            .find(
                &Query::new()
                    .eq("federated_id", fed_id)
                    .eq("cluster_id", cluster_id),
            )
            .await
    }

    pub async fn create(&self, input: &FederatedCreateInput) -> Result<FederatedResource> {
        validate_template(&input.template)?;
        if input.name.is_empty() {
            return Err(Error::Validation("federated name is required".to_string()));
        }
        let namespace_id = match (input.kind.is_namespaced(), &input.namespace) {
            (true, Some(ns)) => {
                let parent = self.namespace_by_name(ns).await?.ok_or_else(|| {
                    Error::Validation(format!("federated namespace {} not found", ns))
                })?;
                Some(parent.base.id)
            }
            (true, None) => {
                return Err(Error::Validation(format!(
                    "{} {} needs a federated namespace",
                    input.kind, input.name
                )));
            }
            (false, _) => None,
        };
        let _class = self
            .locks
            .lock_class(FederatedResource::KIND, input.kind.as_str(), &holder())
            .await;
        let existing: Option<FederatedResource> = self
            .store
            .find(
                &Query::new()
                    .eq("kind", input.kind)
                    .eq("name", &input.name)
                    .eq("namespace_id", &namespace_id),
            )
            .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "{} {} already exists",
                input.kind, input.name
            )));
        }
        let fed = FederatedResource {
            base: ObjectBase::new(input.name.as_str()),
            kind: input.kind,
            namespace_id,
            template: input.template.clone(),
        };
        self.store.create(&fed).await?;
        info!("created {}", fed.ident());
        Ok(fed)
    }

    /// Attaches `fed_id` to a cluster and materializes it there. The joint
    /// row stays, marked `sync_fail`, when the first reconcile fails.
    pub async fn attach(&self, fed_id: &str, cluster_id: &str) -> Result<FederatedJointCluster> {
        let holder = holder();
        let _guard = self.lock(fed_id, &holder).await;
        let fed: FederatedResource = self.store.fetch(fed_id).await?;
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        if !cluster.is_running() {
            return Err(Error::Validation(format!(
                "cluster {} is {}",
                cluster.ident(),
                cluster.status
            )));
        }
        if self.joint(fed_id, cluster_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "{} is already attached to cluster {}",
                fed.ident(),
                cluster.ident()
            )));
        }
        if let Some(parent_id) = &fed.namespace_id {
            if self.joint(parent_id, cluster_id).await?.is_none() {
                return Err(Error::Validation(format!(
                    "the namespace of {} is not attached to cluster {}",
                    fed.ident(),
                    cluster.ident()
                )));
            }
        }
        let joint = FederatedJointCluster::new(&fed, cluster_id);
        self.store.create(&joint).await?;
        info!(
            "attached {} to cluster {}",
            fed.ident(),
            cluster.ident()
        );
        let client = self.registry.get(cluster_id).await?;
        self.reconcile_locked(client.as_ref(), &fed, joint).await
    }

    /// Removes the joint row. The member object is left in place.
    pub async fn detach(&self, fed_id: &str, cluster_id: &str) -> Result<()> {
        let holder = holder();
        let _guard = self.lock(fed_id, &holder).await;
        let joint = self.joint(fed_id, cluster_id).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "federated resource {} is not attached to cluster {}",
                fed_id, cluster_id
            ))
        })?;
        if joint.kind == FederatedKind::Namespace {
            let dependents = self.dependents(fed_id).await?;
            for dependent in &dependents {
                if self.joint(&dependent.base.id, cluster_id).await?.is_some() {
                    return Err(Error::Validation(format!(
                        "{} is still attached to cluster {}",
                        dependent.ident(),
                        cluster_id
                    )));
                }
            }
        }
        self.store
            .remove::<FederatedJointCluster>(&joint.base.id)
            .await?;
        info!(
            "detached federated resource {} from cluster {}",
            fed_id, cluster_id
        );
        Ok(())
    }

    async fn dependents(&self, namespace_id: &str) -> Result<Vec<FederatedResource>> {
        self.store
            .list(&Query::new().eq("namespace_id", namespace_id))
            .await
    }

    /// Refused while any joint row exists, for namespaces also any joint
    /// row of the kinds inside it. Dependents without joints go along.
    pub async fn delete(&self, fed_id: &str) -> Result<()> {
        let holder = holder();
        let _guard = self.lock(fed_id, &holder).await;
        let fed: FederatedResource = self.store.fetch(fed_id).await?;
        let joints = self.joints(fed_id).await?;
        if !joints.is_empty() {
            return Err(Error::Validation(format!(
                "{} is attached to {} clusters",
                fed.ident(),
                joints.len()
            )));
        }
        let dependents = self.dependents(fed_id).await?;
        let mut tx = Transaction::new();
        for dependent in &dependents {
            if !self.joints(&dependent.base.id).await?.is_empty() {
                return Err(Error::Validation(format!(
                    "{} still has attached {}",
                    fed.ident(),
                    dependent.ident()
                )));
            }
            tx.delete::<FederatedResource>(&dependent.base.id);
        }
        tx.delete::<FederatedResource>(fed_id);
        self.store.commit(tx).await?;
        info!("deleted {}", fed.ident());
        Ok(())
    }

    /// Replaces the template and pushes it to every attached cluster.
    pub async fn update_template(&self, fed_id: &str, template: Value) -> Result<FederatedResource> {
        validate_template(&template)?;
        let holder = holder();
        let _guard = self.lock(fed_id, &holder).await;
        let fed = self
            .store
            .modify::<FederatedResource, _>(fed_id, move |f| {
                f.template = template;
                Ok(())
            })
            .await?;
        let mut errors = vec![];
        for joint in self.joints(fed_id).await? {
            let cluster_id = joint.cluster_id.clone();
            let outcome = match self.registry.get(&cluster_id).await {
                Ok(client) => self
                    .reconcile_locked(client.as_ref(), &fed, joint)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                errors.push(format!("cluster {}: {}", cluster_id, e));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Reconcile(errors.join("; ")));
        }
        Ok(fed)
    }

    /// Brings the joint's member object back to the template.
    pub async fn reconcile_joint(
        &self,
        client: &dyn ClusterApi,
        joint: &FederatedJointCluster,
    ) -> Result<FederatedJointCluster> {
        let holder = holder();
        let _guard = self.lock(&joint.federated_id, &holder).await;
        let fed: FederatedResource = self.store.fetch(&joint.federated_id).await?;
        let joint: FederatedJointCluster = self.store.fetch(&joint.base.id).await?;
        self.reconcile_locked(client, &fed, joint).await
    }

    /// Records the outcome on the joint row; a failure is also returned.
    async fn reconcile_locked(
        &self,
        client: &dyn ClusterApi,
        fed: &FederatedResource,
        joint: FederatedJointCluster,
    ) -> Result<FederatedJointCluster> {
        let (resource_id, status, reason, outcome) = match self.materialize(client, fed, &joint).await {
            Ok(uid) => (Some(uid), JointStatus::Synced, None, Ok(())),
            Err(e) => {
                warn!(
                    "failed to reconcile {} in cluster {}: {}",
                    fed.ident(),
                    joint.cluster_id,
                    e
                );
                (
                    joint.resource_id.clone(),
                    JointStatus::SyncFail,
                    Some(e.to_string()),
                    Err(e),
                )
            }
        };
        let joint = if joint.resource_id != resource_id
            || joint.status != status
            || joint.status_reason != reason
        {
            self.store
                .modify::<FederatedJointCluster, _>(&joint.base.id, move |j| {
                    j.resource_id = resource_id;
                    j.status = status;
                    j.status_reason = reason;
                    Ok(())
                })
                .await?
        } else {
            joint
        };
        outcome.map(|_| joint)
    }

    /// Creates or patches the member object and returns its UID.
    async fn materialize(
        &self,
        client: &dyn ClusterApi,
        fed: &FederatedResource,
        joint: &FederatedJointCluster,
    ) -> Result<String> {
        let kind = fed.kind.target();
        let namespace = match &fed.namespace_id {
            Some(parent_id) => {
                let parent: FederatedResource = self.store.fetch(parent_id).await?;
                match client.get(ResourceKind::Namespace, None, &parent.base.name).await {
                    Ok(_) => Some(parent.base.name),
                    Err(e) if e.is_not_found() => {
                        return Err(Error::NotFound(format!(
                            "namespace {} is absent",
                            parent.base.name
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };
        let desired = desired_object(fed, namespace.as_deref())?;
        let current = match client.get(kind, namespace.as_deref(), &fed.base.name).await {
            Ok(current) => Some(current),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let object = match current {
            Some(current) => {
                if joint.resource_id.as_deref() != current.uid().as_deref() {
                    debug!(
                        "adopting {} {} in cluster {}",
                        kind,
                        fed.base.name,
                        joint.cluster_id
                    );
                }
                let patch = overlay_patch(
                    &serde_json::to_value(&current)?,
                    &serde_json::to_value(&desired)?,
                );
                if patch.0.is_empty() {
                    current
                } else {
                    debug!(
                        "patching {} {} in cluster {}",
                        kind,
                        fed.base.name,
                        joint.cluster_id
                    );
                    client
                        .patch(kind, namespace.as_deref(), &fed.base.name, &patch)
                        .await?
                }
            }
            None => {
                info!(
                    "creating {} {} in cluster {}",
                    kind,
                    fed.base.name,
                    joint.cluster_id
                );
                client.create(kind, &desired).await?
            }
        };
        object.uid().ok_or_else(|| {
            Error::Driver(format!(
                "{} {} in cluster {} has no uid",
                kind, fed.base.name, joint.cluster_id
            ))
        })
    }

    /// Reconciles every joint of a cluster, namespaces first.
    pub async fn reconcile_cluster(&self, cluster_id: &str) -> Result<usize> {
        let mut joints: Vec<FederatedJointCluster> = self
            .store
            .list(&Query::new().eq("cluster_id", cluster_id))
            .await?;
        if joints.is_empty() {
            return Ok(0);
        }
        joints.sort_by_key(|j| rank(j.kind));
        let client = self.registry.get(cluster_id).await?;
        let mut errors = vec![];
        for joint in &joints {
            if let Err(e) = self.reconcile_joint(client.as_ref(), joint).await {
                errors.push(format!("{} {}: {}", joint.kind, joint.base.name, e));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Reconcile(errors.join("; ")));
        }
        Ok(joints.len())
    }

    pub async fn reconcile_all(&self) {
        let clusters: Vec<Cluster> = match self
            .store
            .list(&Query::new().eq("status", ClusterStatus::Running))
            .await
        {
            Ok(clusters) => clusters,
            Err(e) => {
                error!("failed to list clusters to federate: {}", e);
                return;
            }
        };
        for cluster in clusters {
            match self.reconcile_cluster(&cluster.base.id).await {
                Ok(0) => (),
                Ok(n) => debug!("reconciled {} joints in cluster {}", n, cluster.ident()),
                Err(e) => warn!("federation of cluster {}: {}", cluster.ident(), e),
            }
        }
    }

    /// Repairs the joint of an object deleted behind the control plane's back.
    pub async fn on_remote_delete(&self, cluster_id: &str, object: &DynamicObject) -> Result<()> {
        let Some(fed_id) = object.annotations().get(FEDERATED_ANNOTATION).cloned() else {
            return Ok(());
        };
        let Some(joint) = self.joint(&fed_id, cluster_id).await? else {
            return Ok(());
        };
        let client = self.registry.get(cluster_id).await?;
        self.reconcile_joint(client.as_ref(), &joint).await?;
        Ok(())
    }

    pub async fn run_reconcile_loop(&self, interval: Duration, shutdown: CancellationToken) {
        info!("federation reconcile loop started, every {:?}", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.reconcile_all().await,
            }
        }
        info!("federation reconcile loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::fake::FakeClientFactory, metrics::Metrics, store::MemoryStore};
    use kubefleet_apis::ClusterCreateInput;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        factory: Arc<FakeClientFactory>,
        registry: Arc<ClusterRegistry>,
        engine: FederationEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = Arc::new(ClusterRegistry::new(
            store.clone(),
            factory.clone(),
            Metrics::new(),
        ));
        let engine = FederationEngine::new(store.clone(), registry.clone(), LockManager::new());
        Fixture {
            store,
            factory,
            registry,
            engine,
        }
    }

    async fn cluster(f: &Fixture, name: &str) -> Cluster {
        let input: ClusterCreateInput = serde_json::from_value(json!({
            "name": name,
            "provider": "system",
            "mode": "import",
            "kubeconfig": format!("kubeconfig-{}", name),
        }))
        .unwrap();
        let mut cluster = Cluster::new(&input);
        cluster.status = ClusterStatus::Running;
        f.store.create(&cluster).await.unwrap();
        cluster
    }

    fn namespace_input(name: &str) -> FederatedCreateInput {
        FederatedCreateInput {
            kind: FederatedKind::Namespace,
            name: name.to_string(),
            namespace: None,
            template: json!({"spec": {}}),
        }
    }

    fn role_input(namespace: &str) -> FederatedCreateInput {
        FederatedCreateInput {
            kind: FederatedKind::Role,
            name: "viewer".to_string(),
            namespace: Some(namespace.to_string()),
            template: json!({
                "metadata": {"labels": {"team": "a"}},
                "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["get", "list"]}],
            }),
        }
    }

    #[tokio::test]
    async fn desired_object_carries_the_template() {
        let fed = FederatedResource {
            base: ObjectBase::new("viewer"),
            kind: FederatedKind::Role,
            namespace_id: Some("ns-id".to_string()),
            template: role_input("team-a").template,
        };
        let object = desired_object(&fed, Some("team-a")).unwrap();
        assert_eq!(Some("team-a".to_string()), object.namespace());
        assert_eq!(Some(&"a".to_string()), object.labels().get("team"));
        assert_eq!(Some(&MANAGER.to_string()), object.labels().get(MANAGED_BY_LABEL));
        assert_eq!(Some(&fed.base.id), object.annotations().get(FEDERATED_ANNOTATION));
        assert_eq!(json!(["get", "list"]), object.data["rules"][0]["verbs"]);
        assert!(object.data.get("metadata").is_none());
    }

    #[tokio::test]
    async fn namespaced_kinds_need_their_namespace() {
        let f = fixture();
        assert!(matches!(
            f.engine.create(&role_input("team-a")).await,
            Err(Error::Validation(_))
        ));
        let ns = f.engine.create(&namespace_input("team-a")).await.unwrap();
        let role = f.engine.create(&role_input("team-a")).await.unwrap();
        assert_eq!(Some(ns.base.id.clone()), role.namespace_id);
        assert!(f.engine.create(&role_input("team-a")).await.unwrap_err().is_conflict());

        let c1 = cluster(&f, "c1").await;
        assert!(matches!(
            f.engine.attach(&role.base.id, &c1.base.id).await,
            Err(Error::Validation(_))
        ));
        f.engine.attach(&ns.base.id, &c1.base.id).await.unwrap();
        let joint = f.engine.attach(&role.base.id, &c1.base.id).await.unwrap();
        assert_eq!(JointStatus::Synced, joint.status);

        assert!(matches!(
            f.engine.detach(&ns.base.id, &c1.base.id).await,
            Err(Error::Validation(_))
        ));
        f.engine.detach(&role.base.id, &c1.base.id).await.unwrap();
        f.engine.detach(&ns.base.id, &c1.base.id).await.unwrap();
        f.engine.delete(&ns.base.id).await.unwrap();
        assert_eq!(0, f.store.count(FederatedResource::KIND));
    }

    #[tokio::test]
    async fn attached_resources_cannot_be_deleted() {
        let f = fixture();
        let c1 = cluster(&f, "c1").await;
        let ns = f.engine.create(&namespace_input("team-a")).await.unwrap();
        f.engine.attach(&ns.base.id, &c1.base.id).await.unwrap();
        assert!(
            f.engine
                .attach(&ns.base.id, &c1.base.id)
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert!(matches!(
            f.engine.delete(&ns.base.id).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn converged_reconcile_changes_nothing() {
        let f = fixture();
        let c1 = cluster(&f, "c1").await;
        let ns = f.engine.create(&namespace_input("team-a")).await.unwrap();
        let joint = f.engine.attach(&ns.base.id, &c1.base.id).await.unwrap();
        let backend = f.factory.backend(&c1.base.id);
        let before = backend
            .object(ResourceKind::Namespace, None, "team-a")
            .unwrap();
        assert_eq!(before.uid(), joint.resource_id);

        let client = f.registry.get(&c1.base.id).await.unwrap();
        let again = f.engine.reconcile_joint(client.as_ref(), &joint).await.unwrap();
        assert_eq!(joint, again);
        let after = backend
            .object(ResourceKind::Namespace, None, "team-a")
            .unwrap();
        assert_eq!(before.resource_version(), after.resource_version());
    }

    #[tokio::test]
    async fn template_updates_reach_every_cluster() {
        let f = fixture();
        let c1 = cluster(&f, "c1").await;
        let c2 = cluster(&f, "c2").await;
        let role = f
            .engine
            .create(&FederatedCreateInput {
                kind: FederatedKind::ClusterRole,
                name: "auditor".to_string(),
                namespace: None,
                template: json!({"rules": []}),
            })
            .await
            .unwrap();
        for c in [&c1, &c2] {
            f.engine.attach(&role.base.id, &c.base.id).await.unwrap();
        }
        let rules = json!([{"apiGroups": [""], "resources": ["events"], "verbs": ["list"]}]);
        f.engine
            .update_template(&role.base.id, json!({"rules": rules.clone()}))
            .await
            .unwrap();
        for c in [&c1, &c2] {
            let object = f
                .factory
                .backend(&c.base.id)
                .object(ResourceKind::ClusterRole, None, "auditor")
                .unwrap();
            assert_eq!(rules, object.data["rules"]);
        }
    }

    #[tokio::test]
    async fn failures_are_recorded_on_the_joint() {
        let f = fixture();
        let c1 = cluster(&f, "c1").await;
        let ns = f.engine.create(&namespace_input("team-a")).await.unwrap();
        let role = f.engine.create(&role_input("team-a")).await.unwrap();
        f.engine.attach(&ns.base.id, &c1.base.id).await.unwrap();
        f.factory
            .backend(&c1.base.id)
            .remove(ResourceKind::Namespace, None, "team-a");
        let err = f.engine.attach(&role.base.id, &c1.base.id).await.unwrap_err();
        assert!(err.to_string().contains("absent"));
        let joint = f.engine.joints(&role.base.id).await.unwrap().remove(0);
        assert_eq!(JointStatus::SyncFail, joint.status);
        assert!(joint.resource_id.is_none());

        assert!(f.engine.reconcile_cluster(&c1.base.id).await.is_ok());
        let joint = f.engine.joints(&role.base.id).await.unwrap().remove(0);
        assert_eq!(JointStatus::Synced, joint.status);
    }
}
