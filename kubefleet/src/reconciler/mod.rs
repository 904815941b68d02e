//! Two-way sync between `cluster_resources` rows and member cluster objects.
//!
//! A cycle for one `(cluster, kind)` lists the remote objects, matches them
//! with the local rows by global id and then deletes, adds and updates rows
//! in that order. Rows whose object lock is held by someone else (a task
//! working on them) are left alone and reported in [`SyncResult::errors`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use kube::{ResourceExt, api::DynamicObject};
use kubefleet_apis::{
    ClusterResource, Record, ResourceCreateInput, ResourceKind, ResourceStatus, UserCred,
};
use serde_json::Value;

use crate::{
    client::{ClusterApi, kinds::resource_version},
    errors::{Error, Result},
    locks::{LockGuard, LockManager},
    metrics::Metrics,
    providers::{AuditEvent, AuditSink},
    store::{Query, Store, StoreExt},
};

mod kinds;
mod release;

pub use kinds::KindManager;
pub use release::ReleaseManager;

/// A member cluster object as the reconciler sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteObject {
    pub uid: String,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: u64,
    pub labels: BTreeMap<String, String>,
    /// Pod phase, node readiness or release status.
    pub phase: Option<String>,
    pub body: Value,
}

fn node_readiness(object: &DynamicObject) -> Option<String> {
    let conditions = object.data.pointer("/status/conditions")?.as_array()?;
    let ready = conditions
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))?;
    match ready.get("status").and_then(Value::as_str) {
        Some("True") => Some("Ready".to_string()),
        _ => Some("NotReady".to_string()),
    }
}

impl RemoteObject {
    pub fn from_object(kind: ResourceKind, object: &DynamicObject) -> Result<Self> {
        let phase = match kind {
            ResourceKind::Node => node_readiness(object),
            _ => object
                .data
                .pointer("/status/phase")
                .and_then(Value::as_str)
                .map(|p| p.to_string()),
        };
        Ok(Self {
            uid: object.metadata.uid.clone().unwrap_or_default(),
            namespace: object.namespace(),
            name: object.name_any(),
            resource_version: resource_version(object),
            labels: object.labels().clone(),
            phase,
            body: serde_json::to_value(object)?,
        })
    }
}

/// Per-kind capabilities the reconciler is generic over.
#[async_trait]
pub trait ClusterResourceManager: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn list_remote(&self, client: &dyn ClusterApi) -> Result<Vec<RemoteObject>>;

    /// Identity of a remote object across the fleet, stored as `external_id`.
    fn global_id(&self, cluster_id: &str, remote: &RemoteObject) -> String;

    /// The row with the remote object's coordinates, if any.
    async fn local_exists(
        &self,
        store: &dyn Store,
        cluster_id: &str,
        remote: &RemoteObject,
    ) -> Result<Option<ClusterResource>> {
        store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("kind", self.kind())
                    .eq("namespace", &remote.namespace)
                    .eq("name", &remote.name),
            )
            .await
    }

    fn new_local_from_remote(&self, cluster_id: &str, remote: &RemoteObject) -> ClusterResource {
        ClusterResource::new(
            cluster_id,
            self.kind(),
            remote.namespace.as_deref(),
            &remote.name,
        )
    }

    /// Status a row takes after observing `remote`. `None` keeps it.
    fn observed_status(&self, _remote: &RemoteObject) -> Option<ResourceStatus> {
        Some(ResourceStatus::Active)
    }

    /// Copies the observed state onto `row`. Lower versions and a changed
    /// global id are rejected.
    fn update_local_from_remote(
        &self,
        row: &mut ClusterResource,
        remote: &RemoteObject,
        global_id: &str,
    ) -> Result<()> {
        if remote.resource_version < row.resource_version {
            return Err(Error::Validation(format!(
                "{}: resource version {} is older than {}",
                row.ident(),
                remote.resource_version,
                row.resource_version
            )));
        }
        match &row.external_id {
            Some(id) if id != global_id => {
                return Err(Error::Validation(format!(
                    "{}: external id {} cannot change to {}",
                    row.ident(),
                    id,
                    global_id
                )));
            }
            Some(_) => (),
            None => row.external_id = Some(global_id.to_string()),
        }
        row.resource_version = remote.resource_version;
        row.labels = remote.labels.clone();
        row.phase = remote.phase.clone();
        row.spec = remote.body.clone();
        if let Some(status) = self.observed_status(remote) {
            if status != row.status {
                row.status = status;
                row.status_reason = None;
            }
        }
        Ok(())
    }

    fn new_remote_from_input(&self, input: &ResourceCreateInput) -> Result<DynamicObject>;

    async fn create_remote(
        &self,
        client: &dyn ClusterApi,
        object: &DynamicObject,
    ) -> Result<RemoteObject>;

    /// Deleting an absent object succeeds.
    async fn delete_remote(&self, client: &dyn ClusterApi, row: &ClusterResource) -> Result<()>;

    async fn validate_delete(&self, _store: &dyn Store, _row: &ClusterResource) -> Result<()> {
        Ok(())
    }

    async fn customize_delete(&self, _store: &dyn Store, _row: &ClusterResource) -> Result<()> {
        Ok(())
    }

    async fn post_delete(&self, _store: &dyn Store, _row: &ClusterResource) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncResult {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn merge(&mut self, other: SyncResult) {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.errors.extend(other.errors);
    }

    /// `Reconcile` error listing every failure, if any.
    pub fn into_result(self) -> Result<SyncResult> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::Reconcile(self.errors.join("; ")))
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    locks: LockManager,
    audit: Arc<dyn AuditSink>,
    metrics: Metrics,
    managers: HashMap<ResourceKind, Arc<dyn ClusterResourceManager>>,
}

impl Reconciler {
    /// A reconciler for every tracked kind.
    pub fn new(
        store: Arc<dyn Store>,
        locks: LockManager,
        audit: Arc<dyn AuditSink>,
        metrics: Metrics,
    ) -> Self {
        let mut managers: HashMap<ResourceKind, Arc<dyn ClusterResourceManager>> = HashMap::new();
        for kind in ResourceKind::ALL.iter().copied().filter(|k| k.is_tracked()) {
            let manager: Arc<dyn ClusterResourceManager> = match kind {
                ResourceKind::Release => Arc::new(ReleaseManager),
                _ => Arc::new(KindManager::new(kind)),
            };
            managers.insert(kind, manager);
        }
        Self {
            store,
            locks,
            audit,
            metrics,
            managers,
        }
    }

    pub fn manager(&self, kind: ResourceKind) -> Result<Arc<dyn ClusterResourceManager>> {
        self.managers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("{} is not tracked", kind)))
    }

    /// Kinds in the order a full sync visits them.
    fn sync_order() -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = ResourceKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_tracked() && *k != ResourceKind::Namespace)
            .collect();
        kinds.insert(0, ResourceKind::Namespace);
        kinds
    }

    /// Syncs every tracked kind. Namespaces go first so rows can reference
    /// them and again last when one of their deletes was refused.
    pub async fn sync_all(&self, client: &dyn ClusterApi) -> SyncResult {
        let mut total = SyncResult::default();
        let mut retry_namespaces = false;
        for kind in Self::sync_order() {
            match self.sync_kind(client, kind).await {
                Ok(result) => {
                    if kind == ResourceKind::Namespace && !result.errors.is_empty() {
                        retry_namespaces = true;
                        total.added += result.added;
                        total.updated += result.updated;
                        total.deleted += result.deleted;
                    } else {
                        total.merge(result);
                    }
                }
                Err(e) => total.errors.push(format!("sync {}: {}", kind, e)),
            }
        }
        if retry_namespaces {
            match self.sync_kind(client, ResourceKind::Namespace).await {
                Ok(result) => total.merge(result),
                Err(e) => total.errors.push(format!("sync {}: {}", ResourceKind::Namespace, e)),
            }
        }
        total
    }

    pub async fn sync_kind(&self, client: &dyn ClusterApi, kind: ResourceKind) -> Result<SyncResult> {
        let started = Instant::now();
        let manager = self.manager(kind)?;
        let cluster_id = client.cluster_id();
        let remotes = manager.list_remote(client).await?;
        let locals: Vec<ClusterResource> = self
            .store
            .list(&Query::new().eq("cluster_id", cluster_id).eq("kind", kind))
            .await?;
        let holder = format!("reconcile/{}", uuid::Uuid::new_v4());

        let mut remote_by_id: HashMap<String, RemoteObject> = HashMap::new();
        for remote in remotes {
            remote_by_id.insert(manager.global_id(cluster_id, &remote), remote);
        }
        let local_ids: HashSet<String> = locals
            .iter()
            .filter_map(|r| r.external_id.clone())
            .collect();
        let mut removed = vec![];
        let mut common = vec![];
        for row in locals {
            match &row.external_id {
                Some(id) if remote_by_id.contains_key(id) => common.push(row),
                Some(_) => removed.push(row),
                // Forward creates in progress or failed. Kept until deleted.
                None => (),
            }
        }

        let mut result = SyncResult::default();
        for row in removed {
            match self.remove_row(manager.as_ref(), &row, &holder, false).await {
                Ok(()) => result.deleted += 1,
                Err(e) => result.errors.push(e.to_string()),
            }
        }
        for (global_id, remote) in &remote_by_id {
            if local_ids.contains(global_id) {
                continue;
            }
            match self
                .add_row(&manager, cluster_id, remote, global_id, &holder)
                .await
            {
                Ok(true) => result.added += 1,
                Ok(false) => result.updated += 1,
                Err(e) => result.errors.push(e.to_string()),
            }
        }
        for row in common {
            let Some(global_id) = row.external_id.clone() else {
                continue;
            };
            let Some(remote) = remote_by_id.get(&global_id) else {
                continue;
            };
            match self
                .update_row(&manager, &row, remote, &global_id, &holder)
                .await
            {
                Ok(true) => result.updated += 1,
                Ok(false) => (),
                Err(e) => result.errors.push(e.to_string()),
            }
        }

        for error in &result.errors {
            warn!("sync {} of cluster {}: {}", kind, cluster_id, error);
        }
        debug!(
            "synced {} of cluster {}: {} added, {} updated, {} deleted, {} errors",
            kind,
            cluster_id,
            result.added,
            result.updated,
            result.deleted,
            result.error_count()
        );
        self.metrics.reconciled(
            cluster_id,
            kind.as_str(),
            started.elapsed(),
            result.error_count(),
        );
        Ok(result)
    }

    fn try_lock_row(&self, row: &ClusterResource, holder: &str) -> Result<LockGuard> {
        self.locks
            .try_lock_object(ClusterResource::KIND, &row.base.id, holder)
            .ok_or_else(|| {
                Error::Conflict(format!("{} is owned by an active task", row.ident()))
            })
    }

    /// Id of the Namespace row named `namespace`, if one is filed yet.
    pub async fn namespace_id(&self, cluster_id: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let Some(namespace) = namespace else {
            return Ok(None);
        };
        let row: Option<ClusterResource> = self
            .store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("kind", ResourceKind::Namespace)
                    .eq("name", namespace),
            )
            .await?;
        Ok(row.map(|r| r.base.id))
    }

    /// Inserts a row for `remote`, or adopts the row already filed under its
    /// coordinates. `Ok(true)` if a row was inserted.
    async fn add_row(
        &self,
        manager: &Arc<dyn ClusterResourceManager>,
        cluster_id: &str,
        remote: &RemoteObject,
        global_id: &str,
        holder: &str,
    ) -> Result<bool> {
        let _class = self
            .locks
            .lock_class(manager.kind().as_str(), cluster_id, holder)
            .await;
        if let Some(row) = manager
            .local_exists(self.store.as_ref(), cluster_id, remote)
            .await?
        {
            if row.external_id.as_deref().is_some_and(|id| id != global_id) {
                return Err(Error::Conflict(format!(
                    "{} still tracks {}",
                    row.ident(),
                    row.external_id.as_deref().unwrap_or_default()
                )));
            }
            self.update_row(manager, &row, remote, global_id, holder)
                .await?;
            return Ok(false);
        }
        let mut row = manager.new_local_from_remote(cluster_id, remote);
        row.namespace_id = self
            .namespace_id(cluster_id, remote.namespace.as_deref())
            .await?;
        manager.update_local_from_remote(&mut row, remote, global_id)?;
        self.store.create(&row).await?;
        debug!("added {}", row.ident());
        Ok(true)
    }

    /// Applies `remote` to `row`. `Ok(false)` if the row was already current.
    async fn update_row(
        &self,
        manager: &Arc<dyn ClusterResourceManager>,
        row: &ClusterResource,
        remote: &RemoteObject,
        global_id: &str,
        holder: &str,
    ) -> Result<bool> {
        let _lock = self.try_lock_row(row, holder)?;
        // Rows filed before their Namespace row pick it up here.
        let namespace_id = match &row.namespace_id {
            None if row.namespace.is_some() => {
                self.namespace_id(&row.cluster_id, row.namespace.as_deref())
                    .await?
            }
            _ => None,
        };
        if row.external_id.as_deref() == Some(global_id)
            && row.resource_version == remote.resource_version
            && namespace_id.is_none()
        {
            return Ok(false);
        }
        let manager = manager.clone();
        let remote = remote.clone();
        let global_id = global_id.to_string();
        self.store
            .modify::<ClusterResource, _>(&row.base.id, move |r| {
                if namespace_id.is_some() {
                    r.namespace_id = namespace_id;
                }
                manager.update_local_from_remote(r, &remote, &global_id)
            })
            .await?;
        Ok(true)
    }

    /// Deletes the row of a vanished object. With `wait` the row lock is
    /// awaited instead of reported.
    async fn remove_row(
        &self,
        manager: &dyn ClusterResourceManager,
        row: &ClusterResource,
        holder: &str,
        wait: bool,
    ) -> Result<()> {
        let _lock = if wait {
            self.locks
                .lock_object(ClusterResource::KIND, &row.base.id, holder)
                .await
        } else {
            self.try_lock_row(row, holder)?
        };
        let outcome = self.delete_local(manager, row).await;
        self.audit_delete(row, &outcome);
        if let Err(e) = &outcome {
            self.mark_delete_fail(row, e).await;
        }
        outcome
    }

    async fn delete_local(&self, manager: &dyn ClusterResourceManager, row: &ClusterResource) -> Result<()> {
        let store = self.store.as_ref();
        manager.validate_delete(store, row).await?;
        manager.customize_delete(store, row).await?;
        store.remove::<ClusterResource>(&row.base.id).await?;
        manager.post_delete(store, row).await?;
        info!("deleted {}", row.ident());
        Ok(())
    }

    fn audit_delete(&self, row: &ClusterResource, outcome: &Result<()>) {
        self.audit.log(AuditEvent {
            action: "delete".to_string(),
            object_kind: row.kind.to_string(),
            object_id: row.base.id.clone(),
            object_name: row.base.name.clone(),
            user: UserCred::system(),
            success: outcome.is_ok(),
            note: match outcome {
                Ok(()) => "removed from member cluster".to_string(),
                Err(e) => e.to_string(),
            },
        });
    }

    async fn mark_delete_fail(&self, row: &ClusterResource, error: &Error) {
        let reason = error.to_string();
        if let Err(e) = self
            .store
            .modify::<ClusterResource, _>(&row.base.id, move |r| {
                r.status = ResourceStatus::DeleteFail;
                r.status_reason = Some(reason);
                Ok(())
            })
            .await
        {
            if !e.is_not_found() {
                warn!("failed to record delete failure of {}: {}", row.ident(), e);
            }
        }
    }

    async fn find_by_global_id(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        global_id: &str,
    ) -> Result<Option<ClusterResource>> {
        self.store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("kind", kind)
                    .eq("external_id", global_id),
            )
            .await
    }

    pub async fn on_remote_create(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        remote: &RemoteObject,
    ) -> Result<()> {
        let manager = self.manager(kind)?;
        let global_id = manager.global_id(cluster_id, remote);
        let holder = format!("event/{}", uuid::Uuid::new_v4());
        self.add_row(&manager, cluster_id, remote, &global_id, &holder)
            .await
            .map(|_| ())
    }

    /// Falls back to create when the row is gone.
    pub async fn on_remote_update(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        remote: &RemoteObject,
    ) -> Result<()> {
        let manager = self.manager(kind)?;
        let global_id = manager.global_id(cluster_id, remote);
        match self.find_by_global_id(cluster_id, kind, &global_id).await? {
            Some(row) => {
                let holder = format!("event/{}", uuid::Uuid::new_v4());
                self.update_row(&manager, &row, remote, &global_id, &holder)
                    .await
                    .map(|_| ())
            }
            None => self.on_remote_create(cluster_id, kind, remote).await,
        }
    }

    pub async fn on_remote_delete(
        &self,
        cluster_id: &str,
        kind: ResourceKind,
        remote: &RemoteObject,
    ) -> Result<()> {
        let manager = self.manager(kind)?;
        let global_id = manager.global_id(cluster_id, remote);
        match self.find_by_global_id(cluster_id, kind, &global_id).await? {
            Some(row) => {
                let holder = format!("event/{}", uuid::Uuid::new_v4());
                self.remove_row(manager.as_ref(), &row, &holder, false)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Creates `input` in the member cluster and tracks it. The row is
    /// filed as `creating` first and kept as `create_fail` when the remote
    /// create fails.
    pub async fn create(
        &self,
        client: &dyn ClusterApi,
        input: &ResourceCreateInput,
    ) -> Result<ClusterResource> {
        let manager = self.manager(input.kind)?;
        let object = manager.new_remote_from_input(input)?;
        let cluster_id = client.cluster_id();
        let holder = format!("create/{}", uuid::Uuid::new_v4());
        let mut row = ClusterResource::new(
            cluster_id,
            input.kind,
            object.namespace().as_deref(),
            &input.name,
        );
        let _lock = {
            let _class = self
                .locks
                .lock_class(input.kind.as_str(), cluster_id, &holder)
                .await;
            let lookup = RemoteObject {
                uid: String::new(),
                namespace: row.namespace.clone(),
                name: row.base.name.clone(),
                resource_version: 0,
                labels: Default::default(),
                phase: None,
                body: Value::Null,
            };
            if let Some(existing) = manager
                .local_exists(self.store.as_ref(), cluster_id, &lookup)
                .await?
            {
                return Err(Error::Conflict(format!(
                    "{} already exists",
                    existing.ident()
                )));
            }
            row.namespace_id = self
                .namespace_id(cluster_id, row.namespace.as_deref())
                .await?;
            row.labels = input.labels.clone();
            row.status = ResourceStatus::Creating;
            self.store.create(&row).await?;
            self.locks
                .lock_object(ClusterResource::KIND, &row.base.id, &holder)
                .await
        };
        info!("creating {}", row.ident());
        match manager.create_remote(client, &object).await {
            Ok(remote) => {
                let global_id = manager.global_id(cluster_id, &remote);
                let manager = manager.clone();
                self.store
                    .modify::<ClusterResource, _>(&row.base.id, move |r| {
                        manager.update_local_from_remote(r, &remote, &global_id)
                    })
                    .await
            }
            Err(e) => {
                warn!("failed to create {}: {}", row.ident(), e);
                let reason = e.to_string();
                self.store
                    .modify::<ClusterResource, _>(&row.base.id, move |r| {
                        r.status = ResourceStatus::CreateFail;
                        r.status_reason = Some(reason);
                        Ok(())
                    })
                    .await?;
                Err(e.context(format!("create {}", row.ident())))
            }
        }
    }

    /// Deletes a tracked object from its cluster, then its row.
    pub async fn delete(&self, client: &dyn ClusterApi, row_id: &str) -> Result<()> {
        let row: ClusterResource = self.store.fetch(row_id).await?;
        let manager = self.manager(row.kind)?;
        let holder = format!("delete/{}", uuid::Uuid::new_v4());
        let _lock = self
            .locks
            .lock_object(ClusterResource::KIND, &row.base.id, &holder)
            .await;
        manager.validate_delete(self.store.as_ref(), &row).await?;
        self.store
            .modify::<ClusterResource, _>(&row.base.id, |r| {
                r.status = ResourceStatus::Deleting;
                Ok(())
            })
            .await?;
        if let Err(e) = manager.delete_remote(client, &row).await {
            self.mark_delete_fail(&row, &e).await;
            return Err(e.context(format!("delete {}", row.ident())));
        }
        self.remove_row(manager.as_ref(), &row, &holder, true).await
    }
}
