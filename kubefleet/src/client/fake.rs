//! In-memory member cluster for tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use kube::{ResourceExt, api::DynamicObject, core::ErrorResponse};
use kubefleet_apis::{Cluster, ResourceKind};

use super::{
    ClientFactory, ClusterApi, HelmInstall, ReleaseInfo,
    kinds::{parse_selector, selector_matches, stamp_types},
};
use crate::errors::{Error, Result};

type ObjectKey = (ResourceKind, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_uid: u64,
    next_version: u64,
    releases: BTreeMap<(String, String), ReleaseInfo>,
    applied: Vec<String>,
    deleted: Vec<String>,
    kubectl_failures: VecDeque<String>,
    unreachable: bool,
    version: String,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeApi(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key(kind: ResourceKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    let ns = if kind.is_namespaced() {
        namespace.unwrap_or_default()
    } else {
        ""
    };
    (kind, ns.to_string(), name.to_string())
}

impl FakeState {
    fn bump(&mut self, object: &mut DynamicObject) {
        self.next_version += 1;
        object.metadata.resource_version = Some(self.next_version.to_string());
    }

    fn install_release(&mut self, install: &HelmInstall, upgrade: bool) -> Result<ReleaseInfo> {
        if !self.objects.contains_key(&key(
            ResourceKind::Namespace,
            None,
            &install.namespace,
        )) {
            return Err(Error::Driver(format!(
                "namespaces \"{}\" not found",
                install.namespace
            )));
        }
        let k = (install.namespace.clone(), install.name.clone());
        let previous = self.releases.get(&k);
        if !upgrade && previous.is_some_and(|r| r.status == "deployed" || !install.replace) {
            return Err(Error::Driver(format!(
                "cannot re-use a name that is still in use: {}",
                install.name
            )));
        }
        let revision = previous.map(|r| r.revision).unwrap_or(0) + 1;
        let release = ReleaseInfo {
            name: install.name.clone(),
            namespace: install.namespace.clone(),
            revision,
            status: "deployed".to_string(),
            chart: String::from_utf8_lossy(&install.chart).to_string(),
            app_version: String::new(),
        };
        self.releases.insert(k, release.clone());
        Ok(release)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(Error::Transient("connection refused".to_string()));
        }
        Ok(())
    }
}

/// The state of one fake cluster, shared by every client built for it.
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                version: "v1.15.12".to_string(),
                ..Default::default()
            }),
        })
    }

    /// Adds or replaces an object out of band, assigning uid and version.
    pub fn insert(&self, kind: ResourceKind, mut object: DynamicObject) -> DynamicObject {
        let mut state = self.state.lock().unwrap();
        if object.metadata.uid.is_none() {
            state.next_uid += 1;
            object.metadata.uid = Some(format!("uid-{}", state.next_uid));
        }
        state.bump(&mut object);
        let k = key(kind, object.namespace().as_deref(), &object.name_any());
        state.objects.insert(k, object.clone());
        object
    }

    /// Deletes an object out of band.
    pub fn remove(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&key(kind, namespace, name))
    }

    pub fn object(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        let state = self.state.lock().unwrap();
        state.objects.get(&key(kind, namespace, name)).cloned()
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<DynamicObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// The next `n` kubectl invocations fail with `message`.
    pub fn fail_kubectl(&self, message: &str, n: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..n {
            state.kubectl_failures.push_back(message.to_string());
        }
    }

    /// Manifests passed to `kubectl apply`.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn releases(&self) -> Vec<ReleaseInfo> {
        self.state
            .lock()
            .unwrap()
            .releases
            .values()
            .cloned()
            .collect()
    }

    pub fn set_release_status(&self, namespace: &str, name: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(release) = state
            .releases
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            release.status = status.to_string();
            release.revision += 1;
        }
    }
}

/// A client handle on a [`FakeBackend`].
pub(crate) struct FakeCluster {
    cluster_id: String,
    backend: Arc<FakeBackend>,
    closed: AtomicBool,
    kubeconfig_path: PathBuf,
}

impl FakeCluster {
    pub fn new(cluster_id: &str, backend: Arc<FakeBackend>) -> Self {
        let kubeconfig_path = std::env::temp_dir().join(format!(
            "kubecluster-fake-{}-{}-.kubeconfig",
            cluster_id,
            uuid::Uuid::new_v4()
        ));
        let _ = std::fs::write(&kubeconfig_path, "apiVersion: v1\nkind: Config\n");
        Self {
            cluster_id: cluster_id.to_string(),
            backend,
            closed: AtomicBool::new(false),
            kubeconfig_path,
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        if self.is_closed() {
            return Err(Error::Fatal(format!(
                "client of cluster {} is closed",
                self.cluster_id
            )));
        }
        let state = self.backend.state.lock().unwrap();
        state.check_reachable()?;
        Ok(state)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig_path
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.kubeconfig_path);
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let state = self.state()?;
        match state.objects.get(&key(kind, namespace, name)) {
            Some(o) => stamp_types(kind, o.clone()),
            None => Err(api_error(
                404,
                "NotFound",
                format!("{} \"{}\" not found", kind, name),
            )),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let selector = label_selector.map(parse_selector).transpose()?;
        let state = self.state()?;
        let mut result = vec![];
        for ((k, ns, _), object) in &state.objects {
            if *k != kind || namespace.is_some_and(|n| n != ns) {
                continue;
            }
            if selector.as_ref().is_some_and(|s| !selector_matches(object.labels(), s)) {
                continue;
            }
            result.push(stamp_types(kind, object.clone())?);
        }
        Ok(result)
    }

    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state()?;
        let namespace = object.namespace();
        if kind.is_namespaced() {
            let ns = namespace.clone().unwrap_or_default();
            if !state
                .objects
                .contains_key(&key(ResourceKind::Namespace, None, &ns))
            {
                return Err(api_error(
                    404,
                    "NotFound",
                    format!("namespaces \"{}\" not found", ns),
                ));
            }
        }
        let k = key(kind, namespace.as_deref(), &object.name_any());
        if state.objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", kind, object.name_any()),
            ));
        }
        let mut created = object.clone();
        state.next_uid += 1;
        created.metadata.uid = Some(format!("uid-{}", state.next_uid));
        state.bump(&mut created);
        state.objects.insert(k, created.clone());
        stamp_types(kind, created)
    }

    async fn update(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state()?;
        let k = key(kind, object.namespace().as_deref(), &object.name_any());
        let uid = match state.objects.get(&k) {
            Some(current) => current.metadata.uid.clone(),
            None => {
                return Err(api_error(
                    404,
                    "NotFound",
                    format!("{} \"{}\" not found", kind, object.name_any()),
                ));
            }
        };
        let mut updated = object.clone();
        updated.metadata.uid = uid;
        state.bump(&mut updated);
        state.objects.insert(k, updated.clone());
        stamp_types(kind, updated)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject> {
        let mut state = self.state()?;
        let k = key(kind, namespace, name);
        let current = match state.objects.get(&k) {
            Some(o) => o.clone(),
            None => {
                return Err(api_error(
                    404,
                    "NotFound",
                    format!("{} \"{}\" not found", kind, name),
                ));
            }
        };
        let mut doc = serde_json::to_value(&current)?;
        json_patch::patch(&mut doc, patch)
            .map_err(|e| api_error(422, "Invalid", e.to_string()))?;
        let mut patched: DynamicObject = serde_json::from_value(doc)?;
        patched.metadata.uid = current.metadata.uid.clone();
        state.bump(&mut patched);
        state.objects.insert(k, patched.clone());
        stamp_types(kind, patched)
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state()?;
        state.objects.remove(&key(kind, namespace, name));
        if kind == ResourceKind::Namespace {
            state
                .objects
                .retain(|(k, ns, _), _| !k.is_namespaced() || ns != name);
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.state()?.version.clone())
    }

    async fn resync(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    async fn helm_list(&self, namespace: Option<&str>) -> Result<Vec<ReleaseInfo>> {
        let state = self.state()?;
        Ok(state
            .releases
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.namespace == ns))
            .cloned()
            .collect())
    }

    async fn helm_install(&self, install: &HelmInstall) -> Result<ReleaseInfo> {
        let mut state = self.state()?;
        state.install_release(install, false)
    }

    async fn helm_upgrade(&self, install: &HelmInstall) -> Result<ReleaseInfo> {
        let mut state = self.state()?;
        state.install_release(install, true)
    }

    async fn helm_uninstall(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state()?;
        match state
            .releases
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!(
                "release {}/{} not found",
                namespace, name
            ))),
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut state = self.state()?;
        if let Some(message) = state.kubectl_failures.pop_front() {
            return Err(Error::Driver(message));
        }
        let manifest = stdin.unwrap_or_default().to_string();
        match args.first().copied() {
            Some("apply") => state.applied.push(manifest),
            Some("delete") => state.deleted.push(manifest),
            _ => (),
        }
        Ok(String::new())
    }
}

/// Hands out [`FakeCluster`]s over per-cluster shared backends.
#[derive(Default)]
pub(crate) struct FakeClientFactory {
    backends: Mutex<HashMap<String, Arc<FakeBackend>>>,
    pub built: AtomicUsize,
}

impl FakeClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The backend of `cluster_id`, created on first use.
    pub fn backend(&self, cluster_id: &str) -> Arc<FakeBackend> {
        self.backends
            .lock()
            .unwrap()
            .entry(cluster_id.to_string())
            .or_insert_with(FakeBackend::new)
            .clone()
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn build(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        let backend = self.backend(&cluster.base.id);
        backend.state.lock().unwrap().check_reachable()?;
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeCluster::new(&cluster.base.id, backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::kinds::new_object, errors::ExtKubeApiError};

    #[tokio::test]
    async fn namespaced_create_requires_namespace() {
        let client = FakeCluster::new("c1", FakeBackend::new());
        let role = new_object(ResourceKind::Role, Some("team-a"), "viewer").unwrap();
        let err = client.create(ResourceKind::Role, &role).await.unwrap_err();
        assert!(err.is_not_found());

        let ns = new_object(ResourceKind::Namespace, None, "team-a").unwrap();
        client.create(ResourceKind::Namespace, &ns).await.unwrap();
        let created = client.create(ResourceKind::Role, &role).await.unwrap();
        assert!(created.metadata.uid.is_some());
        match client.create(ResourceKind::Role, &role).await.unwrap_err() {
            Error::KubeApi(e) => assert!(e.is_already_exists()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn versions_increase() {
        let backend = FakeBackend::new();
        let client = FakeCluster::new("c1", backend.clone());
        let ns = new_object(ResourceKind::Namespace, None, "a").unwrap();
        let first = client.create(ResourceKind::Namespace, &ns).await.unwrap();
        let second = client.update(ResourceKind::Namespace, &first).await.unwrap();
        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert!(
            crate::client::kinds::resource_version(&second)
                > crate::client::kinds::resource_version(&first)
        );
        client
            .delete(ResourceKind::Namespace, None, "a")
            .await
            .unwrap();
        client
            .delete(ResourceKind::Namespace, None, "a")
            .await
            .unwrap();
        assert!(backend.objects(ResourceKind::Namespace).is_empty());
    }

    #[tokio::test]
    async fn close_unlinks_kubeconfig() {
        let client = FakeCluster::new("c1", FakeBackend::new());
        let path = client.kubeconfig_path().to_path_buf();
        assert!(path.exists());
        client.close();
        client.close();
        assert!(!path.exists());
        assert!(client.server_version().await.is_err());
    }
}
