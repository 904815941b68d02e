use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
};
use kube_runtime::{
    WatchStreamExt,
    reflector::{self, Store},
    watcher,
};
use kubefleet_apis::{Cluster, ResourceKind};
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    ClientFactory, ClusterApi, HelmInstall, InformerEvent, ReleaseInfo,
    kinds::{api_resource, parse_selector, selector_matches, stamp_types},
};
use crate::{
    MANAGER,
    config::Configuration,
    errors::{Context, Error, ExtKubeApiError, Result},
};

/// Typed and dynamic access to one member cluster, backed by one informer
/// per watched kind.
pub struct ClusterClient {
    cluster_id: String,
    client: Client,
    kubeconfig_path: PathBuf,
    caches: HashMap<ResourceKind, Store<DynamicObject>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    sync_timeout: Duration,
}

fn kubeconfig_file(tmp_dir: &Path, cluster: &Cluster) -> PathBuf {
    tmp_dir.join(format!(
        "kubecluster-{}-{}-.kubeconfig",
        cluster.base.name, cluster.base.id
    ))
}

fn write_kubeconfig(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

async fn run_informer<S>(
    cluster_id: String,
    kind: ResourceKind,
    stream: S,
    events: mpsc::Sender<InformerEvent>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>> + Send,
{
    let pump = stream.for_each(|event| {
        let events = events.clone();
        let cluster_id = cluster_id.clone();
        async move {
            let event = match event {
                Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                    InformerEvent::Applied {
                        cluster_id,
                        kind,
                        object,
                    }
                }
                Ok(watcher::Event::Delete(object)) => InformerEvent::Deleted {
                    cluster_id,
                    kind,
                    object,
                },
                Ok(_) => return,
                Err(e) => {
                    warn!("informer for {} of cluster {} failed: {}", kind, cluster_id, e);
                    return;
                }
            };
            if events.send(event).await.is_err() {
                debug!("informer event receiver is gone");
            }
        }
    });
    tokio::select! {
        _ = shutdown.cancelled() => debug!("stopped informer for {} of cluster {}", kind, cluster_id),
        _ = pump => (),
    }
}

#[derive(Deserialize)]
struct HelmListEntry {
    name: String,
    namespace: String,
    revision: String,
    status: String,
    chart: String,
    #[serde(default)]
    app_version: String,
}

impl From<HelmListEntry> for ReleaseInfo {
    fn from(e: HelmListEntry) -> Self {
        ReleaseInfo {
            name: e.name,
            namespace: e.namespace,
            revision: e.revision.parse().unwrap_or(0),
            status: e.status,
            chart: e.chart,
            app_version: e.app_version,
        }
    }
}

async fn run_command(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|e| Error::Driver(format!("failed to run {}: {}", program, e)))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Driver(format!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl ClusterClient {
    /// Runs `helm install`, or `helm upgrade --install` with `upgrade`, and
    /// reads the resulting release back.
    async fn helm_release(&self, install: &HelmInstall, upgrade: bool) -> Result<ReleaseInfo> {
        let chart = tempfile::Builder::new().suffix(".tgz").tempfile()?;
        std::fs::write(chart.path(), &install.chart)?;
        let values = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        std::fs::write(values.path(), serde_yaml::to_string(&install.values)?)?;
        let chart_path = chart.path().to_string_lossy().to_string();
        let values_path = values.path().to_string_lossy().to_string();
        let mut args = if upgrade {
            vec!["upgrade", "--install"]
        } else {
            vec!["install"]
        };
        args.extend([
            install.name.as_str(),
            chart_path.as_str(),
            "--namespace",
            install.namespace.as_str(),
            "--values",
            values_path.as_str(),
        ]);
        if install.atomic {
            args.push("--atomic");
        }
        if install.replace && !upgrade {
            args.push("--replace");
        }
        let verb = if upgrade { "upgrade" } else { "install" };
        self.helm(&args).await.with_context(|| {
            format!("{} release {}/{}", verb, install.namespace, install.name)
        })?;
        self.helm_list(Some(&install.namespace))
            .await?
            .into_iter()
            .find(|r| r.name == install.name)
            .ok_or_else(|| {
                Error::Driver(format!(
                    "release {}/{} missing after {}",
                    install.namespace, install.name, verb
                ))
            })
    }

    pub async fn new(
        cluster: &Cluster,
        config: &Configuration,
        events: mpsc::Sender<InformerEvent>,
    ) -> Result<Self> {
        let kubeconfig = cluster.kubeconfig.as_deref().ok_or_else(|| {
            Error::Validation(format!("cluster {} has no kubeconfig", cluster.ident()))
        })?;
        let parsed = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
            Error::Validation(format!(
                "invalid kubeconfig of cluster {}: {}",
                cluster.ident(),
                e
            ))
        })?;
        let client_config =
            kube::Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::Validation(format!(
                        "invalid kubeconfig of cluster {}: {}",
                        cluster.ident(),
                        e
                    ))
                })?;
        let client = Client::try_from(client_config)?;
        let kubeconfig_path = kubeconfig_file(&config.tmp_dir, cluster);
        write_kubeconfig(&kubeconfig_path, kubeconfig)?;

        let shutdown = CancellationToken::new();
        let mut caches = HashMap::new();
        for kind in ResourceKind::informer_kinds() {
            let ar = api_resource(kind)?;
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            let writer = reflector::store::Writer::<DynamicObject>::new(ar.clone());
            caches.insert(kind, writer.as_reader());
            let stream = reflector::reflector(
                writer,
                watcher::watcher(api, watcher::Config::default()).default_backoff(),
            );
            tokio::spawn(run_informer(
                cluster.base.id.clone(),
                kind,
                stream,
                events.clone(),
                shutdown.child_token(),
            ));
        }
        info!(
            "started {} informers for cluster {}",
            caches.len(),
            cluster.ident()
        );
        Ok(Self {
            cluster_id: cluster.base.id.clone(),
            client,
            kubeconfig_path,
            caches,
            shutdown,
            closed: AtomicBool::new(false),
            sync_timeout: config.informer_resync,
        })
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let ar = api_resource(kind)?;
        Ok(match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn cache(&self, kind: ResourceKind) -> Result<&Store<DynamicObject>> {
        self.caches
            .get(&kind)
            .ok_or_else(|| Error::Unsupported(format!("no informer for {}", kind)))
    }

    async fn helm(&self, args: &[&str]) -> Result<String> {
        let kubeconfig = self.kubeconfig_path.to_string_lossy().to_string();
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["--kubeconfig", kubeconfig.as_str()]);
        run_command("helm", &full, None).await
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl ClusterApi for ClusterClient {
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
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        match std::fs::remove_file(&self.kubeconfig_path) {
            Ok(_) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!(
                "failed to remove kubeconfig {}: {}",
                self.kubeconfig_path.display(),
                e
            ),
        }
        info!("closed client of cluster {}", self.cluster_id);
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let object = self
            .api(kind, namespace)?
            .get(name)
            .await
            .with_context(|| format!("get {} {}/{}", kind, namespace.unwrap_or(""), name))?;
        stamp_types(kind, object)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let selector = label_selector.map(parse_selector).transpose()?;
        let mut result = vec![];
        for object in self.cache(kind)?.state() {
            if namespace.is_some() && object.namespace().as_deref() != namespace {
                continue;
            }
            if let Some(selector) = &selector {
                if !selector_matches(object.labels(), selector) {
                    continue;
                }
            }
            result.push(stamp_types(kind, object.as_ref().clone())?);
        }
        Ok(result)
    }

    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject> {
        let namespace = object.namespace();
        let created = self
            .api(kind, namespace.as_deref())?
            .create(&PostParams::default(), object)
            .await
            .with_context(|| format!("create {} {}", kind, object.name_any()))?;
        stamp_types(kind, created)
    }

    async fn update(&self, kind: ResourceKind, object: &DynamicObject) -> Result<DynamicObject> {
        let namespace = object.namespace();
        let name = object.name_any();
        let updated = self
            .api(kind, namespace.as_deref())?
            .replace(&name, &PostParams::default(), object)
            .await
            .with_context(|| format!("update {} {}", kind, name))?;
        stamp_types(kind, updated)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject> {
        let params = PatchParams {
            field_manager: Some(MANAGER.to_string()),
            dry_run: false,
            force: false,
            ..Default::default()
        };
        let patched = self
            .api(kind, namespace)?
            .patch(name, &params, &Patch::<DynamicObject>::Json(patch.clone()))
            .await
            .with_context(|| format!("patch {} {}", kind, name))?;
        stamp_types(kind, patched)
    }

    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<()> {
        match self
            .api(kind, namespace)?
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(
                    "tried to delete {} {}/{} but it does no longer exist",
                    kind,
                    namespace.unwrap_or(""),
                    name
                );
                Ok(())
            }
            Err(e) => Err(Error::from(e).context(format!("delete {} {}", kind, name))),
        }
    }

    async fn server_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("get server version")?;
        Ok(info.git_version)
    }

    async fn resync(&self) -> Result<()> {
        for (kind, cache) in &self.caches {
            match tokio::time::timeout(self.sync_timeout, cache.wait_until_ready()).await {
                Ok(Ok(())) => (),
                Ok(Err(_)) => {
                    return Err(Error::Fatal(format!(
                        "informer for {} of cluster {} is gone",
                        kind, self.cluster_id
                    )));
                }
                Err(_) => {
                    return Err(Error::Transient(format!(
                        "informer cache for {} of cluster {} not synced",
                        kind, self.cluster_id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn helm_list(&self, namespace: Option<&str>) -> Result<Vec<ReleaseInfo>> {
        let mut args = vec!["list", "--all", "--output", "json"];
        match namespace {
            Some(ns) => args.extend(["--namespace", ns]),
            None => args.push("--all-namespaces"),
        }
        let out = self.helm(&args).await?;
        let entries: Vec<HelmListEntry> = if out.trim().is_empty() {
            vec![]
        } else {
            serde_json::from_str(&out)?
        };
        Ok(entries.into_iter().map(ReleaseInfo::from).collect())
    }

    async fn helm_install(&self, install: &HelmInstall) -> Result<ReleaseInfo> {
        self.helm_release(install, false).await
    }

    async fn helm_upgrade(&self, install: &HelmInstall) -> Result<ReleaseInfo> {
        self.helm_release(install, true).await
    }

    async fn helm_uninstall(&self, namespace: &str, name: &str) -> Result<()> {
        match self.helm(&["uninstall", name, "--namespace", namespace]).await {
            Ok(_) => Ok(()),
            Err(Error::Driver(msg)) if msg.contains("not found") => Err(Error::NotFound(format!(
                "release {}/{} not found",
                namespace, name
            ))),
            Err(e) => Err(e),
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let kubeconfig = self.kubeconfig_path.to_string_lossy().to_string();
        let mut full = vec!["--kubeconfig", kubeconfig.as_str()];
        full.extend_from_slice(args);
        run_command("kubectl", &full, stdin).await
    }
}

/// Connects to clusters with their stored kubeconfig.
pub struct KubeClientFactory {
    config: Configuration,
    events: mpsc::Sender<InformerEvent>,
}

impl KubeClientFactory {
    pub fn new(config: Configuration, events: mpsc::Sender<InformerEvent>) -> Self {
        Self { config, events }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        let client = ClusterClient::new(cluster, &self.config, self.events.clone()).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubefleet_apis::{ClusterCreateInput, ClusterMode, ClusterProvider};

    #[test]
    fn kubeconfig_file_name() {
        let input: ClusterCreateInput = serde_json::from_value(serde_json::json!({
            "name": "c1", "provider": ClusterProvider::System, "mode": ClusterMode::Import,
        }))
        .unwrap();
        let cluster = Cluster::new(&input);
        let path = kubeconfig_file(Path::new("/tmp"), &cluster);
        assert_eq!(
            format!("/tmp/kubecluster-c1-{}-.kubeconfig", cluster.base.id),
            path.to_string_lossy()
        );
    }

    #[test]
    fn kubeconfig_is_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kc");
        write_kubeconfig(&path, "apiVersion: v1").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(0o666, mode & 0o777);
    }

    #[test]
    fn helm_list_entries() {
        let out = r#"[{"name":"fluentbit","namespace":"kube-system","revision":"3","updated":"2024-01-01","status":"deployed","chart":"fluent-bit-2.8.12","app_version":"1.6"}]"#;
        let entries: Vec<HelmListEntry> = serde_json::from_str(out).unwrap();
        let release: ReleaseInfo = entries.into_iter().next().unwrap().into();
        assert_eq!(3, release.revision);
        assert_eq!("deployed", release.status);
    }

    #[tokio::test]
    async fn invalid_kubeconfig_is_rejected() {
        let input: ClusterCreateInput = serde_json::from_value(serde_json::json!({
            "name": "c1", "provider": "system", "mode": "import", "kubeconfig": "{not yaml",
        }))
        .unwrap();
        let cluster = Cluster::new(&input);
        let (tx, _rx) = mpsc::channel(1);
        let err = ClusterClient::new(&cluster, &Configuration::default(), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }
}
