//! Cluster components: typed settings rendered into helm values of a
//! bundled chart.
//!
//! A cluster runs at most one component per type. The deploy, update and
//! undeploy operations file the new status and hand the helm work to a
//! [`ComponentTask`].

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use kubefleet_apis::{
    CephCsiClusterConfig, Cluster, ClusterComponent, Component, ComponentSettings,
    ComponentStatus, ComponentType, FluentBitBackend, ObjectBase, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AddonInstaller;
use crate::{
    drivers::{ComponentDriver, DriverRegistry},
    errors::{Error, Result},
    registry::ClusterRegistry,
    store::{Query, Store, StoreExt, Transaction},
    tasks::{Step, TaskContext, TaskHandler},
};

/// Renders `values` to YAML and reads it back as an untyped map.
fn untyped<T: Serialize>(values: &T) -> Result<Value> {
    let yaml = serde_yaml::to_string(values)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

fn mismatch(expected: ComponentType, settings: &ComponentSettings) -> Error {
    Error::Validation(format!(
        "{} settings given to the {} component",
        settings.component_type(),
        expected
    ))
}

#[derive(Serialize)]
struct Image {
    repository: String,
    tag: &'static str,
}

impl Image {
    fn new(image_repository: &str, name: &str, tag: &'static str) -> Self {
        Self {
            repository: format!("{}/{}", image_repository.trim_end_matches('/'), name),
            tag,
        }
    }
}

#[derive(Serialize)]
struct WithImage {
    image: Image,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CephCsiValues<'a> {
    csi_config: &'a [CephCsiClusterConfig],
    nodeplugin: CephCsiPlugin,
    provisioner: CephCsiPlugin,
}

#[derive(Serialize)]
struct CephCsiPlugin {
    plugin: WithImage,
}

/// RBD provisioner for ceph clusters outside kubernetes.
pub struct CephCsiDriver;

impl ComponentDriver for CephCsiDriver {
    fn component_type(&self) -> ComponentType {
        ComponentType::CephCsi
    }

    fn validate(&self, settings: &ComponentSettings) -> Result<()> {
        let ComponentSettings::CephCsi(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        if settings.config.is_empty() {
            return Err(Error::Validation(
                "cephCSI needs at least one ceph cluster".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for config in &settings.config {
            if config.cluster_id.is_empty() {
                return Err(Error::Validation("ceph clusterID is empty".to_string()));
            }
            if !seen.insert(config.cluster_id.as_str()) {
                return Err(Error::Validation(format!(
                    "ceph cluster {} is listed twice",
                    config.cluster_id
                )));
            }
            if config.monitors.iter().all(|m| m.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "ceph cluster {} has no monitors",
                    config.cluster_id
                )));
            }
        }
        Ok(())
    }

    fn chart_key(&self) -> &'static str {
        "CEPH_CSI_RBD_3_1_0_TGZ"
    }

    fn release_name(&self) -> &'static str {
        "ceph-csi-rbd"
    }

    fn namespace(&self) -> &'static str {
        "ceph-csi"
    }

    fn values(
        &self,
        _cluster: &Cluster,
        settings: &ComponentSettings,
        image_repository: &str,
    ) -> Result<Value> {
        let ComponentSettings::CephCsi(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        let plugin = || CephCsiPlugin {
            plugin: WithImage {
                image: Image::new(image_repository, "cephcsi", "v3.1.0"),
            },
        };
        untyped(&CephCsiValues {
            csi_config: &settings.config,
            nodeplugin: plugin(),
            provisioner: plugin(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GrafanaValues {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin_password: Option<String>,
    image: Image,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusValues {
    retention: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_class_name: Option<String>,
    image: Image,
}

#[derive(Serialize)]
struct LokiValues {
    enabled: bool,
    image: Image,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MonitorValues {
    cluster_name: String,
    grafana: GrafanaValues,
    prometheus: PrometheusValues,
    loki: LokiValues,
}

/// `7d`, `12h`, `30m`, ...
fn is_duration(s: &str) -> bool {
    match s.char_indices().last() {
        Some((i, unit)) if i > 0 => {
            "smhdwy".contains(unit) && s[..i].chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Prometheus, grafana and optionally loki.
pub struct MonitorDriver;

impl ComponentDriver for MonitorDriver {
    fn component_type(&self) -> ComponentType {
        ComponentType::Monitor
    }

    fn validate(&self, settings: &ComponentSettings) -> Result<()> {
        let ComponentSettings::Monitor(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        if !is_duration(&settings.prometheus_retention) {
            return Err(Error::Validation(format!(
                "invalid prometheus retention {:?}",
                settings.prometheus_retention
            )));
        }
        if settings
            .grafana_admin_password
            .as_deref()
            .is_some_and(str::is_empty)
        {
            return Err(Error::Validation(
                "grafana admin password is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn chart_key(&self) -> &'static str {
        "MONITOR_STACK_0_1_0_TGZ"
    }

    fn release_name(&self) -> &'static str {
        "monitor"
    }

    fn namespace(&self) -> &'static str {
        "onecloud-monitoring"
    }

    fn values(
        &self,
        cluster: &Cluster,
        settings: &ComponentSettings,
        image_repository: &str,
    ) -> Result<Value> {
        let ComponentSettings::Monitor(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        untyped(&MonitorValues {
            cluster_name: cluster.base.name.clone(),
            grafana: GrafanaValues {
                enabled: settings.grafana_enabled,
                admin_password: settings.grafana_admin_password.clone(),
                image: Image::new(image_repository, "grafana", "7.1.1"),
            },
            prometheus: PrometheusValues {
                retention: settings.prometheus_retention.clone(),
                storage_class_name: settings.prometheus_storage_class.clone(),
                image: Image::new(image_repository, "prometheus", "v2.20.1"),
            },
            loki: LokiValues {
                enabled: settings.loki_enabled,
                image: Image::new(image_repository, "loki", "1.6.0"),
            },
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FluentBitValues<'a> {
    cluster_name: &'a str,
    image: Image,
    backend: &'a FluentBitBackend,
}

/// Ships container logs to elasticsearch or kafka.
pub struct FluentBitDriver;

impl ComponentDriver for FluentBitDriver {
    fn component_type(&self) -> ComponentType {
        ComponentType::FluentBit
    }

    fn validate(&self, settings: &ComponentSettings) -> Result<()> {
        let ComponentSettings::FluentBit(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        let backend = &settings.backend;
        let es = backend.es.as_ref().filter(|es| es.enabled);
        let kafka = backend.kafka.as_ref().filter(|k| k.enabled);
        if es.is_none() && kafka.is_none() {
            return Err(Error::Validation(
                "fluentbit needs an enabled es or kafka backend".to_string(),
            ));
        }
        if es.is_some_and(|es| es.host.is_empty()) {
            return Err(Error::Validation("es backend host is empty".to_string()));
        }
        if kafka.is_some_and(|k| k.brokers.is_empty() || k.topics.is_empty()) {
            return Err(Error::Validation(
                "kafka backend needs brokers and topics".to_string(),
            ));
        }
        Ok(())
    }

    fn chart_key(&self) -> &'static str {
        "FLUENT_BIT_2_8_12_TGZ"
    }

    fn release_name(&self) -> &'static str {
        "fluentbit"
    }

    fn namespace(&self) -> &'static str {
        "onecloud-logging"
    }

    fn values(
        &self,
        cluster: &Cluster,
        settings: &ComponentSettings,
        image_repository: &str,
    ) -> Result<Value> {
        let ComponentSettings::FluentBit(settings) = settings else {
            return Err(mismatch(self.component_type(), settings));
        };
        untyped(&FluentBitValues {
            cluster_name: &cluster.base.name,
            image: Image::new(image_repository, "fluent-bit", "1.5.4"),
            backend: &settings.backend,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentAction {
    Deploy,
    Update,
    Undeploy,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ComponentParams {
    pub cluster_id: String,
    pub component_id: String,
    pub action: ComponentAction,
}

pub struct ComponentManager {
    store: Arc<dyn Store>,
    registry: Arc<ClusterRegistry>,
    drivers: Arc<DriverRegistry>,
    installer: Arc<AddonInstaller>,
    image_repository: String,
}

impl ComponentManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ClusterRegistry>,
        drivers: Arc<DriverRegistry>,
        installer: Arc<AddonInstaller>,
        image_repository: String,
    ) -> Self {
        Self {
            store,
            registry,
            drivers,
            installer,
            image_repository,
        }
    }

    pub async fn find(
        &self,
        cluster_id: &str,
        component_type: ComponentType,
    ) -> Result<Option<Component>> {
        let link: Option<ClusterComponent> = self
            .store
            .find(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("type", component_type),
            )
            .await?;
        match link {
            Some(link) => self.store.fetch(&link.component_id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_idle(&self, cluster_id: &str, component_type: ComponentType) -> Result<Component> {
        let component = self.find(cluster_id, component_type).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "component {} not found in cluster {}",
                component_type, cluster_id
            ))
        })?;
        if component.status.is_busy() {
            return Err(Error::Conflict(format!(
                "component {} is {}",
                component_type, component.status
            )));
        }
        Ok(component)
    }

    async fn set_status(
        &self,
        component_id: &str,
        status: ComponentStatus,
        reason: Option<String>,
    ) -> Result<Component> {
        self.store
            .modify::<Component, _>(component_id, move |c| {
                c.status = status;
                c.status_reason = reason;
                Ok(())
            })
            .await
    }

    /// Files the component as `deploying`. A disabled component of the same
    /// type is re-enabled with the new settings.
    pub async fn enable(&self, cluster: &Cluster, settings: ComponentSettings) -> Result<Component> {
        if !cluster.is_running() {
            return Err(Error::Validation(format!(
                "cluster {} is {}",
                cluster.ident(),
                cluster.status
            )));
        }
        let component_type = settings.component_type();
        self.drivers.component(component_type)?.validate(&settings)?;
        if let Some(existing) = self.find(&cluster.base.id, component_type).await? {
            if existing.enabled || existing.status.is_busy() {
                return Err(Error::Conflict(format!(
                    "component {} already enabled in cluster {}",
                    component_type,
                    cluster.ident()
                )));
            }
            return self
                .store
                .modify::<Component, _>(&existing.base.id, move |c| {
                    c.enabled = true;
                    c.settings = settings;
                    c.status = ComponentStatus::Deploying;
                    c.status_reason = None;
                    Ok(())
                })
                .await;
        }
        let component = Component {
            base: ObjectBase::new(component_type.as_str()),
            type_: component_type,
            enabled: true,
            settings,
            status: ComponentStatus::Deploying,
            status_reason: None,
        };
        let link = ClusterComponent {
            base: ObjectBase::new(format!("{}-{}", cluster.base.name, component_type)),
            cluster_id: cluster.base.id.clone(),
            component_id: component.base.id.clone(),
            type_: component_type,
        };
        let mut tx = Transaction::new();
        tx.insert(&component)?.insert(&link)?;
        self.store.commit(tx).await?;
        info!(
            "enabled component {} in cluster {}",
            component_type,
            cluster.ident()
        );
        Ok(component)
    }

    pub async fn update(
        &self,
        cluster_id: &str,
        settings: ComponentSettings,
    ) -> Result<Component> {
        let component_type = settings.component_type();
        let component = self.get_idle(cluster_id, component_type).await?;
        if !component.enabled {
            return Err(Error::Validation(format!(
                "component {} is disabled",
                component_type
            )));
        }
        self.drivers.component(component_type)?.validate(&settings)?;
        self.store
            .modify::<Component, _>(&component.base.id, move |c| {
                c.settings = settings;
                c.status = ComponentStatus::Updating;
                c.status_reason = None;
                Ok(())
            })
            .await
    }

    pub async fn disable(&self, cluster_id: &str, component_type: ComponentType) -> Result<Component> {
        let component = self.get_idle(cluster_id, component_type).await?;
        if !component.enabled {
            return Err(Error::Validation(format!(
                "component {} is already disabled",
                component_type
            )));
        }
        self.set_status(&component.base.id, ComponentStatus::Undeploying, None)
            .await
    }

    pub async fn delete(&self, cluster_id: &str, component_type: ComponentType) -> Result<Component> {
        let component = self.get_idle(cluster_id, component_type).await?;
        self.set_status(&component.base.id, ComponentStatus::Deleting, None)
            .await
    }

    /// Deploys the component's chart. `upgrade` moves an installed release.
    async fn install(&self, cluster_id: &str, component_id: &str, upgrade: bool) -> Result<()> {
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        let component: Component = self.store.fetch(component_id).await?;
        let driver = self.drivers.component(component.type_)?;
        let repository = cluster
            .image_repository
            .as_deref()
            .unwrap_or(&self.image_repository);
        let values = driver.values(&cluster, &component.settings, repository)?;
        let client = self.registry.get(cluster_id).await?;
        let (key, name, namespace) = (driver.chart_key(), driver.release_name(), driver.namespace());
        if upgrade {
            self.installer
                .upgrade_chart(client.as_ref(), key, name, namespace, values)
                .await?;
        } else {
            self.installer
                .install_chart(client.as_ref(), key, name, namespace, values)
                .await?;
        }
        Ok(())
    }

    async fn uninstall(&self, cluster_id: &str, component: &Component) -> Result<()> {
        let driver = self.drivers.component(component.type_)?;
        let client = self.registry.get(cluster_id).await?;
        self.installer
            .uninstall_chart(client.as_ref(), driver.release_name(), driver.namespace())
            .await
    }

    async fn remove(&self, cluster_id: &str, component: &Component) -> Result<()> {
        let links: Vec<ClusterComponent> = self
            .store
            .list(
                &Query::new()
                    .eq("cluster_id", cluster_id)
                    .eq("component_id", &component.base.id),
            )
            .await?;
        let mut tx = Transaction::new();
        for link in &links {
            tx.delete::<ClusterComponent>(&link.base.id);
        }
        tx.delete::<Component>(&component.base.id);
        self.store.commit(tx).await
    }
}

/// Applies a component action to its cluster through helm.
pub struct ComponentTask(pub Arc<ComponentManager>);

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum ComponentStage {
    #[default]
    Init,
}

#[async_trait]
impl TaskHandler for ComponentTask {
    const NAME: &'static str = "ComponentDeploy";
    const OWNER_KIND: &'static str = Component::KIND;
    type Params = ComponentParams;
    type Stage = ComponentStage;

    async fn run(
        &self,
        _ctx: &TaskContext,
        params: &ComponentParams,
        _stage: ComponentStage,
    ) -> Result<Step<ComponentStage>> {
        let manager = &self.0;
        let (cluster_id, component_id) = (&params.cluster_id, &params.component_id);
        match params.action {
            ComponentAction::Deploy | ComponentAction::Update => {
                let upgrade = params.action == ComponentAction::Update;
                manager.install(cluster_id, component_id, upgrade).await?;
                manager
                    .set_status(component_id, ComponentStatus::Deployed, None)
                    .await?;
            }
            ComponentAction::Undeploy => {
                let component: Component = manager.store.fetch(component_id).await?;
                manager.uninstall(cluster_id, &component).await?;
                manager
                    .store
                    .modify::<Component, _>(component_id, |c| {
                        c.enabled = false;
                        c.status = ComponentStatus::Init;
                        c.status_reason = None;
                        Ok(())
                    })
                    .await?;
            }
            ComponentAction::Delete => {
                let component: Component = manager.store.fetch(component_id).await?;
                if component.enabled {
                    manager.uninstall(cluster_id, &component).await?;
                }
                manager.remove(cluster_id, &component).await?;
            }
        }
        info!(
            "component {} in cluster {}: {:?} done",
            component_id, cluster_id, params.action
        );
        Ok(Step::Complete)
    }

    async fn on_failure(&self, _ctx: &TaskContext, params: &ComponentParams, reason: &str) {
        let status = match params.action {
            ComponentAction::Deploy => ComponentStatus::DeployFail,
            ComponentAction::Update => ComponentStatus::UpdateFail,
            ComponentAction::Undeploy => ComponentStatus::UndeployFail,
            ComponentAction::Delete => ComponentStatus::DeleteFail,
        };
        if let Err(e) = self
            .0
            .set_status(&params.component_id, status, Some(reason.to_string()))
            .await
        {
            error!(
                "failed to record {:?} failure of component {}: {}",
                params.action, params.component_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::fake::FakeClientFactory, config::Configuration, metrics::Metrics,
        store::MemoryStore,
    };
    use kubefleet_apis::{
        CephCsiSettings, ClusterCreateInput, ClusterStatus, FluentBitBackendEs,
        FluentBitBackendKafka, FluentBitSettings, MonitorSettings, UserCred,
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn es(enabled: bool) -> FluentBitBackendEs {
        FluentBitBackendEs {
            enabled,
            host: "es.logging".to_string(),
            port: 9200,
            index: "k8s".to_string(),
            http_user: None,
            http_password: None,
        }
    }

    fn fluentbit(backend: FluentBitBackend) -> ComponentSettings {
        ComponentSettings::FluentBit(FluentBitSettings { backend })
    }

    #[test]
    fn fluentbit_needs_an_enabled_backend() {
        let driver = FluentBitDriver;
        assert!(matches!(
            driver.validate(&fluentbit(FluentBitBackend::default())),
            Err(Error::Validation(_))
        ));
        assert!(
            driver
                .validate(&fluentbit(FluentBitBackend {
                    es: Some(es(false)),
                    kafka: None,
                }))
                .is_err()
        );
        let kafka = FluentBitBackendKafka {
            enabled: true,
            brokers: vec!["kafka:9092".to_string()],
            topics: vec![],
        };
        assert!(
            driver
                .validate(&fluentbit(FluentBitBackend {
                    es: None,
                    kafka: Some(kafka),
                }))
                .is_err()
        );
        driver
            .validate(&fluentbit(FluentBitBackend {
                es: Some(es(true)),
                kafka: None,
            }))
            .unwrap();
        assert!(
            driver
                .validate(&ComponentSettings::Monitor(MonitorSettings::default()))
                .is_err()
        );
    }

    #[test]
    fn ceph_clusters_are_unique_and_monitored() {
        let settings = |ids: &[&str], monitors: Vec<String>| {
            ComponentSettings::CephCsi(CephCsiSettings {
                config: ids
                    .iter()
                    .map(|id| CephCsiClusterConfig {
                        cluster_id: id.to_string(),
                        monitors: monitors.clone(),
                    })
                    .collect(),
            })
        };
        let mons = vec!["10.0.0.1:6789".to_string()];
        CephCsiDriver.validate(&settings(&["a"], mons.clone())).unwrap();
        assert!(CephCsiDriver.validate(&settings(&[], mons.clone())).is_err());
        assert!(CephCsiDriver.validate(&settings(&["a", "a"], mons)).is_err());
        assert!(CephCsiDriver.validate(&settings(&["a"], vec![])).is_err());
    }

    #[test]
    fn monitor_retention_is_a_duration() {
        assert!(is_duration("7d"));
        assert!(is_duration("720h"));
        assert!(!is_duration("d"));
        assert!(!is_duration("7 days"));
        let bad = MonitorSettings {
            prometheus_retention: "forever".to_string(),
            ..Default::default()
        };
        assert!(MonitorDriver.validate(&ComponentSettings::Monitor(bad)).is_err());
    }

    fn cluster() -> Cluster {
        let input: ClusterCreateInput = serde_json::from_value(json!({
            "name": "c1",
            "provider": "system",
            "mode": "import",
            "kubeconfig": "kubeconfig-1",
        }))
        .unwrap();
        let mut cluster = Cluster::new(&input);
        cluster.status = ClusterStatus::Running;
        cluster
    }

    #[test]
    fn values_use_the_image_mirror() {
        let values = FluentBitDriver
            .values(
                &cluster(),
                &fluentbit(FluentBitBackend {
                    es: Some(es(true)),
                    kafka: None,
                }),
                "registry.example.com/mirror/",
            )
            .unwrap();
        assert_eq!(
            json!("registry.example.com/mirror/fluent-bit"),
            values["image"]["repository"]
        );
        assert_eq!(json!("es.logging"), values["backend"]["es"]["host"]);
        assert_eq!(json!("c1"), values["clusterName"]);
        assert!(values["backend"].get("kafka").is_none());
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        factory: Arc<FakeClientFactory>,
        manager: Arc<ComponentManager>,
        cluster: Cluster,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = Arc::new(ClusterRegistry::new(
            store.clone(),
            factory.clone(),
            Metrics::new(),
        ));
        let mut drivers = DriverRegistry::new();
        drivers.register_component(Arc::new(FluentBitDriver)).unwrap();
        let installer = AddonInstaller::new(Configuration::default(), Metrics::new())
            .with_chart("FLUENT_BIT_2_8_12_TGZ", b"fluent-bit".to_vec());
        let manager = Arc::new(ComponentManager::new(
            store.clone(),
            registry,
            Arc::new(drivers),
            Arc::new(installer),
            "registry.example.com".to_string(),
        ));
        let cluster = cluster();
        store.create(&cluster).await.unwrap();
        Fixture {
            store,
            factory,
            manager,
            cluster,
        }
    }

    fn context() -> TaskContext {
        TaskContext {
            task_id: "t1".to_string(),
            owner_id: "o1".to_string(),
            user_cred: UserCred::system(),
            cancel: CancellationToken::new(),
        }
    }

    async fn run(f: &Fixture, component: &Component, action: ComponentAction) -> Result<()> {
        ComponentTask(f.manager.clone())
            .run(
                &context(),
                &ComponentParams {
                    cluster_id: f.cluster.base.id.clone(),
                    component_id: component.base.id.clone(),
                    action,
                },
                ComponentStage::Init,
            )
            .await
            .map(|_| ())
    }

    fn logging() -> ComponentSettings {
        fluentbit(FluentBitBackend {
            es: Some(es(true)),
            kafka: None,
        })
    }

    #[tokio::test]
    async fn one_component_per_type() {
        let f = fixture().await;
        let component = f.manager.enable(&f.cluster, logging()).await.unwrap();
        assert_eq!(ComponentStatus::Deploying, component.status);
        assert!(
            f.manager
                .enable(&f.cluster, logging())
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            f.manager
                .update(&f.cluster.base.id, logging())
                .await
                .unwrap_err()
                .is_conflict()
        );
    }

    #[tokio::test]
    async fn deploy_then_disable_then_delete() {
        let f = fixture().await;
        let backend = f.factory.backend(&f.cluster.base.id);
        let component = f.manager.enable(&f.cluster, logging()).await.unwrap();
        run(&f, &component, ComponentAction::Deploy).await.unwrap();
        let deployed: Component = f.store.fetch(&component.base.id).await.unwrap();
        assert_eq!(ComponentStatus::Deployed, deployed.status);
        let releases = backend.releases();
        assert_eq!(1, releases.len());
        assert_eq!("fluentbit", releases[0].name);
        assert_eq!("onecloud-logging", releases[0].namespace);

        f.manager
            .disable(&f.cluster.base.id, ComponentType::FluentBit)
            .await
            .unwrap();
        run(&f, &component, ComponentAction::Undeploy).await.unwrap();
        let disabled: Component = f.store.fetch(&component.base.id).await.unwrap();
        assert!(!disabled.enabled);
        assert_eq!(ComponentStatus::Init, disabled.status);
        assert!(backend.releases().is_empty());

        let again = f.manager.enable(&f.cluster, logging()).await.unwrap();
        assert_eq!(component.base.id, again.base.id);

        f.store
            .modify::<Component, _>(&component.base.id, |c| {
                c.status = ComponentStatus::Deployed;
                Ok(())
            })
            .await
            .unwrap();
        f.manager
            .delete(&f.cluster.base.id, ComponentType::FluentBit)
            .await
            .unwrap();
        run(&f, &component, ComponentAction::Delete).await.unwrap();
        assert!(
            f.manager
                .find(&f.cluster.base.id, ComponentType::FluentBit)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(0, f.store.count(ClusterComponent::KIND));
    }

    #[tokio::test]
    async fn update_upgrades_the_release() {
        let f = fixture().await;
        let backend = f.factory.backend(&f.cluster.base.id);
        let component = f.manager.enable(&f.cluster, logging()).await.unwrap();
        run(&f, &component, ComponentAction::Deploy).await.unwrap();

        let settings = FluentBitBackend {
            es: Some(FluentBitBackendEs {
                host: "es.other".to_string(),
                ..es(true)
            }),
            kafka: None,
        };
        let updating = f
            .manager
            .update(&f.cluster.base.id, fluentbit(settings))
            .await
            .unwrap();
        assert_eq!(ComponentStatus::Updating, updating.status);
        run(&f, &component, ComponentAction::Update).await.unwrap();

        let releases = backend.releases();
        assert_eq!(1, releases.len());
        assert_eq!(2, releases[0].revision);
        assert_eq!("deployed", releases[0].status);
        let deployed: Component = f.store.fetch(&component.base.id).await.unwrap();
        assert_eq!(ComponentStatus::Deployed, deployed.status);
    }

    #[tokio::test]
    async fn failed_deploy_is_recorded() {
        let f = fixture().await;
        let component = f.manager.enable(&f.cluster, logging()).await.unwrap();
        f.factory.backend(&f.cluster.base.id).set_unreachable(true);
        let err = run(&f, &component, ComponentAction::Deploy).await.unwrap_err();
        let params = ComponentParams {
            cluster_id: f.cluster.base.id.clone(),
            component_id: component.base.id.clone(),
            action: ComponentAction::Deploy,
        };
        ComponentTask(f.manager.clone())
            .on_failure(&context(), &params, &err.to_string())
            .await;
        let failed: Component = f.store.fetch(&component.base.id).await.unwrap();
        assert_eq!(ComponentStatus::DeployFail, failed.status);
        assert!(failed.status_reason.is_some());
    }
}
