//! The fleet of member cluster clients.
//!
//! Readers share the client map; `add`, `update` and `remove` are totally
//! ordered by the action lock. A replaced client is closed only after its
//! successor is in the map, so `get` never hands out a closed client.

use std::{collections::HashMap, sync::Arc, time::Duration};

use kubefleet_apis::{Cluster, ClusterStatus};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ClientFactory, ClusterApi},
    errors::{Error, Result},
    metrics::Metrics,
    store::{Query, Store, StoreExt},
};

/// What a client was built from. A change forces a rebuild.
#[derive(Clone, Debug, PartialEq)]
struct Fingerprint {
    api_server: Option<String>,
    kubeconfig: Option<String>,
    status: ClusterStatus,
}

impl From<&Cluster> for Fingerprint {
    fn from(c: &Cluster) -> Self {
        Self {
            api_server: c.api_server.clone(),
            kubeconfig: c.kubeconfig.clone(),
            status: c.status,
        }
    }
}

struct Entry {
    client: Arc<dyn ClusterApi>,
    fingerprint: Fingerprint,
}

/// Outcome of loading the registry at startup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StartupTally {
    pub added: usize,
    pub failed: usize,
}

pub struct ClusterRegistry {
    store: Arc<dyn Store>,
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, Entry>>,
    action_lock: Mutex<()>,
    metrics: Metrics,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn Store>, factory: Arc<dyn ClientFactory>, metrics: Metrics) -> Self {
        Self {
            store,
            factory,
            clients: RwLock::new(HashMap::new()),
            action_lock: Mutex::new(()),
            metrics,
        }
    }

    async fn record_size(&self) {
        let size = self.clients.read().await.len();
        self.metrics.registry_size(size);
    }

    /// Builds and registers a client for a Running cluster.
    pub async fn add(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        let _action = self.action_lock.lock().await;
        if self.clients.read().await.contains_key(&cluster.base.id) {
            return Err(Error::Conflict(format!(
                "cluster {} already added",
                cluster.ident()
            )));
        }
        if !cluster.is_running() {
            return Err(Error::Validation(format!(
                "cluster {} is not running but {}",
                cluster.ident(),
                cluster.status
            )));
        }
        let client = self.factory.build(cluster).await?;
        self.clients.write().await.insert(
            cluster.base.id.clone(),
            Entry {
                client: client.clone(),
                fingerprint: cluster.into(),
            },
        );
        info!("added cluster {} to registry", cluster.ident());
        drop(_action);
        self.record_size().await;
        Ok(client)
    }

    /// Replaces the client of `cluster`. The new client is built before the
    /// old one is taken out and closed.
    pub async fn update(&self, cluster: &Cluster) -> Result<()> {
        let _action = self.action_lock.lock().await;
        let old = if cluster.is_running() {
            let client = self.factory.build(cluster).await?;
            self.clients.write().await.insert(
                cluster.base.id.clone(),
                Entry {
                    client,
                    fingerprint: cluster.into(),
                },
            )
        } else {
            self.clients.write().await.remove(&cluster.base.id)
        };
        if let Some(old) = old {
            old.client.close();
        }
        info!("updated cluster {} in registry", cluster.ident());
        drop(_action);
        self.record_size().await;
        Ok(())
    }

    /// Stops informers and unlinks the kubeconfig. Idempotent.
    pub async fn remove(&self, cluster_id: &str) {
        let _action = self.action_lock.lock().await;
        let removed = self.clients.write().await.remove(cluster_id);
        if let Some(entry) = removed {
            entry.client.close();
            info!("removed cluster {} from registry", cluster_id);
        }
        drop(_action);
        self.record_size().await;
    }

    /// The client of `cluster_id`, added on first use.
    pub async fn get(&self, cluster_id: &str) -> Result<Arc<dyn ClusterApi>> {
        if let Some(entry) = self.clients.read().await.get(cluster_id) {
            return Ok(entry.client.clone());
        }
        let cluster: Cluster = self.store.fetch(cluster_id).await?;
        match self.add(&cluster).await {
            Ok(client) => Ok(client),
            Err(e) if e.is_conflict() => self
                .clients
                .read()
                .await
                .get(cluster_id)
                .map(|e| e.client.clone())
                .ok_or_else(|| Error::NotFound(format!("cluster {} not in registry", cluster_id))),
            Err(Error::Validation(msg)) => Err(Error::NotFound(msg)),
            Err(e) => Err(e),
        }
    }

    pub async fn contains(&self, cluster_id: &str) -> bool {
        self.clients.read().await.contains_key(cluster_id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// A client outside the registry, for clusters that are not Running
    /// yet. The caller closes it.
    pub async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterApi>> {
        self.factory.build(cluster).await
    }

    /// Adds every Running cluster. Never fails.
    pub async fn startup(&self) -> StartupTally {
        let mut tally = StartupTally::default();
        let clusters: Vec<Cluster> = match self
            .store
            .list(&Query::new().eq("status", ClusterStatus::Running))
            .await
        {
            Ok(clusters) => clusters,
            Err(e) => {
                error!("failed to list running clusters: {}", e);
                return tally;
            }
        };
        for cluster in clusters {
            match self.add(&cluster).await {
                Ok(_) => tally.added += 1,
                Err(e) => {
                    warn!("failed to add cluster {}: {}", cluster.ident(), e);
                    tally.failed += 1;
                }
            }
        }
        info!(
            "cluster registry started with {} clusters, {} failed",
            tally.added, tally.failed
        );
        tally
    }

    /// Drops clients of clusters that are gone or changed and adds newly
    /// Running ones.
    pub async fn refresh(&self) -> Result<()> {
        let clusters: Vec<Cluster> = self.store.list(&Query::new()).await?;
        let by_id: HashMap<&str, &Cluster> =
            clusters.iter().map(|c| (c.base.id.as_str(), c)).collect();
        let known: Vec<(String, Fingerprint)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.fingerprint.clone()))
            .collect();
        for (id, fingerprint) in &known {
            match by_id.get(id.as_str()) {
                None => self.remove(id).await,
                Some(cluster) if Fingerprint::from(*cluster) != *fingerprint => {
                    if let Err(e) = self.update(cluster).await {
                        warn!("failed to refresh cluster {}: {}", cluster.ident(), e);
                        self.remove(id).await;
                    }
                }
                Some(_) => (),
            }
        }
        for cluster in clusters.iter().filter(|c| c.is_running()) {
            if known.iter().any(|(id, _)| *id == cluster.base.id) {
                continue;
            }
            match self.add(cluster).await {
                Ok(_) => (),
                Err(e) if e.is_conflict() => (),
                Err(e) => warn!("failed to add cluster {}: {}", cluster.ident(), e),
            }
        }
        Ok(())
    }

    pub async fn run_refresh_loop(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => (),
            }
            if let Err(e) = self.refresh().await {
                warn!("cluster registry refresh failed: {}", e);
            }
        }
        for (_, entry) in self.clients.write().await.drain() {
            entry.client.close();
        }
        info!("cluster registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::fake::FakeClientFactory, store::MemoryStore};
    use kubefleet_apis::{ClusterCreateInput, ClusterMode, ClusterProvider};
    use std::sync::atomic::Ordering;

    async fn running_cluster(store: &MemoryStore, name: &str) -> Cluster {
        let input = ClusterCreateInput {
            name: name.to_string(),
            provider: ClusterProvider::System,
            mode: ClusterMode::Import,
            version: "v1.15.12".to_string(),
            service_cidr: "10.43.0.0/16".to_string(),
            pod_cidr: "10.44.0.0/16".to_string(),
            service_domain: "cluster.local".to_string(),
            kubeconfig: Some("kubeconfig-1".to_string()),
            lb_address: None,
            image_repository: None,
            machines: vec![],
        };
        let mut cluster = Cluster::new(&input);
        cluster.status = ClusterStatus::Running;
        store.create(&cluster).await.unwrap();
        cluster
    }

    fn registry(store: Arc<MemoryStore>, factory: Arc<FakeClientFactory>) -> ClusterRegistry {
        ClusterRegistry::new(store, factory, Metrics::new())
    }

    #[tokio::test]
    async fn add_then_remove_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = registry(store.clone(), factory.clone());
        let cluster = running_cluster(&store, "c1").await;

        let client = registry.add(&cluster).await.unwrap();
        let path = client.kubeconfig_path().to_path_buf();
        assert!(path.exists());
        assert!(registry.add(&cluster).await.err().unwrap().is_conflict());

        registry.remove(&cluster.base.id).await;
        registry.remove(&cluster.base.id).await;
        assert!(client.is_closed());
        assert!(!path.exists());
        assert_eq!(0, registry.len().await);
    }

    #[tokio::test]
    async fn only_running_clusters_are_added() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone(), FakeClientFactory::new());
        let mut cluster = running_cluster(&store, "c1").await;
        cluster.status = ClusterStatus::Creating;
        assert!(matches!(
            registry.add(&cluster).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn get_adds_lazily() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = registry(store.clone(), factory.clone());
        let cluster = running_cluster(&store, "c1").await;
        let a = registry.get(&cluster.base.id).await.unwrap();
        let b = registry.get(&cluster.base.id).await.unwrap();
        assert_eq!(a.cluster_id(), b.cluster_id());
        assert_eq!(1, factory.built.load(Ordering::SeqCst));
        assert!(registry.get("missing").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn startup_tallies_failures() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = registry(store.clone(), factory.clone());
        running_cluster(&store, "c1").await;
        let broken = running_cluster(&store, "c2").await;
        factory.backend(&broken.base.id).set_unreachable(true);
        assert_eq!(
            StartupTally {
                added: 1,
                failed: 1
            },
            registry.startup().await
        );
    }

    #[tokio::test]
    async fn refresh_swaps_changed_clients() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = registry(store.clone(), factory.clone());
        let cluster = running_cluster(&store, "c1").await;
        let old = registry.get(&cluster.base.id).await.unwrap();
        let old_path = old.kubeconfig_path().to_path_buf();

        registry.refresh().await.unwrap();
        assert!(!old.is_closed());

        store
            .modify::<Cluster, _>(&cluster.base.id, |c| {
                c.kubeconfig = Some("kubeconfig-2".to_string());
                Ok(())
            })
            .await
            .unwrap();
        registry.refresh().await.unwrap();
        let new = registry.get(&cluster.base.id).await.unwrap();
        assert!(old.is_closed());
        assert!(!old_path.exists());
        assert!(!new.is_closed());
        assert!(new.server_version().await.is_ok());

        store.remove::<Cluster>(&cluster.base.id).await.unwrap();
        registry.refresh().await.unwrap();
        assert!(new.is_closed());
        assert!(!registry.contains(&cluster.base.id).await);
    }

    #[tokio::test]
    async fn concurrent_gets_never_see_closed_clients() {
        let store = Arc::new(MemoryStore::new());
        let factory = FakeClientFactory::new();
        let registry = Arc::new(registry(store.clone(), factory.clone()));
        let cluster = running_cluster(&store, "c1").await;
        registry.get(&cluster.base.id).await.unwrap();

        let reader = {
            let registry = registry.clone();
            let id = cluster.base.id.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let client = registry.get(&id).await.unwrap();
                    assert!(!client.is_closed());
                    tokio::task::yield_now().await;
                }
            })
        };
        for i in 0..20 {
            let mut next = cluster.clone();
            next.kubeconfig = Some(format!("kubeconfig-{}", i));
            registry.update(&next).await.unwrap();
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
    }
}
