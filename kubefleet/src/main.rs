#[macro_use]
extern crate log;

use std::{path::Path, sync::Arc};

use anyhow::Context;
use kubefleet::{
    Control, ControlBuilder,
    config::Configuration,
    hosts::StaticHostProvider,
    prometheus_exporter::{init_metrics, start_prometheus_metrics_server},
    providers::HostInfo,
};
use kubefleet_apis::{ClusterCreateInput, UserCred};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Inventory and clusters loaded at startup.
#[derive(Default, Deserialize)]
struct Seed {
    #[serde(default)]
    ssh_private_key: Option<String>,
    #[serde(default)]
    hosts: Vec<HostInfo>,
    #[serde(default)]
    clusters: Vec<ClusterCreateInput>,
}

fn load_seed(path: Option<&Path>) -> anyhow::Result<Seed> {
    let Some(path) = path else {
        return Ok(Seed::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse seed file {}", path.display()))
}

/// Files seeded clusters that do not exist yet.
async fn apply_seed(control: &Control, clusters: Vec<ClusterCreateInput>) {
    for input in clusters {
        match control.create_cluster(&UserCred::system(), &input).await {
            Ok((cluster, _)) => info!("seeded cluster {}", cluster.ident()),
            Err(e) if e.is_conflict() => debug!("seed cluster {} already filed", input.name),
            Err(e) => warn!("failed to seed cluster {}: {}", input.name, e),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    // kube-rs picks up the process-wide rustls provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let config = Configuration::from_env()?;
    // The meter provider must be installed before any instrument is created.
    let registry = init_metrics()?;
    let seed = load_seed(config.seed_file.as_deref())?;
    info!(
        "loaded {} hosts and {} clusters from seed",
        seed.hosts.len(),
        seed.clusters.len()
    );
    let control = ControlBuilder::new(config.clone())
        .hosts(Arc::new(StaticHostProvider::new(
            seed.hosts,
            seed.ssh_private_key,
        )))
        .build()?;
    control.start().await?;
    apply_seed(&control, seed.clusters).await;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down ...");
            signal.cancel();
        }
    });
    let metrics_server = start_prometheus_metrics_server(config.metrics_addr, registry);
    info!("start control plane ...");
    tokio::select! {
        r = control.run(shutdown) => r?,
        r = metrics_server => r?,
    };
    Ok(())
}
