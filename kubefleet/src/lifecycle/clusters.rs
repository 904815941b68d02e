//! Cluster drivers and the add-on manifests they contribute.

use std::net::Ipv4Addr;

use kubefleet_apis::{Cluster, ClusterCreateInput, ClusterMode, ClusterProvider, MachineRole};
use serde_json::{Value, json};

use crate::{
    config::Configuration,
    drivers::ClusterDriver,
    errors::{Error, Result},
};

fn validate_cidr(name: &str, cidr: &str) -> Result<()> {
    let invalid = || Error::Validation(format!("invalid {} {:?}", name, cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

fn validate_network(input: &ClusterCreateInput) -> Result<()> {
    validate_cidr("service cidr", &input.service_cidr)?;
    validate_cidr("pod cidr", &input.pod_cidr)?;
    if input.service_cidr == input.pod_cidr {
        return Err(Error::Validation(
            "service and pod cidr must differ".to_string(),
        ));
    }
    if input.service_domain.is_empty() {
        return Err(Error::Validation("service domain is empty".to_string()));
    }
    Ok(())
}

fn validate_import(input: &ClusterCreateInput) -> Result<()> {
    if input.kubeconfig.as_deref().unwrap_or_default().trim().is_empty() {
        return Err(Error::Validation(format!(
            "imported cluster {} needs a kubeconfig",
            input.name
        )));
    }
    if !input.machines.is_empty() {
        return Err(Error::Validation(format!(
            "imported cluster {} cannot have machines",
            input.name
        )));
    }
    Ok(())
}

fn to_yaml_stream(docs: &[Value]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

fn image(config: &Configuration, cluster: &Cluster, name: &str) -> String {
    let repo = cluster
        .image_repository
        .as_deref()
        .unwrap_or(&config.image_repository);
    format!("{}/{}", repo, name)
}

/// Calico in policy-only mode with the cluster's pod cidr.
pub fn cni_manifest(cluster: &Cluster, config: &Configuration) -> Result<String> {
    let labels = json!({"k8s-app": "calico-node"});
    let docs = [
        json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {"name": "calico-node", "namespace": "kube-system"},
        }),
        json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "calico-node", "namespace": "kube-system", "labels": labels},
            "spec": {
                "selector": {"matchLabels": labels},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {
                        "hostNetwork": true,
                        "serviceAccountName": "calico-node",
                        "tolerations": [{"operator": "Exists"}],
                        "containers": [{
                            "name": "calico-node",
                            "image": image(config, cluster, "calico-node:v3.12.1"),
                            "env": [
                                {"name": "CALICO_IPV4POOL_CIDR", "value": cluster.pod_cidr},
                                {"name": "CALICO_IPV4POOL_IPIP", "value": "Always"},
                                {"name": "CLUSTER_TYPE", "value": "k8s,bgp"},
                                {"name": "DATASTORE_TYPE", "value": "kubernetes"},
                            ],
                            "securityContext": {"privileged": true},
                        }],
                    },
                },
            },
        }),
    ];
    to_yaml_stream(&docs)
}

/// The external cloud controller the control plane is started for.
pub fn cloud_controller_manifest(cluster: &Cluster, config: &Configuration) -> Result<String> {
    let labels = json!({"app": "yunion-cloud-controller-manager"});
    let docs = [json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "yunion-cloud-controller-manager",
            "namespace": "kube-system",
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": labels},
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "hostNetwork": true,
                    "nodeSelector": {"node-role.kubernetes.io/master": ""},
                    "tolerations": [
                        {"key": "node-role.kubernetes.io/master", "effect": "NoSchedule"},
                        {"key": "node.cloudprovider.kubernetes.io/uninitialized", "value": "true", "effect": "NoSchedule"},
                    ],
                    "containers": [{
                        "name": "cloud-controller-manager",
                        "image": image(config, cluster, "yunion-cloud-controller-manager:v2.10.0"),
                        "command": [
                            "/yunion-cloud-controller-manager",
                            format!("--cluster-name={}", cluster.base.name),
                            "--cloud-provider=yunion",
                        ],
                    }],
                },
            },
        },
    })];
    to_yaml_stream(&docs)
}

/// Clusters built from machines of the compute provider.
pub struct OneCloudClusterDriver;

impl ClusterDriver for OneCloudClusterDriver {
    fn provider(&self) -> ClusterProvider {
        ClusterProvider::OneCloud
    }

    fn validate_create(&self, input: &ClusterCreateInput) -> Result<()> {
        match input.mode {
            ClusterMode::Import => return validate_import(input),
            ClusterMode::Customize => (),
            ClusterMode::Managed => {
                return Err(Error::Unsupported(format!(
                    "{} clusters cannot be {}",
                    ClusterProvider::OneCloud,
                    input.mode
                )));
            }
        }
        validate_network(input)?;
        if !input.machines.is_empty()
            && !input
                .machines
                .iter()
                .any(|m| m.role == MachineRole::ControlPlane)
        {
            return Err(Error::Validation(format!(
                "cluster {} needs a controlplane machine",
                input.name
            )));
        }
        let mut names: Vec<&str> = input.machines.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Validation(format!("duplicate machine {}", w[0])));
        }
        Ok(())
    }

    fn addon_manifests(&self, cluster: &Cluster, config: &Configuration) -> Result<Vec<String>> {
        match cluster.mode {
            ClusterMode::Customize => Ok(vec![
                cni_manifest(cluster, config)?,
                cloud_controller_manifest(cluster, config)?,
            ]),
            _ => Ok(vec![]),
        }
    }
}

/// The cluster hosting the control plane and other imported clusters.
pub struct SystemClusterDriver;

impl ClusterDriver for SystemClusterDriver {
    fn provider(&self) -> ClusterProvider {
        ClusterProvider::System
    }

    fn validate_create(&self, input: &ClusterCreateInput) -> Result<()> {
        match input.mode {
            ClusterMode::Import => validate_import(input),
            mode => Err(Error::Unsupported(format!(
                "{} clusters can only be imported, not {}",
                ClusterProvider::System,
                mode
            ))),
        }
    }

    fn addon_manifests(&self, _cluster: &Cluster, _config: &Configuration) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubefleet_apis::{MachineCreateInput, MachineResourceType};

    fn input(mode: &str) -> ClusterCreateInput {
        serde_json::from_value(json!({"name": "c1", "provider": "onecloud", "mode": mode}))
            .unwrap()
    }

    fn machine(name: &str, role: MachineRole) -> MachineCreateInput {
        MachineCreateInput {
            name: name.to_string(),
            role,
            resource_type: MachineResourceType::Vm,
            resource_id: None,
            vm_config: None,
        }
    }

    #[test]
    fn customize_needs_a_controlplane() {
        let mut i = input("customize");
        OneCloudClusterDriver.validate_create(&i).unwrap();
        i.machines.push(machine("m2", MachineRole::Node));
        assert!(matches!(
            OneCloudClusterDriver.validate_create(&i),
            Err(Error::Validation(_))
        ));
        i.machines.push(machine("m1", MachineRole::ControlPlane));
        OneCloudClusterDriver.validate_create(&i).unwrap();
        i.machines.push(machine("m1", MachineRole::Node));
        assert!(OneCloudClusterDriver.validate_create(&i).is_err());
    }

    #[test]
    fn network_is_checked() {
        let mut i = input("customize");
        i.pod_cidr = "10.44.0.0/33".to_string();
        assert!(OneCloudClusterDriver.validate_create(&i).is_err());
        i.pod_cidr = i.service_cidr.clone();
        assert!(OneCloudClusterDriver.validate_create(&i).is_err());
    }

    #[test]
    fn import_requires_kubeconfig() {
        let mut i = input("import");
        i.provider = ClusterProvider::System;
        assert!(matches!(
            SystemClusterDriver.validate_create(&i),
            Err(Error::Validation(_))
        ));
        i.kubeconfig = Some("apiVersion: v1".to_string());
        SystemClusterDriver.validate_create(&i).unwrap();
        assert!(matches!(
            SystemClusterDriver.validate_create(&input("customize")),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn customize_addons_carry_pod_cidr_and_mirror() {
        let mut cluster = Cluster::new(&input("customize"));
        cluster.image_repository = Some("mirror.local/k8s".to_string());
        let manifests = OneCloudClusterDriver
            .addon_manifests(&cluster, &Configuration::default())
            .unwrap();
        assert_eq!(2, manifests.len());
        assert!(manifests[0].contains("10.44.0.0/16"));
        assert!(manifests[0].contains("mirror.local/k8s/calico-node"));
        assert!(manifests[1].contains("--cluster-name=c1"));

        let imported = Cluster::new(&input("import"));
        assert!(
            OneCloudClusterDriver
                .addon_manifests(&imported, &Configuration::default())
                .unwrap()
                .is_empty()
        );
    }
}
