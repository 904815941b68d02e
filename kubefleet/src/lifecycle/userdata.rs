//! kubeadm bootstrap scripts.

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use kubefleet_apis::{Cluster, KeyPairSet};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

use crate::errors::{Error, Result};

/// What the script makes of the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapRole {
    /// The first controlplane runs `kubeadm init`.
    Init,
    JoinControlPlane,
    JoinNode,
}

impl BootstrapRole {
    fn template(&self) -> &'static str {
        match self {
            BootstrapRole::Init => "init.sh.j2",
            BootstrapRole::JoinControlPlane => "join-controlplane.sh.j2",
            BootstrapRole::JoinNode => "join-node.sh.j2",
        }
    }
}

/// Template variables of the bootstrap scripts.
#[derive(Clone, Debug, Serialize)]
pub struct UserDataContext {
    #[serde(rename = "CACert")]
    pub ca_cert: String,
    #[serde(rename = "CAKey")]
    pub ca_key: String,
    #[serde(rename = "EtcdCACert")]
    pub etcd_ca_cert: String,
    #[serde(rename = "EtcdCAKey")]
    pub etcd_ca_key: String,
    #[serde(rename = "FrontProxyCACert")]
    pub front_proxy_ca_cert: String,
    #[serde(rename = "FrontProxyCAKey")]
    pub front_proxy_ca_key: String,
    #[serde(rename = "SaCert")]
    pub sa_cert: String,
    #[serde(rename = "SaKey")]
    pub sa_key: String,
    #[serde(rename = "BootstrapToken")]
    pub bootstrap_token: String,
    #[serde(rename = "CACertHash")]
    pub ca_cert_hash: String,
    /// Control plane endpoint host: the load balancer, else the first
    /// controlplane's private address.
    #[serde(rename = "ELBAddress")]
    pub elb_address: String,
    #[serde(rename = "PrivateIP")]
    pub private_ip: String,
    #[serde(rename = "ClusterName")]
    pub cluster_name: String,
    #[serde(rename = "PodSubnet")]
    pub pod_subnet: String,
    #[serde(rename = "ServiceSubnet")]
    pub service_subnet: String,
    #[serde(rename = "ServiceDomain")]
    pub service_domain: String,
    #[serde(rename = "KubernetesVersion")]
    pub kubernetes_version: String,
}

impl UserDataContext {
    pub fn new(
        cluster: &Cluster,
        keypairs: &KeyPairSet,
        bootstrap_token: &str,
        ca_cert_hash: &str,
        elb_address: &str,
        private_ip: &str,
    ) -> Self {
        Self {
            ca_cert: keypairs.root_ca.cert.clone(),
            ca_key: keypairs.root_ca.key.clone(),
            etcd_ca_cert: keypairs.etcd_ca.cert.clone(),
            etcd_ca_key: keypairs.etcd_ca.key.clone(),
            front_proxy_ca_cert: keypairs.front_proxy_ca.cert.clone(),
            front_proxy_ca_key: keypairs.front_proxy_ca.key.clone(),
            sa_cert: keypairs.service_account.cert.clone(),
            sa_key: keypairs.service_account.key.clone(),
            bootstrap_token: bootstrap_token.to_string(),
            ca_cert_hash: ca_cert_hash.to_string(),
            elb_address: elb_address.to_string(),
            private_ip: private_ip.to_string(),
            cluster_name: cluster.base.name.clone(),
            pod_subnet: cluster.pod_cidr.clone(),
            service_subnet: cluster.service_cidr.clone(),
            service_domain: cluster.service_domain.clone(),
            kubernetes_version: cluster.version.clone(),
        }
    }
}

fn template_error(e: minijinja::Error) -> Error {
    Error::Fatal(format!("render bootstrap script: {:#}", e))
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    let templates = [
        ("pki.sh.j2", include_str!("../../templates/pki.sh.j2")),
        ("init.sh.j2", include_str!("../../templates/init.sh.j2")),
        (
            "join-controlplane.sh.j2",
            include_str!("../../templates/join-controlplane.sh.j2"),
        ),
        (
            "join-node.sh.j2",
            include_str!("../../templates/join-node.sh.j2"),
        ),
    ];
    for (name, source) in templates {
        env.add_template(name, source).map_err(template_error)?;
    }
    Ok(env)
}

pub fn render(role: BootstrapRole, ctx: &UserDataContext) -> Result<String> {
    let env = environment()?;
    env.get_template(role.template())
        .and_then(|t| t.render(ctx))
        .map_err(template_error)
}

/// gzip, then base64.
pub fn encode(script: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(script.as_bytes())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

pub fn decode(user_data: &str) -> Result<String> {
    let compressed = STANDARD
        .decode(user_data.trim())
        .map_err(|e| Error::Validation(format!("user data is not base64: {}", e)))?;
    let mut script = String::new();
    GzDecoder::new(compressed.as_slice()).read_to_string(&mut script)?;
    Ok(script)
}

/// Shell command that unpacks encoded user data and runs it.
pub fn remote_command(user_data: &str) -> String {
    format!("echo '{}' | base64 -d | gunzip | bash -s", user_data)
}
