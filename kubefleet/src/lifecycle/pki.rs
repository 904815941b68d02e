//! Cluster certificate authorities and the admin credential.

use base64::{Engine, engine::general_purpose::STANDARD};
use kubefleet_apis::{ClusterKeyPair, KeyPairPurpose, KeyPairSet, ObjectBase};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;

use crate::errors::{Error, Result};

fn pki_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Fatal(format!("{}: {}", what, e))
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn keypair_row(cluster_id: &str, purpose: KeyPairPurpose, cert: String, key: String) -> ClusterKeyPair {
    ClusterKeyPair {
        base: ObjectBase::new(format!("{}-{}", cluster_id, purpose)),
        cluster_id: cluster_id.to_string(),
        purpose,
        cert,
        key,
    }
}

fn new_ca(cluster_id: &str, purpose: KeyPairPurpose, common_name: &str) -> Result<(ClusterKeyPair, CertificateParams, KeyPair)> {
    let key = KeyPair::generate().map_err(|e| pki_error("generate CA key", e))?;
    let params = ca_params(common_name);
    let cert = params
        .self_signed(&key)
        .map_err(|e| pki_error("self-sign CA", e))?;
    let row = keypair_row(cluster_id, purpose, cert.pem(), key.serialize_pem());
    Ok((row, params, key))
}

/// Generates the five keypairs of a new cluster. The admin entry is a
/// `system:masters` client certificate signed by the root CA.
pub fn generate_keypairs(cluster_id: &str) -> Result<KeyPairSet> {
    let (root_ca, root_params, root_key) = new_ca(cluster_id, KeyPairPurpose::RootCa, "kubernetes")?;
    let (etcd_ca, _, _) = new_ca(cluster_id, KeyPairPurpose::EtcdCa, "etcd-ca")?;
    let (front_proxy_ca, _, _) = new_ca(cluster_id, KeyPairPurpose::FrontProxyCa, "front-proxy-ca")?;

    let sa_key = KeyPair::generate().map_err(|e| pki_error("generate service account key", e))?;
    let service_account = keypair_row(
        cluster_id,
        KeyPairPurpose::ServiceAccount,
        sa_key.public_key_pem(),
        sa_key.serialize_pem(),
    );

    let mut admin_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("system:masters".to_string()),
    );
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("kubernetes-admin".to_string()),
    );
    admin_params.distinguished_name = dn;
    admin_params.is_ca = IsCa::NoCa;
    admin_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    admin_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    let admin_key = KeyPair::generate().map_err(|e| pki_error("generate admin key", e))?;
    let issuer = Issuer::new(root_params, root_key);
    let admin_cert = admin_params
        .signed_by(&admin_key, &issuer)
        .map_err(|e| pki_error("sign admin certificate", e))?;
    let admin = keypair_row(
        cluster_id,
        KeyPairPurpose::Admin,
        admin_cert.pem(),
        admin_key.serialize_pem(),
    );

    Ok(KeyPairSet {
        root_ca,
        etcd_ca,
        front_proxy_ca,
        service_account,
        admin,
    })
}

/// `sha256:` and the hex digest of the CA's SubjectPublicKeyInfo, as
/// `kubeadm join --discovery-token-ca-cert-hash` expects.
pub fn ca_cert_hash(ca_pem: &str) -> Result<String> {
    let (_, pem) =
        parse_x509_pem(ca_pem.as_bytes()).map_err(|e| pki_error("parse CA certificate", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| pki_error("parse CA certificate", e))?;
    let digest = Sha256::digest(cert.public_key().raw);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("sha256:{}", hex))
}

/// Admin kubeconfig for `server` (`https://host:6443`).
pub fn admin_kubeconfig(cluster_name: &str, server: &str, keypairs: &KeyPairSet) -> Result<String> {
    let user = format!("{}-admin", cluster_name);
    let context = format!("{}@{}", user, cluster_name);
    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(&keypairs.root_ca.cert),
            },
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": STANDARD.encode(&keypairs.admin.cert),
                "client-key-data": STANDARD.encode(&keypairs.admin.key),
            },
        }],
        "contexts": [{
            "name": context,
            "context": {"cluster": cluster_name, "user": user},
        }],
        "current-context": context,
    });
    Ok(serde_yaml::to_string(&config)?)
}
