//! Typed secrets rendered from request parameters.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use kubefleet_apis::{ResourceCreateInput, ResourceKind, SecretCreateInput};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    drivers::{DriverRegistry, SecretDriver},
    errors::{Error, Result},
};

fn params<T: DeserializeOwned>(secret_type: &str, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| Error::Validation(format!("invalid {} params: {}", secret_type, e)))
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

#[derive(Deserialize)]
struct RegistryParams {
    server: String,
    username: String,
    password: String,
    #[serde(default)]
    email: Option<String>,
}

/// `kubernetes.io/dockerconfigjson` pull secrets.
pub struct DockerConfigJsonDriver;

impl DockerConfigJsonDriver {
    fn parse(&self, p: &Value) -> Result<RegistryParams> {
        let p: RegistryParams = params(self.secret_type(), p)?;
        required("server", &p.server)?;
        required("username", &p.username)?;
        required("password", &p.password)?;
        Ok(p)
    }
}

impl SecretDriver for DockerConfigJsonDriver {
    fn secret_type(&self) -> &'static str {
        "kubernetes.io/dockerconfigjson"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        self.parse(params).map(|_| ())
    }

    fn render(&self, params: &Value) -> Result<BTreeMap<String, String>> {
        let p = self.parse(params)?;
        let auth = STANDARD.encode(format!("{}:{}", p.username, p.password));
        let mut entry = json!({
            "username": p.username,
            "password": p.password,
            "auth": auth,
        });
        if let Some(email) = p.email {
            entry["email"] = Value::String(email);
        }
        let mut auths = serde_json::Map::new();
        auths.insert(p.server, entry);
        let config = json!({ "auths": auths });
        Ok(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            STANDARD.encode(serde_json::to_vec(&config)?),
        )]))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CephParams {
    user_id: String,
    key: String,
}

/// `yunion.io/ceph-csi` credentials read by the ceph CSI provisioner.
pub struct CephCsiSecretDriver;

impl CephCsiSecretDriver {
    fn parse(&self, p: &Value) -> Result<CephParams> {
        let p: CephParams = params(self.secret_type(), p)?;
        required("userId", &p.user_id)?;
        required("key", &p.key)?;
        Ok(p)
    }
}

impl SecretDriver for CephCsiSecretDriver {
    fn secret_type(&self) -> &'static str {
        "yunion.io/ceph-csi"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        self.parse(params).map(|_| ())
    }

    fn render(&self, params: &Value) -> Result<BTreeMap<String, String>> {
        let p = self.parse(params)?;
        Ok(BTreeMap::from([
            ("userID".to_string(), STANDARD.encode(p.user_id)),
            ("userKey".to_string(), STANDARD.encode(p.key)),
        ]))
    }
}

/// The Secret create request for a typed secret.
pub fn secret_input(drivers: &DriverRegistry, input: &SecretCreateInput) -> Result<ResourceCreateInput> {
    let driver = drivers.secret(&input.secret_type)?;
    driver.validate(&input.params)?;
    let data = driver.render(&input.params)?;
    Ok(ResourceCreateInput {
        cluster_id: input.cluster_id.clone(),
        kind: ResourceKind::Secret,
        name: input.name.clone(),
        namespace: Some(input.namespace.clone()),
        labels: Default::default(),
        body: json!({
            "type": driver.secret_type(),
            "data": data,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn decode(s: &str) -> String {
        String::from_utf8(STANDARD.decode(s).unwrap()).unwrap()
    }

    #[test]
    fn docker_config_carries_basic_auth() {
        let data = DockerConfigJsonDriver
            .render(&json!({
                "server": "registry.example.com",
                "username": "bob",
                "password": "s3cret",
            }))
            .unwrap();
        let config: Value = serde_json::from_str(&decode(&data[".dockerconfigjson"])).unwrap();
        let entry = &config["auths"]["registry.example.com"];
        assert_eq!(json!("bob"), entry["username"]);
        assert_eq!("bob:s3cret", decode(entry["auth"].as_str().unwrap()));
        assert!(entry.get("email").is_none());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = DockerConfigJsonDriver
            .validate(&json!({"server": "r", "username": "bob"}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(
            DockerConfigJsonDriver
                .validate(&json!({"server": " ", "username": "bob", "password": "p"}))
                .is_err()
        );
        assert!(CephCsiSecretDriver.validate(&json!({"userId": "admin"})).is_err());
    }

    #[test]
    fn ceph_secret_keys() {
        let data = CephCsiSecretDriver
            .render(&json!({"userId": "admin", "key": "AQD"}))
            .unwrap();
        assert_eq!("admin", decode(&data["userID"]));
        assert_eq!("AQD", decode(&data["userKey"]));
    }

    #[test]
    fn input_is_a_typed_secret() {
        let mut drivers = DriverRegistry::new();
        drivers.register_secret(Arc::new(CephCsiSecretDriver)).unwrap();
        let input = SecretCreateInput {
            cluster_id: "c1".to_string(),
            namespace: "ceph-csi".to_string(),
            name: "ceph-admin".to_string(),
            secret_type: "yunion.io/ceph-csi".to_string(),
            params: json!({"userId": "admin", "key": "AQD"}),
        };
        let resource = secret_input(&drivers, &input).unwrap();
        assert_eq!(ResourceKind::Secret, resource.kind);
        assert_eq!(json!("yunion.io/ceph-csi"), resource.body["type"]);
        assert!(resource.body["data"]["userKey"].is_string());

        let opaque = SecretCreateInput {
            secret_type: "Opaque".to_string(),
            ..input
        };
        assert!(matches!(
            secret_input(&drivers, &opaque),
            Err(Error::Unsupported(_))
        ));
    }
}
