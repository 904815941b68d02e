use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ObjectBase, Record};

closed_enum! {
    pub enum ComponentType {
        CephCsi => "cephCSI",
        Monitor => "monitor",
        FluentBit => "fluentbit",
    }
}

closed_enum! {
    pub enum ComponentStatus {
        Init => "init",
        Deploying => "deploying",
        DeployFail => "deploy_fail",
        Deployed => "deployed",
        Updating => "updating",
        UpdateFail => "update_fail",
        Deleting => "deleting",
        DeleteFail => "delete_fail",
        Undeploying => "undeploying",
        UndeployFail => "undeploy_fail",
    }
}

impl ComponentStatus {
    /// Whether a deploy, update or undeploy is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ComponentStatus::Deploying
                | ComponentStatus::Updating
                | ComponentStatus::Deleting
                | ComponentStatus::Undeploying
        )
    }
}

/// An add-on installed into a cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Component {
    #[serde(flatten)]
    pub base: ObjectBase,
    #[serde(rename = "type")]
    pub type_: ComponentType,
    pub enabled: bool,
    pub settings: ComponentSettings,
    pub status: ComponentStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl Record for Component {
    const KIND: &'static str = "components";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

/// Join row between a cluster and one of its components.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClusterComponent {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub cluster_id: String,
    pub component_id: String,
    #[serde(rename = "type")]
    pub type_: ComponentType,
}

impl Record for ClusterComponent {
    const KIND: &'static str = "cluster_components";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

/// Type specific settings, tagged by component type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type")]
pub enum ComponentSettings {
    #[serde(rename = "cephCSI")]
    CephCsi(CephCsiSettings),
    #[serde(rename = "monitor")]
    Monitor(MonitorSettings),
    #[serde(rename = "fluentbit")]
    FluentBit(FluentBitSettings),
}

impl ComponentSettings {
    pub fn component_type(&self) -> ComponentType {
        match self {
            ComponentSettings::CephCsi(_) => ComponentType::CephCsi,
            ComponentSettings::Monitor(_) => ComponentType::Monitor,
            ComponentSettings::FluentBit(_) => ComponentType::FluentBit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
pub struct CephCsiSettings {
    #[serde(default)]
    pub config: Vec<CephCsiClusterConfig>,
}

#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephCsiClusterConfig {
    pub cluster_id: String,
    pub monitors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub grafana_enabled: bool,
    #[serde(default)]
    pub grafana_admin_password: Option<String>,
    #[serde(default = "default_retention")]
    pub prometheus_retention: String,
    #[serde(default)]
    pub prometheus_storage_class: Option<String>,
    #[serde(default)]
    pub loki_enabled: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            grafana_enabled: true,
            grafana_admin_password: None,
            prometheus_retention: default_retention(),
            prometheus_storage_class: None,
            loki_enabled: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retention() -> String {
    "7d".to_string()
}

#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
pub struct FluentBitSettings {
    #[serde(default)]
    pub backend: FluentBitBackend,
}

/// Log sinks. At least one must be enabled.
#[derive(Clone, Debug, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
pub struct FluentBitBackend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub es: Option<FluentBitBackendEs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka: Option<FluentBitBackendKafka>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FluentBitBackendEs {
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_es_port")]
    pub port: u16,
    #[serde(default = "default_es_index")]
    pub index: String,
    #[serde(default)]
    pub http_user: Option<String>,
    #[serde(default)]
    pub http_password: Option<String>,
}

fn default_es_port() -> u16 {
    9200
}

fn default_es_index() -> String {
    "fluentbit".to_string()
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct FluentBitBackendKafka {
    pub enabled: bool,
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_tagged_by_type() {
        let s = ComponentSettings::FluentBit(FluentBitSettings::default());
        assert_eq!(
            r#"{"type":"fluentbit","backend":{}}"#,
            serde_json::to_string(&s).unwrap()
        );
        let parsed: ComponentSettings =
            serde_json::from_str(r#"{"type":"monitor","lokiEnabled":true}"#).unwrap();
        match parsed {
            ComponentSettings::Monitor(m) => {
                assert!(m.loki_enabled);
                assert!(m.grafana_enabled);
                assert_eq!("7d", m.prometheus_retention);
            }
            other => panic!("unexpected settings {:?}", other),
        }
    }

    #[test]
    fn component_type_wire_names() {
        assert_eq!("cephCSI", ComponentType::CephCsi.as_str());
        assert_eq!(
            ComponentType::Monitor,
            ComponentSettings::Monitor(MonitorSettings::default()).component_type()
        );
    }
}
