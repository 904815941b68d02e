//! Collaborators the control plane consumes but does not implement: the
//! identity broker, the compute provider, the chart repository and the
//! audit log.

use async_trait::async_trait;
use kubefleet_apis::UserCred;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Whether `cred` may perform `action` on `resource`.
    async fn has_permission(&self, cred: &UserCred, resource: &str, action: &str) -> Result<bool>;
}

/// Grants everything. Used when the control plane runs without a broker.
pub struct AllowAllIdentity;

#[async_trait]
impl IdentityProvider for AllowAllIdentity {
    async fn has_permission(&self, _cred: &UserCred, _resource: &str, _action: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerCreateInput {
    pub name: String,
    pub vcpu_count: Option<u32>,
    pub memory_mb: Option<u32>,
    pub image_id: Option<String>,
    pub network_id: Option<String>,
    pub disk_size_gb: Option<u32>,
    pub hypervisor: Option<String>,
    /// Bootstrap script, gzip then base64.
    pub user_data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    /// Provider status, `running` once booted.
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ServerNetwork {
    pub ip_addr: String,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LoginCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteServerOptions {
    pub override_pending_delete: bool,
}

/// A physical host available for baremetal machines.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HostInfo {
    pub id: String,
    pub name: String,
    pub access_ip: String,
    #[serde(default)]
    pub login: LoginCredentials,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostFilter {
    pub ids: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostProvider: Send + Sync {
    async fn create_server(&self, input: &ServerCreateInput) -> Result<ServerInfo>;

    /// `NotFound` once the server is gone.
    async fn get_server(&self, id: &str) -> Result<ServerInfo>;

    async fn delete_server(&self, id: &str, opts: &DeleteServerOptions) -> Result<()>;

    async fn list_server_networks(&self, id: &str) -> Result<Vec<ServerNetwork>>;

    async fn get_login_credentials(&self, id: &str) -> Result<LoginCredentials>;

    /// The provider-wide key installed into every VM it creates.
    async fn get_cloud_ssh_private_key(&self) -> Result<String>;

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<HostInfo>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChartInfo {
    pub repo: String,
    pub name: String,
    pub version: String,
    /// The chart `.tgz`.
    pub archive: Vec<u8>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartStore: Send + Sync {
    /// Latest version when `version` is `None`.
    async fn show(&self, repo: &str, chart: &str, version: Option<String>) -> Result<ChartInfo>;

    async fn list(&self, repo: &str) -> Result<Vec<ChartInfo>>;
}

/// A chart store with no repositories.
pub struct EmptyChartStore;

#[async_trait]
impl ChartStore for EmptyChartStore {
    async fn show(&self, repo: &str, chart: &str, _version: Option<String>) -> Result<ChartInfo> {
        Err(Error::NotFound(format!(
            "chart {} not found in repo {}",
            chart, repo
        )))
    }

    async fn list(&self, _repo: &str) -> Result<Vec<ChartInfo>> {
        Ok(vec![])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub object_kind: String,
    pub object_id: String,
    pub object_name: String,
    pub user: UserCred,
    pub success: bool,
    pub note: String,
}

pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent);
}

/// Writes audit events to the process log.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn log(&self, event: AuditEvent) {
        if event.success {
            info!(
                "audit: {} {} {}({}) by {}: {}",
                event.action,
                event.object_kind,
                event.object_name,
                event.object_id,
                event.user.user_name,
                event.note
            );
        } else {
            warn!(
                "audit: {} {} {}({}) by {} failed: {}",
                event.action,
                event.object_kind,
                event.object_name,
                event.object_id,
                event.user.user_name,
                event.note
            );
        }
    }
}

/// Keeps every event for inspection by tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingAuditSink {
    pub events: std::sync::Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl RecordingAuditSink {
    pub fn actions(&self) -> Vec<(String, String, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.action.clone(), e.object_name.clone(), e.success))
            .collect()
    }
}

#[cfg(test)]
impl AuditSink for RecordingAuditSink {
    fn log(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
