use async_trait::async_trait;

use crate::{
    errors::{Error, Result},
    providers::{
        DeleteServerOptions, HostFilter, HostInfo, HostProvider, LoginCredentials,
        ServerCreateInput, ServerInfo, ServerNetwork,
    },
};

/// Serves a fixed inventory of baremetal hosts. It cannot create VMs.
pub struct StaticHostProvider {
    hosts: Vec<HostInfo>,
    ssh_private_key: Option<String>,
}

impl StaticHostProvider {
    pub fn new(hosts: Vec<HostInfo>, ssh_private_key: Option<String>) -> Self {
        Self {
            hosts,
            ssh_private_key,
        }
    }

    fn host(&self, id: &str) -> Result<&HostInfo> {
        self.hosts
            .iter()
            .find(|h| h.id == id || h.name == id)
            .ok_or_else(|| Error::NotFound(format!("host {} not found", id)))
    }
}

fn no_vms() -> Error {
    Error::Unsupported("static host inventory does not manage virtual machines".to_string())
}

#[async_trait]
impl HostProvider for StaticHostProvider {
    async fn create_server(&self, _input: &ServerCreateInput) -> Result<ServerInfo> {
        Err(no_vms())
    }

    async fn get_server(&self, id: &str) -> Result<ServerInfo> {
        let host = self.host(id)?;
        Ok(ServerInfo {
            id: host.id.clone(),
            name: host.name.clone(),
            status: "running".to_string(),
        })
    }

    async fn delete_server(&self, _id: &str, _opts: &DeleteServerOptions) -> Result<()> {
        Err(no_vms())
    }

    async fn list_server_networks(&self, id: &str) -> Result<Vec<ServerNetwork>> {
        let host = self.host(id)?;
        Ok(vec![ServerNetwork {
            ip_addr: host.access_ip.clone(),
            is_public: false,
        }])
    }

    async fn get_login_credentials(&self, id: &str) -> Result<LoginCredentials> {
        Ok(self.host(id)?.login.clone())
    }

    async fn get_cloud_ssh_private_key(&self) -> Result<String> {
        self.ssh_private_key
            .clone()
            .ok_or_else(|| Error::NotFound("no ssh private key configured".to_string()))
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<HostInfo>> {
        Ok(self
            .hosts
            .iter()
            .filter(|h| filter.ids.is_empty() || filter.ids.contains(&h.id))
            .cloned()
            .collect())
    }
}
