//! Machine drivers: VMs from the compute provider and enrolled baremetal
//! hosts.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kubefleet_apis::{
    Cluster, ClusterProvider, Machine, MachineCreateInput, MachineResourceType,
};
use tokio_util::sync::CancellationToken;

use super::{
    ssh::{RemoteExecutor, SshAuth, SshTarget},
    userdata,
};
use crate::{
    config::Configuration,
    drivers::MachineDriver,
    errors::{Error, Result},
    providers::{DeleteServerOptions, HostFilter, HostInfo, HostProvider, ServerCreateInput},
    utils::poll_until,
};

const SSH_PORT: u16 = 22;

/// Blocks until cloud-init is done and fails if it failed.
const CLOUD_INIT_WAIT: &str = "cloud-init status --wait";

/// Polling and ssh settings shared by the machine drivers.
#[derive(Clone, Debug)]
pub struct MachineTimings {
    pub poll: Duration,
    pub timeout: Duration,
    pub ssh_user: String,
}

impl From<&Configuration> for MachineTimings {
    fn from(config: &Configuration) -> Self {
        Self {
            poll: config.machine_poll,
            timeout: config.machine_prepare_timeout,
            ssh_user: config.ssh_user.clone(),
        }
    }
}

fn resource_id(machine: &Machine) -> Option<&str> {
    machine.resource_id.as_deref().filter(|id| !id.is_empty())
}

fn required_resource_id(machine: &Machine) -> Result<&str> {
    resource_id(machine).ok_or_else(|| {
        Error::Validation(format!("machine {} has no resource id", machine.ident()))
    })
}

async fn wait_ssh(
    executor: &dyn RemoteExecutor,
    timings: &MachineTimings,
    machine: &Machine,
    address: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until(
        &format!("ssh on {} ({})", machine.ident(), address),
        timings.poll,
        timings.timeout,
        cancel,
        || async { executor.probe(address, SSH_PORT).await.map(Some) },
    )
    .await
}

/// Virtual machines created through the [`HostProvider`].
pub struct VmDriver {
    provider: ClusterProvider,
    hosts: Arc<dyn HostProvider>,
    executor: Arc<dyn RemoteExecutor>,
    timings: MachineTimings,
}

impl VmDriver {
    pub fn new(
        provider: ClusterProvider,
        hosts: Arc<dyn HostProvider>,
        executor: Arc<dyn RemoteExecutor>,
        timings: MachineTimings,
    ) -> Self {
        Self {
            provider,
            hosts,
            executor,
            timings,
        }
    }

    /// The private address of a server, falling back to a public one.
    async fn address(&self, server_id: &str) -> Result<String> {
        let networks = self.hosts.list_server_networks(server_id).await?;
        networks
            .iter()
            .find(|n| !n.is_public)
            .or_else(|| networks.first())
            .map(|n| n.ip_addr.clone())
            .ok_or_else(|| Error::Driver(format!("server {} has no network", server_id)))
    }
}

#[async_trait]
impl MachineDriver for VmDriver {
    fn provider(&self) -> ClusterProvider {
        self.provider
    }

    fn resource_type(&self) -> MachineResourceType {
        MachineResourceType::Vm
    }

    async fn validate_create(&self, _cluster: &Cluster, input: &MachineCreateInput) -> Result<()> {
        if input.resource_id.is_some() {
            return Err(Error::Validation(format!(
                "vm machine {} cannot reuse an existing resource",
                input.name
            )));
        }
        Ok(())
    }

    fn boots_with_user_data(&self) -> bool {
        true
    }

    async fn create_resource(&self, cluster: &Cluster, machine: &Machine) -> Result<String> {
        let vm = machine.vm_config.clone().unwrap_or_default();
        let user_data = machine
            .user_data
            .as_deref()
            .map(userdata::encode)
            .transpose()?;
        let input = ServerCreateInput {
            name: format!("{}-{}", cluster.base.name, machine.base.name),
            vcpu_count: vm.vcpu_count,
            memory_mb: vm.memory_mb,
            image_id: vm.image_id,
            network_id: vm.network_id,
            disk_size_gb: vm.disk_size_gb,
            hypervisor: vm.hypervisor,
            user_data,
        };
        let server = self.hosts.create_server(&input).await?;
        info!("created server {} for machine {}", server.id, machine.ident());
        Ok(server.id)
    }

    async fn wait_resource(&self, machine: &Machine, cancel: &CancellationToken) -> Result<String> {
        let id = required_resource_id(machine)?;
        poll_until(
            &format!("server {} to run", id),
            self.timings.poll,
            self.timings.timeout,
            cancel,
            || async {
                let server = self.hosts.get_server(id).await?;
                Ok((server.status == "running").then_some(()))
            },
        )
        .await?;
        let address = self.address(id).await?;
        wait_ssh(
            self.executor.as_ref(),
            &self.timings,
            machine,
            &address,
            cancel,
        )
        .await?;
        Ok(address)
    }

    /// cloud-init runs the script handed over at create time.
    async fn run_bootstrap(&self, machine: &Machine, address: &str, _script: &str) -> Result<()> {
        let key = self.hosts.get_cloud_ssh_private_key().await?;
        let target = SshTarget {
            host: address.to_string(),
            port: SSH_PORT,
            user: self.timings.ssh_user.clone(),
            auth: SshAuth::PrivateKey(key),
        };
        self.executor
            .run(&target, CLOUD_INIT_WAIT)
            .await
            .map_err(|e| e.context(format!("bootstrap {}", machine.ident())))?;
        Ok(())
    }

    async fn terminate_resource(&self, machine: &Machine, cancel: &CancellationToken) -> Result<()> {
        let Some(id) = resource_id(machine) else {
            return Ok(());
        };
        let opts = DeleteServerOptions {
            override_pending_delete: true,
        };
        match self.hosts.delete_server(id, &opts).await {
            Err(e) if e.is_not_found() => return Ok(()),
            other => other?,
        }
        poll_until(
            &format!("server {} to go away", id),
            self.timings.poll,
            self.timings.timeout,
            cancel,
            || async {
                match self.hosts.get_server(id).await {
                    Ok(_) => Ok(None),
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }
}

/// Hosts from the provider's inventory, used as they are.
pub struct BaremetalDriver {
    provider: ClusterProvider,
    hosts: Arc<dyn HostProvider>,
    executor: Arc<dyn RemoteExecutor>,
    timings: MachineTimings,
}

impl BaremetalDriver {
    pub fn new(
        provider: ClusterProvider,
        hosts: Arc<dyn HostProvider>,
        executor: Arc<dyn RemoteExecutor>,
        timings: MachineTimings,
    ) -> Self {
        Self {
            provider,
            hosts,
            executor,
            timings,
        }
    }

    async fn host(&self, id: &str) -> Result<HostInfo> {
        let hosts = self
            .hosts
            .list_hosts(&HostFilter {
                ids: vec![id.to_string()],
            })
            .await?;
        hosts
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("host {} not found", id)))
    }

    async fn target(&self, host: &HostInfo, address: &str) -> Result<SshTarget> {
        let login = self.hosts.get_login_credentials(&host.id).await?;
        let auth = match (login.private_key, login.password) {
            (Some(key), _) => SshAuth::PrivateKey(key),
            (None, Some(password)) => SshAuth::Password(password),
            (None, None) => SshAuth::PrivateKey(self.hosts.get_cloud_ssh_private_key().await?),
        };
        let user = if login.username.is_empty() {
            self.timings.ssh_user.clone()
        } else {
            login.username
        };
        Ok(SshTarget {
            host: address.to_string(),
            port: SSH_PORT,
            user,
            auth,
        })
    }
}

#[async_trait]
impl MachineDriver for BaremetalDriver {
    fn provider(&self) -> ClusterProvider {
        self.provider
    }

    fn resource_type(&self) -> MachineResourceType {
        MachineResourceType::Baremetal
    }

    async fn validate_create(&self, _cluster: &Cluster, input: &MachineCreateInput) -> Result<()> {
        let Some(id) = input.resource_id.as_deref().filter(|id| !id.is_empty()) else {
            return Err(Error::Validation(format!(
                "baremetal machine {} needs a host",
                input.name
            )));
        };
        match self.host(id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::Validation(e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn create_resource(&self, _cluster: &Cluster, machine: &Machine) -> Result<String> {
        let host = self.host(required_resource_id(machine)?).await?;
        Ok(host.id)
    }

    async fn wait_resource(&self, machine: &Machine, cancel: &CancellationToken) -> Result<String> {
        let host = self.host(required_resource_id(machine)?).await?;
        wait_ssh(
            self.executor.as_ref(),
            &self.timings,
            machine,
            &host.access_ip,
            cancel,
        )
        .await?;
        Ok(host.access_ip)
    }

    async fn run_bootstrap(&self, machine: &Machine, address: &str, script: &str) -> Result<()> {
        let host = self.host(required_resource_id(machine)?).await?;
        let target = self.target(&host, address).await?;
        let command = userdata::remote_command(&userdata::encode(script)?);
        self.executor
            .run(&target, &command)
            .await
            .map_err(|e| e.context(format!("bootstrap {}", machine.ident())))?;
        Ok(())
    }

    /// The host stays in the inventory. kubeadm state is reset when the
    /// host is reachable.
    async fn terminate_resource(&self, machine: &Machine, _cancel: &CancellationToken) -> Result<()> {
        let (Some(id), Some(address)) = (resource_id(machine), machine.address.as_deref()) else {
            return Ok(());
        };
        let host = match self.host(id).await {
            Ok(host) => host,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let target = self.target(&host, address).await?;
        if let Err(e) = self.executor.run(&target, "kubeadm reset -f").await {
            warn!("failed to reset host {} of {}: {}", host.name, machine.ident(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::ssh::MockRemoteExecutor,
        providers::{LoginCredentials, MockHostProvider, ServerInfo, ServerNetwork},
    };
    use kubefleet_apis::{MachineRole, VmConfig};
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn timings() -> MachineTimings {
        MachineTimings {
            poll: Duration::from_secs(30),
            timeout: Duration::from_secs(900),
            ssh_user: "root".to_string(),
        }
    }

    fn machine(resource_type: MachineResourceType, resource_id: Option<&str>) -> Machine {
        let mut m = Machine::new(
            "c1",
            ClusterProvider::OneCloud,
            &MachineCreateInput {
                name: "m1".to_string(),
                role: MachineRole::ControlPlane,
                resource_type,
                resource_id: None,
                vm_config: Some(VmConfig {
                    vcpu_count: Some(4),
                    ..Default::default()
                }),
            },
        );
        m.resource_id = resource_id.map(|s| s.to_string());
        m
    }

    fn server(status: &str) -> ServerInfo {
        ServerInfo {
            id: "s1".to_string(),
            name: "c1-m1".to_string(),
            status: status.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn vm_waits_for_running_and_ssh() {
        let mut hosts = MockHostProvider::new();
        let polls = AtomicUsize::new(0);
        hosts.expect_get_server().returning(move |_| {
            match polls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(server("starting")),
                _ => Ok(server("running")),
            }
        });
        hosts.expect_list_server_networks().returning(|_| {
            Ok(vec![
                ServerNetwork {
                    ip_addr: "1.2.3.4".to_string(),
                    is_public: true,
                },
                ServerNetwork {
                    ip_addr: "10.0.0.5".to_string(),
                    is_public: false,
                },
            ])
        });
        let mut executor = MockRemoteExecutor::new();
        let probes = AtomicUsize::new(0);
        executor
            .expect_probe()
            .withf(|host, port| host == "10.0.0.5" && *port == 22)
            .returning(move |_, _| match probes.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::Transient("connection refused".to_string())),
                _ => Ok(()),
            });
        let driver = VmDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(executor),
            timings(),
        );
        let address = driver
            .wait_resource(
                &machine(MachineResourceType::Vm, Some("s1")),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!("10.0.0.5", address);
    }

    #[tokio::test]
    async fn vm_create_carries_encoded_user_data() {
        let mut hosts = MockHostProvider::new();
        hosts
            .expect_create_server()
            .withf(|input| {
                input.name == "c1-m1"
                    && input.vcpu_count == Some(4)
                    && input
                        .user_data
                        .as_deref()
                        .and_then(|d| userdata::decode(d).ok())
                        .is_some_and(|script| script == "kubeadm init")
            })
            .times(1)
            .returning(|_| Ok(server("starting")));
        let driver = VmDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(MockRemoteExecutor::new()),
            timings(),
        );
        let cluster = Cluster::new(
            &serde_json::from_str(r#"{"name":"c1","provider":"onecloud","mode":"customize"}"#)
                .unwrap(),
        );
        let mut m1 = machine(MachineResourceType::Vm, None);
        m1.user_data = Some("kubeadm init".to_string());
        assert!(driver.boots_with_user_data());
        assert_eq!("s1", driver.create_resource(&cluster, &m1).await.unwrap());
    }

    #[tokio::test]
    async fn vm_bootstrap_waits_for_cloud_init_with_cloud_key() {
        let mut hosts = MockHostProvider::new();
        hosts
            .expect_get_cloud_ssh_private_key()
            .times(1)
            .returning(|| Ok("KEY".to_string()));
        let mut executor = MockRemoteExecutor::new();
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        executor.expect_run().returning(move |target, command| {
            s.lock().unwrap().push((target.clone(), command.to_string()));
            Ok(String::new())
        });
        let driver = VmDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(executor),
            timings(),
        );
        driver
            .run_bootstrap(
                &machine(MachineResourceType::Vm, Some("s1")),
                "10.0.0.5",
                "kubeadm init",
            )
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        let (target, command) = &seen[0];
        assert_eq!("10.0.0.5", target.host);
        assert_eq!(SshAuth::PrivateKey("KEY".to_string()), target.auth);
        assert_eq!(CLOUD_INIT_WAIT, command);
    }

    #[tokio::test(start_paused = true)]
    async fn vm_terminate_overrides_pending_delete() {
        let mut hosts = MockHostProvider::new();
        hosts
            .expect_delete_server()
            .withf(|id, opts| id == "s1" && opts.override_pending_delete)
            .times(1)
            .returning(|_, _| Ok(()));
        let polls = AtomicUsize::new(0);
        hosts.expect_get_server().returning(move |id| {
            match polls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(server("deleting")),
                _ => Err(Error::NotFound(format!("server {} not found", id))),
            }
        });
        let driver = VmDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(MockRemoteExecutor::new()),
            timings(),
        );
        let cancel = CancellationToken::new();
        driver
            .terminate_resource(&machine(MachineResourceType::Vm, Some("s1")), &cancel)
            .await
            .unwrap();
        // Without a resource the provider is not called.
        driver
            .terminate_resource(&machine(MachineResourceType::Vm, Some("")), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn baremetal_requires_known_host() {
        let mut hosts = MockHostProvider::new();
        hosts.expect_list_hosts().returning(|filter| {
            Ok(filter
                .ids
                .iter()
                .filter(|id| *id == "h1")
                .map(|id| HostInfo {
                    id: id.clone(),
                    name: "rack1-a".to_string(),
                    access_ip: "10.0.0.11".to_string(),
                    login: LoginCredentials::default(),
                })
                .collect())
        });
        let driver = BaremetalDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(MockRemoteExecutor::new()),
            timings(),
        );
        let cluster = Cluster::new(
            &serde_json::from_str(r#"{"name":"c1","provider":"onecloud","mode":"customize"}"#)
                .unwrap(),
        );
        let mut input = MachineCreateInput {
            name: "m1".to_string(),
            role: MachineRole::Node,
            resource_type: MachineResourceType::Baremetal,
            resource_id: None,
            vm_config: None,
        };
        assert!(matches!(
            driver.validate_create(&cluster, &input).await,
            Err(Error::Validation(_))
        ));
        input.resource_id = Some("h9".to_string());
        assert!(matches!(
            driver.validate_create(&cluster, &input).await,
            Err(Error::Validation(_))
        ));
        input.resource_id = Some("h1".to_string());
        driver.validate_create(&cluster, &input).await.unwrap();
    }

    #[tokio::test]
    async fn baremetal_uses_host_login() {
        let mut hosts = MockHostProvider::new();
        hosts.expect_list_hosts().returning(|_| {
            Ok(vec![HostInfo {
                id: "h1".to_string(),
                name: "rack1-a".to_string(),
                access_ip: "10.0.0.11".to_string(),
                login: LoginCredentials::default(),
            }])
        });
        hosts.expect_get_login_credentials().returning(|_| {
            Ok(LoginCredentials {
                username: "admin".to_string(),
                password: Some("pw".to_string()),
                private_key: None,
            })
        });
        let mut executor = MockRemoteExecutor::new();
        executor
            .expect_run()
            .withf(|target, _| {
                target.user == "admin" && target.auth == SshAuth::Password("pw".to_string())
            })
            .times(1)
            .returning(|_, _| Ok(String::new()));
        let driver = BaremetalDriver::new(
            ClusterProvider::OneCloud,
            Arc::new(hosts),
            Arc::new(executor),
            timings(),
        );
        driver
            .run_bootstrap(
                &machine(MachineResourceType::Baremetal, Some("h1")),
                "10.0.0.11",
                "kubeadm join",
            )
            .await
            .unwrap();
    }
}
