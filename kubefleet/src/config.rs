use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::errors::{Error, Result};

pub const DEFAULT_IMAGE_REPOSITORY: &'static str = "registry.cn-beijing.aliyuncs.com/yunionio";

/// Runtime settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub informer_resync: Duration,
    pub registry_refresh: Duration,
    /// How long a VM may take to reach `running`.
    pub machine_prepare_timeout: Duration,
    pub machine_poll: Duration,
    /// Window during which `kubectl apply` is retried on transient errors.
    pub kubectl_timeout: Duration,
    pub kubectl_retry: Duration,
    pub task_workers: usize,
    pub image_repository: String,
    /// Where per-cluster kubeconfig files are materialized.
    pub tmp_dir: PathBuf,
    pub ssh_user: String,
    pub seed_file: Option<PathBuf>,
    pub metrics_addr: SocketAddr,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            informer_resync: Duration::from_secs(30),
            registry_refresh: Duration::from_secs(30),
            machine_prepare_timeout: Duration::from_secs(900),
            machine_poll: Duration::from_secs(30),
            kubectl_timeout: Duration::from_secs(900),
            kubectl_retry: Duration::from_secs(10),
            task_workers: 16,
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            tmp_dir: std::env::temp_dir(),
            ssh_user: "root".to_string(),
            seed_file: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

impl Configuration {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_var)
    }

    /// Builds the configuration from `lookup`, which returns trimmed,
    /// non-empty values only.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(v) => v.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                    Error::Validation(format!("invalid value {:?} for {}: {}", v, name, e))
                }),
                None => Ok(default),
            }
        };
        let task_workers = match lookup("KUBEFLEET_TASK_WORKERS") {
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(Error::Validation(format!(
                        "KUBEFLEET_TASK_WORKERS must be a positive integer, got {:?}",
                        v
                    )));
                }
            },
            None => defaults.task_workers,
        };
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .map_err(|e| Error::Validation(format!("invalid metrics listen address: {}", e)))?;
        Ok(Self {
            informer_resync: secs("KUBEFLEET_INFORMER_RESYNC_SECS", defaults.informer_resync)?,
            registry_refresh: secs("KUBEFLEET_REGISTRY_REFRESH_SECS", defaults.registry_refresh)?,
            machine_prepare_timeout: secs(
                "KUBEFLEET_MACHINE_PREPARE_TIMEOUT_SECS",
                defaults.machine_prepare_timeout,
            )?,
            machine_poll: secs("KUBEFLEET_MACHINE_POLL_SECS", defaults.machine_poll)?,
            kubectl_timeout: secs("KUBEFLEET_KUBECTL_TIMEOUT_SECS", defaults.kubectl_timeout)?,
            kubectl_retry: secs("KUBEFLEET_KUBECTL_RETRY_SECS", defaults.kubectl_retry)?,
            task_workers,
            image_repository: lookup("KUBEFLEET_IMAGE_REPOSITORY")
                .unwrap_or(defaults.image_repository),
            tmp_dir: lookup("KUBEFLEET_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.tmp_dir),
            ssh_user: lookup("KUBEFLEET_SSH_USER").unwrap_or(defaults.ssh_user),
            seed_file: lookup("KUBEFLEET_SEED_FILE").map(PathBuf::from),
            metrics_addr,
        })
    }
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
