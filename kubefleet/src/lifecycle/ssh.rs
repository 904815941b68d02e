//! Remote command execution on machines being bootstrapped.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thrussh::client;
use tokio::net::TcpStream;

use crate::errors::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq)]
pub enum SshAuth {
    Password(String),
    /// OpenSSH or PEM encoded private key.
    PrivateKey(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(..)"),
            SshAuth::PrivateKey(_) => f.write_str("PrivateKey(..)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Succeeds once `host:port` accepts TCP connections.
    async fn probe(&self, host: &str, port: u16) -> Result<()>;

    /// Runs `command` and returns its stdout. A non-zero exit status is a
    /// `Driver` error carrying stderr.
    async fn run(&self, target: &SshTarget, command: &str) -> Result<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error(transparent)]
    Ssh(#[from] thrussh::Error),
}

fn ssh_error(address: &str, e: impl std::fmt::Display) -> Error {
    Error::Driver(format!("ssh {}: {}", address, e))
}

/// Accepts every host key: machines are freshly provisioned and have no
/// known host entry yet.
struct Handler;

impl client::Handler for Handler {
    type Error = SshError;
    type FutureUnit = futures::future::Ready<Result<(Self, client::Session), Self::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}

/// [`RemoteExecutor`] over thrussh.
pub struct ThrusshExecutor;

impl ThrusshExecutor {
    async fn connect(&self, target: &SshTarget) -> Result<client::Handle<Handler>> {
        let address = format!("{}:{}", target.host, target.port);
        let config = Arc::new(client::Config {
            connection_timeout: Some(CONNECT_TIMEOUT),
            ..Default::default()
        });
        let mut session = client::connect(config, address.as_str(), Handler)
            .await
            .map_err(|e| ssh_error(&address, e))?;
        let authenticated = match &target.auth {
            SshAuth::Password(password) => session
                .authenticate_password(&target.user, password.clone())
                .await
                .map_err(|e| ssh_error(&address, e))?,
            SshAuth::PrivateKey(pem) => {
                let key = thrussh_keys::decode_secret_key(pem, None).map_err(|e| {
                    Error::Validation(format!("invalid ssh private key for {}: {}", address, e))
                })?;
                session
                    .authenticate_publickey(&target.user, Arc::new(key))
                    .await
                    .map_err(|e| ssh_error(&address, e))?
            }
        };
        if !authenticated {
            return Err(Error::Driver(format!(
                "ssh {}: authentication as {} failed",
                address, target.user
            )));
        }
        Ok(session)
    }
}

#[async_trait]
impl RemoteExecutor for ThrusshExecutor {
    async fn probe(&self, host: &str, port: u16) -> Result<()> {
        let address = format!("{}:{}", host, port);
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Transient(format!("probe {}: {}", address, e))),
            Err(_) => Err(Error::Transient(format!("probe {}: timed out", address))),
        }
    }

    async fn run(&self, target: &SshTarget, command: &str) -> Result<String> {
        let mut session = self.connect(target).await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ssh_error(&target.host, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error(&target.host, e))?;
        let mut stdout = vec![];
        let mut stderr = vec![];
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                thrussh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                thrussh::ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                thrussh::ChannelMsg::ExitStatus { exit_status: x } => {
                    exit_status.replace(x);
                }
                other => debug!("ssh {}: {:?}", target.host, other),
            }
        }
        match exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).to_string()),
            status => Err(Error::Driver(format!(
                "command on {} exited with {:?}: {}",
                target.host,
                status,
                String::from_utf8_lossy(&stderr).trim()
            ))),
        }
    }
}
