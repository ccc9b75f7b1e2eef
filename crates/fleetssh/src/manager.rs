//! Command facade over the connection pool
//!
//! Every operation validates the endpoint's pooled session first, then runs
//! against it. Privilege is resolved per call from the `sudo` override and
//! the session's profile default.

use crate::pool::{ConnectionPool, PooledSession, TeardownReport};
use crate::{FleetError, ManagerConfig, Result};
use fleetssh_ssh::{
    CommandHandle, Connector, Credentials, Endpoint, ExecResult, OpenMode, RemoteFile,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Options for [`SshManager::check_call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckCall {
    /// Log the command and its output at info level
    pub verbose: bool,
    /// Bound on the command's run time
    pub timeout: Option<Duration>,
    /// Context prefixed to the failure message
    pub error_info: Option<String>,
    /// Accepted exit codes
    pub expected: Vec<i32>,
    /// Return an error on an unexpected exit code instead of only logging it
    pub raise_on_err: bool,
    /// Privilege override; `None` uses the session default
    pub sudo: Option<bool>,
}

impl Default for CheckCall {
    fn default() -> Self {
        Self {
            verbose: false,
            timeout: None,
            error_info: None,
            expected: vec![0],
            raise_on_err: true,
            sudo: None,
        }
    }
}

impl CheckCall {
    /// Default options: exit code 0 expected, errors raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Log at info level
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Set a run-time bound
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set failure context
    pub fn with_error_info(mut self, info: impl Into<String>) -> Self {
        self.error_info = Some(info.into());
        self
    }

    /// Set accepted exit codes
    pub fn with_expected(mut self, expected: Vec<i32>) -> Self {
        self.expected = expected;
        self
    }

    /// Set whether an unexpected exit code is an error
    pub fn with_raise_on_err(mut self, raise: bool) -> Self {
        self.raise_on_err = raise;
        self
    }

    /// Set privilege override
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = Some(sudo);
        self
    }
}

/// Entry point for remote operations on the admin node and its workers
#[derive(Clone)]
pub struct SshManager {
    pool: Arc<ConnectionPool>,
}

impl SshManager {
    /// Manager connecting over libssh2
    #[cfg(feature = "ssh2")]
    pub fn new(config: ManagerConfig) -> Self {
        let connector = Arc::new(fleetssh_ssh::Ssh2Connector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Manager connecting through `connector`
    pub fn with_connector(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        debug!("Create SSH manager for admin node {}", config.admin_endpoint());
        Self {
            pool: Arc::new(ConnectionPool::new(Arc::new(config), connector)),
        }
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        self.pool.config()
    }

    /// Underlying pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Validated session for `endpoint`
    pub async fn get_remote(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        self.pool.validate(endpoint).await
    }

    /// Drop the session for `endpoint` and connect again, with `credentials` if given
    pub async fn update_connection(
        &self,
        endpoint: &Endpoint,
        credentials: Option<Credentials>,
    ) -> Result<PooledSession> {
        self.pool.replace(endpoint, credentials).await
    }

    /// Close every pooled session
    pub async fn clear_all(&self) -> TeardownReport {
        self.pool.clear_all().await
    }

    /// Run `command`; a non-zero exit code is not an error
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        command: &str,
        sudo: Option<bool>,
    ) -> Result<ExecResult> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(sudo);
        debug!("Execute on {} (sudo={}): {}", endpoint, sudo, command);
        Ok(remote.execute(command, sudo).await?)
    }

    /// Run `command` and check its exit code against `options.expected`
    pub async fn check_call(
        &self,
        endpoint: &Endpoint,
        command: &str,
        options: &CheckCall,
    ) -> Result<ExecResult> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(options.sudo);

        if options.verbose {
            info!("Executing command on {} (sudo={}): {}", endpoint, sudo, command);
        } else {
            debug!("Executing command on {} (sudo={}): {}", endpoint, sudo, command);
        }

        let run = remote.execute(command, sudo);
        let result = match options.timeout {
            Some(duration) => timeout(duration, run)
                .await
                .map_err(|_| FleetError::Timeout { duration })??,
            None => run.await?,
        };

        if options.verbose {
            info!(
                "Command on {} exited with {}\nSTDOUT:\n{}\nSTDERR:\n{}",
                endpoint,
                result.exit_code,
                result.stdout_str(),
                result.stderr_str()
            );
        } else {
            debug!("Command on {} exited with {}", endpoint, result.exit_code);
        }

        if options.expected.contains(&result.exit_code) {
            return Ok(result);
        }

        let stderr = match &options.error_info {
            Some(info) => format!("{}\n{}", info, result.stderr_str()),
            None => result.stderr_str(),
        };
        error!(
            "Command '{}' on {} returned exit code {} while expected {:?}: {}",
            command, endpoint, result.exit_code, options.expected, stderr
        );

        if options.raise_on_err {
            return Err(FleetError::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
                expected: options.expected.clone(),
                stderr,
            });
        }
        Ok(result)
    }

    /// Start `command` and return a handle streaming its output
    pub async fn execute_async(
        &self,
        endpoint: &Endpoint,
        command: &str,
        sudo: Option<bool>,
    ) -> Result<CommandHandle> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(sudo);
        debug!("Start on {} (sudo={}): {}", endpoint, sudo, command);
        Ok(remote.execute_async(command, sudo).await?)
    }

    /// Remote file handle
    pub async fn open(&self, endpoint: &Endpoint, path: &str, mode: OpenMode) -> Result<RemoteFile> {
        let remote = self.get_remote(endpoint).await?;
        Ok(RemoteFile::new(Arc::clone(remote.session()), path, mode))
    }

    /// Copy a local file to `target`; a directory target keeps the file name
    pub async fn upload(
        &self,
        endpoint: &Endpoint,
        source: &Path,
        target: &str,
        sudo: Option<bool>,
    ) -> Result<()> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(sudo);
        debug!("Upload {} to {}:{} (sudo={})", source.display(), endpoint, target, sudo);
        Ok(remote.upload(source, target, sudo).await?)
    }

    /// Copy a remote file to `destination`
    pub async fn download(&self, endpoint: &Endpoint, source: &str, destination: &Path) -> Result<()> {
        let remote = self.get_remote(endpoint).await?;
        debug!("Download {}:{} to {}", endpoint, source, destination.display());
        Ok(remote.download(source, destination).await?)
    }

    /// Whether `path` exists
    pub async fn exists(&self, endpoint: &Endpoint, path: &str) -> Result<bool> {
        Ok(self.get_remote(endpoint).await?.exists(path).await?)
    }

    /// Whether `path` is a directory
    pub async fn is_dir(&self, endpoint: &Endpoint, path: &str) -> Result<bool> {
        Ok(self.get_remote(endpoint).await?.is_dir(path).await?)
    }

    /// Whether `path` is a regular file
    pub async fn is_file(&self, endpoint: &Endpoint, path: &str) -> Result<bool> {
        Ok(self.get_remote(endpoint).await?.is_file(path).await?)
    }

    /// Create `path` with any missing parents
    pub async fn make_dir(&self, endpoint: &Endpoint, path: &str, sudo: Option<bool>) -> Result<()> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(sudo);
        Ok(remote.make_dir(path, sudo).await?)
    }

    /// Remove `path` and everything below it
    pub async fn remove_recursive(
        &self,
        endpoint: &Endpoint,
        path: &str,
        sudo: Option<bool>,
    ) -> Result<()> {
        let remote = self.get_remote(endpoint).await?;
        let sudo = remote.elevate(sudo);
        Ok(remote.remove_recursive(path, sudo).await?)
    }
}

impl std::fmt::Debug for SshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshManager")
            .field("admin", &self.config().admin_endpoint())
            .finish_non_exhaustive()
    }
}
