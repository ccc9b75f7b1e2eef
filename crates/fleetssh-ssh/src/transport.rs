//! Remote session abstraction and the connector that creates sessions

use async_trait::async_trait;
use crate::{CommandHandle, Credentials, ExecResult, TransportError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity of a remote target, used as the pool key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// Remote hostname or IP, compared verbatim
    pub host: String,
    /// Remote port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on the default SSH port
    pub fn host(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_SSH_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote endpoint
    pub endpoint: Endpoint,
    /// Username the session authenticated as
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with libssh2
    SshLibssh2,
    /// In-process session (for testing)
    Local,
}

/// How a remote file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read the whole file
    Read,
    /// Truncate on first write
    Write,
    /// Append every write
    Append,
}

/// One authenticated connection to one endpoint.
///
/// Every method that can run with elevated privileges takes the privilege
/// as a `sudo` argument. Sessions carry no privilege state of their own.
#[async_trait]
pub trait RemoteSession: Send + Sync + fmt::Debug {
    /// Unique identity of this session object
    fn id(&self) -> Uuid;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;

    /// Re-establish the transport with the credentials already bound to the session
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Close the session
    async fn close(&self) -> Result<(), TransportError>;

    /// Run a command and capture its output; non-zero exit is not an error
    async fn execute(&self, command: &str, sudo: bool) -> Result<ExecResult, TransportError>;

    /// Start a command without waiting for it
    async fn execute_async(&self, command: &str, sudo: bool) -> Result<CommandHandle, TransportError>;

    /// Read a whole remote file
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Write to a remote file, truncating unless `append` is set
    async fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), TransportError>;

    /// Copy a local file or directory tree to the remote host
    async fn upload(&self, source: &Path, target: &str, sudo: bool) -> Result<(), TransportError>;

    /// Copy a remote file to the local filesystem
    async fn download(&self, source: &str, destination: &Path) -> Result<(), TransportError>;

    /// Whether a remote path exists
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;

    /// Whether a remote path is a directory
    async fn is_dir(&self, path: &str) -> Result<bool, TransportError>;

    /// Whether a remote path is a regular file
    async fn is_file(&self, path: &str) -> Result<bool, TransportError>;

    /// Create a directory and its parents
    async fn make_dir(&self, path: &str, sudo: bool) -> Result<(), TransportError>;

    /// Remove a path recursively
    async fn remove_recursive(&self, path: &str, sudo: bool) -> Result<(), TransportError>;
}

/// Creates authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate to `endpoint`
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

/// Join a remote path the POSIX way
pub fn remote_join(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    if base.is_empty() {
        return name.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}
