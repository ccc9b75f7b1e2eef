//! # fleetssh
//!
//! Pooled, self-healing SSH sessions to one administrative node and the
//! worker nodes behind it.
//!
//! [`SshManager`] keeps at most one session per endpoint, checks it before
//! every use, and reconnects or rebuilds it when it has gone stale. Worker
//! nodes are reached with a private key read from the admin node.
//!
//! ```no_run
//! use fleetssh::{CheckCall, Endpoint, ManagerConfig, SshManager};
//!
//! # async fn run() -> fleetssh::Result<()> {
//! let manager = SshManager::new(ManagerConfig::from_env()?);
//! let node = Endpoint::host("10.109.0.7");
//!
//! let result = manager.check_call(&node, "uptime", &CheckCall::new().verbose()).await?;
//! println!("{}", result.stdout_str());
//!
//! manager.clear_all().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use fleetssh_ssh as ssh;

/// Error types for the fleetssh library
pub mod error;

/// Manager configuration
pub mod config;

/// Credential selection
pub mod credentials;

/// Session liveness and recovery
pub mod health;

/// Per-endpoint session pool
pub mod pool;

/// Command facade
pub mod manager;

/// Conditional recursive upload
pub mod upload;

/// Deprecated dictionary-style results
pub mod legacy;

/// Tracing setup
pub mod logging;

#[cfg(test)]
mod test_utils;

pub use config::ManagerConfig;
pub use credentials::{CredentialProfile, CredentialResolver};
pub use error::FleetError;
pub use health::{HealthSupervisor, Recovery};
pub use legacy::{LegacyOptions, LegacyResult};
pub use manager::{CheckCall, SshManager};
pub use pool::{ConnectionPool, PooledSession, TeardownReport};

pub use fleetssh_ssh::{
    CommandHandle, Connector, Credentials, Endpoint, ExecResult, OpenMode, OutputLine, PrivateKey,
    RemoteFile, RemoteSession, TransportError,
};

/// Result type alias for fleetssh operations
pub type Result<T> = std::result::Result<T, FleetError>;
