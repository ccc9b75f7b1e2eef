//! # fleetssh SSH transport
//!
//! The remote session capability used by fleetssh, plus a libssh2 implementation.

#![warn(missing_docs)]

/// Session and connector abstractions
pub mod transport;

/// Credentials and private keys
pub mod auth;

/// Command results and async command handles
pub mod exec;

/// Remote file handles
pub mod file;

/// libssh2 sessions
#[cfg(feature = "ssh2")]
pub mod connection;

/// SSH-specific error types
pub mod error;

pub use transport::{
    remote_join, ConnectionInfo, Connector, Endpoint, OpenMode, RemoteSession, TransportType,
    DEFAULT_SSH_PORT,
};
pub use auth::{Credentials, PrivateKey};
pub use exec::{CommandHandle, CommandSink, ExecResult, OutputLine};
pub use file::RemoteFile;
#[cfg(feature = "ssh2")]
pub use connection::{Ssh2Connector, Ssh2Session};
pub use error::TransportError;
