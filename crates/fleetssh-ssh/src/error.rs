//! SSH-specific error types

use thiserror::Error;
use std::io;
use std::time::Duration;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level connection error (TCP connect, handshake transport)
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Credentials were rejected by the remote host
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Protocol-level session error reported by the SSH library
    #[error("SSH session error: {0}")]
    Session(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Deadline that was exceeded
        duration: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Private key material could not be parsed
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Remote command failed
    #[error("Remote command '{command}' failed with exit code {code} (expected {expected:?}): {message}")]
    CommandFailed {
        /// Command that was run
        command: String,
        /// Exit code of the failed command
        code: i32,
        /// Exit codes that would have been accepted
        expected: Vec<i32>,
        /// Error message
        message: String,
    },
}

impl TransportError {
    /// Whether the remote host rejected the offered credentials
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Whether this is an SSH-level failure that a fresh session may cure
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::Connection(_) | Self::Authentication(_)
        )
    }
}

#[cfg(feature = "ssh2")]
impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        // libssh2 error codes, see libssh2.h
        const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
        const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
        const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;

        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
            | ssh2::ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
                Self::Authentication(err.message().to_string())
            }
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => Self::Timeout {
                duration: Duration::ZERO,
            },
            _ => Self::Session(err.message().to_string()),
        }
    }
}
