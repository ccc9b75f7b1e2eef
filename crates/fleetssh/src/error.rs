//! Error types for the fleetssh library

use thiserror::Error;
use std::time::Duration;

/// Main error type for fleetssh operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// Credentials rejected by the remote host
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Network-level transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol-level SSH session errors
    #[error("Session error: {0}")]
    Session(String),

    /// Remote exit code outside the expected set
    #[error("Command '{command}' returned exit code {exit_code}, expected {expected:?}: {stderr}")]
    CommandFailed {
        /// Command that was run
        command: String,
        /// Actual exit code
        exit_code: i32,
        /// Accepted exit codes
        expected: Vec<i32>,
        /// Captured standard error, possibly prefixed with caller context
        stderr: String,
    },

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Conflicting or invalid caller input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<fleetssh_ssh::TransportError> for FleetError {
    fn from(err: fleetssh_ssh::TransportError) -> Self {
        use fleetssh_ssh::TransportError;

        match err {
            TransportError::Connection(msg) => Self::Transport(msg),
            TransportError::Authentication(msg) => Self::Auth(msg),
            TransportError::Session(msg) => Self::Session(msg),
            TransportError::Io(e) => Self::Io(e),
            TransportError::Timeout { duration } => Self::Timeout { duration },
            TransportError::Configuration(msg) => Self::Configuration(msg),
            TransportError::InvalidKey(msg) => Self::Auth(format!("invalid private key: {}", msg)),
            TransportError::CommandFailed { command, code, expected, message } => Self::CommandFailed {
                command,
                exit_code: code,
                expected,
                stderr: message,
            },
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(format!("YAML error: {}", err))
    }
}

impl From<regex::Error> for FleetError {
    fn from(err: regex::Error) -> Self {
        Self::Configuration(format!("invalid pattern: {}", err))
    }
}
