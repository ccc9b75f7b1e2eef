//! Liveness checks and recovery of pooled sessions

use fleetssh_ssh::{RemoteSession, TransportError};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Command used as the liveness probe
pub const PROBE_COMMAND: &str = "cd ~";

/// What the supervisor did with a session
#[derive(Debug)]
pub enum Recovery {
    /// Probe succeeded
    Healthy,
    /// Probe failed, transport reconnect succeeded
    Reconnected,
    /// Probe and reconnect failed; the session must be rebuilt
    Replace(TransportError),
}

/// Verifies a session is usable before it is handed out
#[derive(Debug, Clone)]
pub struct HealthSupervisor {
    probe_timeout: Duration,
}

impl HealthSupervisor {
    /// Create a supervisor with the given probe timeout
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    /// Probe timeout
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Probe `session`, reconnecting its transport if the probe fails.
    ///
    /// Errors other than session-level ones are returned as-is.
    pub async fn inspect(&self, session: &dyn RemoteSession) -> Result<Recovery, TransportError> {
        let endpoint = session.connection_info().endpoint;

        match self.probe(session).await {
            Ok(()) => return Ok(Recovery::Healthy),
            Err(e) => {
                debug!("Check for current connection to {} failed: {}", endpoint, e);
                debug!("Trying to reconnect to {}", endpoint);
            }
        }

        match session.reconnect().await {
            Ok(()) => {
                warn!("Reconnected stale session to {}", endpoint);
                Ok(Recovery::Reconnected)
            }
            Err(e) if e.is_session_error() => {
                warn!("Reconnect to {} failed, replacing session: {}", endpoint, e);
                Ok(Recovery::Replace(e))
            }
            Err(e) => Err(e),
        }
    }

    async fn probe(&self, session: &dyn RemoteSession) -> Result<(), TransportError> {
        let result = timeout(self.probe_timeout, session.execute(PROBE_COMMAND, false))
            .await
            .map_err(|_| TransportError::Timeout {
                duration: self.probe_timeout,
            })??;

        if result.exit_code != 0 {
            return Err(TransportError::CommandFailed {
                command: PROBE_COMMAND.to_string(),
                code: result.exit_code,
                expected: vec![0],
                message: result.stderr_str(),
            });
        }
        Ok(())
    }
}

impl Default for HealthSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
