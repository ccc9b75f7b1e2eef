//! Credential selection for new sessions

use crate::{ManagerConfig, Result};
use fleetssh_ssh::{Connector, Credentials, Endpoint, PrivateKey, RemoteSession};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rule that produced the credentials of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialProfile {
    /// Fixed login of the admin node
    Administrative,
    /// Configured worker login
    WorkerPrimary,
    /// Alternate worker login used after the primary one is rejected
    WorkerFallback,
    /// Caller-supplied credentials
    Custom,
}

impl fmt::Display for CredentialProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Administrative => "administrative",
            Self::WorkerPrimary => "worker-primary",
            Self::WorkerFallback => "worker-fallback",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Chooses credentials for an endpoint and connects with them
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    config: Arc<ManagerConfig>,
}

impl CredentialResolver {
    /// Create a resolver over the manager configuration
    pub fn new(config: Arc<ManagerConfig>) -> Self {
        Self { config }
    }

    /// Credentials of the admin node; password only, there is nothing to read keys through yet
    pub fn administrative(&self) -> Credentials {
        Credentials::password(&self.config.admin_login, &self.config.admin_password)
    }

    /// Worker credentials for `profile` with the keys read from the admin node
    pub fn worker(&self, profile: CredentialProfile, keys: Vec<PrivateKey>) -> Credentials {
        let login = match profile {
            CredentialProfile::WorkerFallback => &self.config.worker_fallback_login,
            _ => &self.config.worker_login,
        };
        Credentials::password(login, &self.config.worker_password).with_keys(keys)
    }

    /// Default privilege of sessions created under `profile`
    pub fn default_sudo(&self, profile: CredentialProfile) -> bool {
        match profile {
            CredentialProfile::Administrative => self.config.admin_sudo,
            CredentialProfile::WorkerPrimary | CredentialProfile::WorkerFallback => {
                self.config.worker_sudo
            }
            CredentialProfile::Custom => false,
        }
    }

    /// Connect to `endpoint` with resolved credentials.
    ///
    /// The admin node always gets its fixed login, even when `custom` is
    /// given. Other endpoints use `custom` when present, otherwise the
    /// primary worker login, then the fallback login if the first is
    /// rejected. `keys` is only called on the worker path.
    pub async fn connect<K, Fut>(
        &self,
        connector: &dyn Connector,
        endpoint: &Endpoint,
        custom: Option<Credentials>,
        keys: K,
    ) -> Result<(Arc<dyn RemoteSession>, CredentialProfile)>
    where
        K: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<PrivateKey>>>,
    {
        if self.config.is_admin(endpoint) {
            if custom.is_some() {
                debug!("Ignoring custom credentials for admin node {}", endpoint);
            }
            let session = connector.connect(endpoint, &self.administrative()).await?;
            return Ok((session, CredentialProfile::Administrative));
        }

        if let Some(credentials) = custom {
            debug!("Using custom credentials for {}", endpoint);
            let session = connector.connect(endpoint, &credentials).await?;
            return Ok((session, CredentialProfile::Custom));
        }

        let keys = keys().await?;
        let primary = self.worker(CredentialProfile::WorkerPrimary, keys.clone());
        match connector.connect(endpoint, &primary).await {
            Ok(session) => Ok((session, CredentialProfile::WorkerPrimary)),
            Err(e) if e.is_authentication() => {
                warn!(
                    "Login '{}' rejected by {}, retrying as '{}'",
                    primary.username, endpoint, self.config.worker_fallback_login
                );
                let fallback = self.worker(CredentialProfile::WorkerFallback, keys);
                let session = connector.connect(endpoint, &fallback).await?;
                Ok((session, CredentialProfile::WorkerFallback))
            }
            Err(e) => Err(e.into()),
        }
    }
}
