//! Manager configuration

use crate::{FleetError, Result};
use fleetssh_ssh::{Endpoint, DEFAULT_SSH_PORT};
use std::str::FromStr;
use std::time::Duration;

/// Settings read once at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Address of the administrative node
    pub admin_host: String,
    /// SSH port of the administrative node
    pub admin_port: u16,
    /// Login on the administrative node
    pub admin_login: String,
    /// Password on the administrative node
    pub admin_password: String,
    /// Default privilege for administrative sessions
    pub admin_sudo: bool,
    /// Primary login on worker nodes
    pub worker_login: String,
    /// Password on worker nodes
    pub worker_password: String,
    /// Login tried when the primary worker login is rejected
    pub worker_fallback_login: String,
    /// Default privilege for worker sessions
    pub worker_sudo: bool,
    /// Private key on the admin node used to reach workers
    pub admin_key_path: String,
    /// Bound on the liveness probe
    pub probe_timeout: Duration,
    /// TCP connect and handshake timeout
    pub connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            admin_host: "10.109.0.2".to_string(),
            admin_port: DEFAULT_SSH_PORT,
            admin_login: "root".to_string(),
            admin_password: "r00tme".to_string(),
            admin_sudo: false,
            worker_login: "root".to_string(),
            worker_password: "r00tme".to_string(),
            worker_fallback_login: "root".to_string(),
            worker_sudo: false,
            admin_key_path: "/root/.ssh/id_rsa".to_string(),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Defaults with the given admin node
    pub fn new(admin_host: impl Into<String>) -> Self {
        Self {
            admin_host: admin_host.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with `FLEETSSH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("FLEETSSH_ADMIN_HOST") {
            config.admin_host = v;
        }
        if let Some(v) = lookup("FLEETSSH_ADMIN_PORT") {
            config.admin_port = parse("FLEETSSH_ADMIN_PORT", &v)?;
        }
        if let Some(v) = lookup("FLEETSSH_ADMIN_LOGIN") {
            config.admin_login = v;
        }
        if let Some(v) = lookup("FLEETSSH_ADMIN_PASSWORD") {
            config.admin_password = v;
        }
        if let Some(v) = lookup("FLEETSSH_ADMIN_SUDO") {
            config.admin_sudo = parse_bool("FLEETSSH_ADMIN_SUDO", &v)?;
        }
        if let Some(v) = lookup("FLEETSSH_WORKER_LOGIN") {
            config.worker_login = v;
        }
        if let Some(v) = lookup("FLEETSSH_WORKER_PASSWORD") {
            config.worker_password = v;
        }
        if let Some(v) = lookup("FLEETSSH_WORKER_FALLBACK_LOGIN") {
            config.worker_fallback_login = v;
        }
        if let Some(v) = lookup("FLEETSSH_WORKER_SUDO") {
            config.worker_sudo = parse_bool("FLEETSSH_WORKER_SUDO", &v)?;
        }
        if let Some(v) = lookup("FLEETSSH_ADMIN_KEY_PATH") {
            config.admin_key_path = v;
        }
        if let Some(v) = lookup("FLEETSSH_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = Duration::from_secs(parse("FLEETSSH_PROBE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("FLEETSSH_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout =
                Duration::from_secs(parse("FLEETSSH_CONNECT_TIMEOUT_SECS", &v)?);
        }

        Ok(config)
    }

    /// Set admin node login
    pub fn with_admin_login(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.admin_login = login.into();
        self.admin_password = password.into();
        self
    }

    /// Set admin node port
    pub fn with_admin_port(mut self, port: u16) -> Self {
        self.admin_port = port;
        self
    }

    /// Set primary worker login
    pub fn with_worker_login(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.worker_login = login.into();
        self.worker_password = password.into();
        self
    }

    /// Set fallback worker login
    pub fn with_worker_fallback_login(mut self, login: impl Into<String>) -> Self {
        self.worker_fallback_login = login.into();
        self
    }

    /// Set default privilege per profile
    pub fn with_sudo(mut self, admin: bool, worker: bool) -> Self {
        self.admin_sudo = admin;
        self.worker_sudo = worker;
        self
    }

    /// Set the admin-side private key path
    pub fn with_admin_key_path(mut self, path: impl Into<String>) -> Self {
        self.admin_key_path = path.into();
        self
    }

    /// Set liveness probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint of the administrative node
    pub fn admin_endpoint(&self) -> Endpoint {
        Endpoint::new(self.admin_host.clone(), self.admin_port)
    }

    /// Whether `endpoint` is the administrative node; only the host is compared
    pub fn is_admin(&self, endpoint: &Endpoint) -> bool {
        endpoint.host == self.admin_host
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FleetError::Configuration(format!("{}={:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(FleetError::Configuration(format!(
            "{}={:?} is not a boolean",
            key, other
        ))),
    }
}
