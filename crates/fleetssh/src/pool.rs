//! Connection pool keyed by endpoint

use crate::credentials::{CredentialProfile, CredentialResolver};
use crate::health::{HealthSupervisor, Recovery};
use crate::{FleetError, ManagerConfig, Result};
use fleetssh_ssh::{Connector, Credentials, Endpoint, PrivateKey, RemoteSession, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool entry; at most one per endpoint
#[derive(Debug)]
struct SessionRecord {
    endpoint: Endpoint,
    session: Arc<dyn RemoteSession>,
    profile: CredentialProfile,
    sudo_mode: bool,
}

impl SessionRecord {
    fn handle(&self) -> PooledSession {
        PooledSession {
            session: Arc::clone(&self.session),
            profile: self.profile,
            sudo_mode: self.sudo_mode,
        }
    }
}

/// A session handed out by the pool for the duration of one call
#[derive(Debug, Clone)]
pub struct PooledSession {
    session: Arc<dyn RemoteSession>,
    profile: CredentialProfile,
    sudo_mode: bool,
}

impl PooledSession {
    /// Underlying session
    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// Identity of the underlying session
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    /// Credential profile the session was created with
    pub fn profile(&self) -> CredentialProfile {
        self.profile
    }

    /// Default privilege of the session's profile
    pub fn sudo_mode(&self) -> bool {
        self.sudo_mode
    }

    /// Privilege for one call: the override if given, else the profile default
    pub fn elevate(&self, sudo: Option<bool>) -> bool {
        sudo.unwrap_or(self.sudo_mode)
    }
}

impl Deref for PooledSession {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

/// Outcome of closing every pooled session
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Sessions closed cleanly
    pub closed: usize,
    /// Sessions whose close failed; they are dropped from the pool regardless
    pub failures: Vec<(Endpoint, TransportError)>,
}

impl TeardownReport {
    /// Whether every session closed cleanly
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type Slot = Arc<Mutex<Option<SessionRecord>>>;

type KeysFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<PrivateKey>>> + Send + 'a>>;

/// Owns one live session per endpoint
pub struct ConnectionPool {
    config: Arc<ManagerConfig>,
    connector: Arc<dyn Connector>,
    resolver: CredentialResolver,
    supervisor: HealthSupervisor,
    /// Each slot is locked for the whole of acquire, validate or replace
    slots: RwLock<HashMap<Endpoint, Slot>>,
}

impl ConnectionPool {
    /// Create an empty pool
    pub fn new(config: Arc<ManagerConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            resolver: CredentialResolver::new(Arc::clone(&config)),
            supervisor: HealthSupervisor::new(config.probe_timeout),
            config,
            connector,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    async fn slot(&self, endpoint: &Endpoint) -> Slot {
        if let Some(slot) = self.slots.read().await.get(endpoint) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(endpoint.clone()).or_default())
    }

    /// Existing session for `endpoint`, or a new one. No liveness check.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        let slot = self.slot(endpoint).await;
        let mut record = slot.lock().await;
        self.acquire_locked(endpoint, &slot, &mut record).await
    }

    /// Close any existing session for `endpoint` and build a new one.
    ///
    /// `credentials` replaces normal credential resolution when given.
    pub async fn replace(
        &self,
        endpoint: &Endpoint,
        credentials: Option<Credentials>,
    ) -> Result<PooledSession> {
        let slot = self.slot(endpoint).await;
        let mut record = slot.lock().await;
        self.replace_locked(endpoint, credentials, &slot, &mut record).await
    }

    /// Acquire a session and make sure it is usable, repairing it if needed
    pub async fn validate(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        let slot = self.slot(endpoint).await;
        let mut record = slot.lock().await;
        let pooled = self.acquire_locked(endpoint, &slot, &mut record).await?;

        match self.supervisor.inspect(pooled.session().as_ref()).await? {
            Recovery::Healthy | Recovery::Reconnected => Ok(pooled),
            Recovery::Replace(_) => self.replace_locked(endpoint, None, &slot, &mut record).await,
        }
    }

    /// Close every session and empty the pool; failures are collected, not raised
    pub async fn clear_all(&self) -> TeardownReport {
        let slots: Vec<(Endpoint, Slot)> = self.slots.write().await.drain().collect();
        let mut report = TeardownReport::default();

        for (endpoint, slot) in slots {
            let record = slot.lock().await.take();
            let Some(record) = record else { continue };

            match record.session.close().await {
                Ok(()) => {
                    debug!("Closed connection for {}", endpoint);
                    report.closed += 1;
                }
                Err(e) => {
                    warn!("Error closing connection to {}: {}", endpoint, e);
                    report.failures.push((endpoint, e));
                }
            }
        }

        if !report.is_clean() {
            warn!(
                "{} of {} sessions failed to close cleanly",
                report.failures.len(),
                report.closed + report.failures.len()
            );
        }
        report
    }

    /// Whether a live record exists for `endpoint`
    pub async fn contains(&self, endpoint: &Endpoint) -> bool {
        let slot = self.slots.read().await.get(endpoint).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Whether the pool holds no live records
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn acquire_locked(
        &self,
        endpoint: &Endpoint,
        slot: &Slot,
        record: &mut Option<SessionRecord>,
    ) -> Result<PooledSession> {
        if let Some(existing) = record.as_ref() {
            debug!("Return existing connection for {}", endpoint);
            return Ok(existing.handle());
        }

        let created = self.construct(endpoint, None).await?;
        self.install(endpoint, slot, record, created).await
    }

    async fn replace_locked(
        &self,
        endpoint: &Endpoint,
        credentials: Option<Credentials>,
        slot: &Slot,
        record: &mut Option<SessionRecord>,
    ) -> Result<PooledSession> {
        if let Some(old) = record.take() {
            debug!("Close connection for {}", old.endpoint);
            if let Err(e) = old.session.close().await {
                warn!("Error closing replaced connection to {}: {}", old.endpoint, e);
            }
        }

        let created = self.construct(endpoint, credentials).await?;
        self.install(endpoint, slot, record, created).await
    }

    /// Store a new record in `slot`, provided the slot is still the one the pool holds.
    ///
    /// `clear_all` may drain the slot while the session is being built. The
    /// slot is then registered again so the record can still be reached and
    /// closed. If another slot has taken its place the new session is closed.
    async fn install(
        &self,
        endpoint: &Endpoint,
        slot: &Slot,
        record: &mut Option<SessionRecord>,
        created: SessionRecord,
    ) -> Result<PooledSession> {
        {
            let mut slots = self.slots.write().await;
            match slots.get(endpoint) {
                Some(current) if Arc::ptr_eq(current, slot) => {}
                None => {
                    debug!("Pool was cleared while connecting to {}, keeping the new session", endpoint);
                    slots.insert(endpoint.clone(), Arc::clone(slot));
                }
                Some(_) => {
                    drop(slots);
                    warn!("Pool was rebuilt while connecting to {}, dropping the new session", endpoint);
                    if let Err(e) = created.session.close().await {
                        warn!("Error closing superseded connection to {}: {}", endpoint, e);
                    }
                    return Err(FleetError::Session(format!(
                        "pool entry for {} was replaced while connecting",
                        endpoint
                    )));
                }
            }
        }

        let pooled = created.handle();
        *record = Some(created);
        Ok(pooled)
    }

    async fn construct(
        &self,
        endpoint: &Endpoint,
        credentials: Option<Credentials>,
    ) -> Result<SessionRecord> {
        debug!("Create new connection for {}", endpoint);

        let (session, profile) = self
            .resolver
            .connect(self.connector.as_ref(), endpoint, credentials, || self.admin_keys())
            .await?;

        info!("New {} connection for {} is created", profile, endpoint);
        Ok(SessionRecord {
            endpoint: endpoint.clone(),
            session,
            profile,
            sudo_mode: self.resolver.default_sudo(profile),
        })
    }

    /// Private keys stored on the admin node, read through a validated admin session
    fn admin_keys(&self) -> KeysFuture<'_> {
        Box::pin(async move {
            let admin = self.validate(&self.config.admin_endpoint()).await?;
            let pem = admin.read_file(&self.config.admin_key_path).await?;
            Ok(vec![PrivateKey::from_pem_bytes(&pem)?])
        })
    }
}
