//! Per-agent session pool with periodic liveness checks.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentEndpoint, InstanceConfig};
use crate::error::TransportError;
use crate::snmp::{Connector, Session, SYS_UPTIME_OID};

/// A healthy session older than this without a success is re-validated.
const STALENESS: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub reconnect_delay: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            interval: config.healthcheck_interval,
            timeout: config.healthcheck_timeout,
            retries: config.healthcheck_retries.max(1),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

struct Handle {
    session: Option<Arc<dyn Session>>,
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: u32,
    error_count: u64,
    success_count: u64,
    reconnect_pending: bool,
}

impl Handle {
    fn new(session: Option<Arc<dyn Session>>) -> Self {
        let now = Utc::now();
        Self {
            healthy: session.is_some(),
            session,
            last_check: Some(now),
            last_success: None,
            last_error: None,
            retry_count: 0,
            error_count: 0,
            success_count: 0,
            reconnect_pending: false,
        }
    }

    fn is_fresh(&self) -> bool {
        if !self.healthy || self.session.is_none() {
            return false;
        }
        match self.last_success {
            Some(t) => (Utc::now() - t).to_std().map(|age| age <= STALENESS).unwrap_or(true),
            None => false,
        }
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        self.last_success = Some(Utc::now());
        self.healthy = true;
        self.retry_count = 0;
    }

    fn record_error(&mut self, err: &TransportError) {
        self.error_count += 1;
        self.retry_count += 1;
        self.last_error = Some(err.to_string());
    }

    fn mark_check_ok(&mut self) {
        let now = Utc::now();
        self.healthy = true;
        self.last_error = None;
        self.retry_count = 0;
        self.last_check = Some(now);
        self.last_success = Some(now);
    }
}

/// Per-agent entry of a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub error_count: u64,
    pub success_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub check_time: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentHealth>,
}

/// Owns one session per agent address.
///
/// Session creation and reconnects are serialized per agent; GETs, walks and
/// liveness checks on an existing session are not.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    endpoints: Vec<AgentEndpoint>,
    by_address: HashMap<String, usize>,
    clients: RwLock<HashMap<String, Arc<Mutex<Handle>>>>,
    agent_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    call_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    settings: HealthSettings,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoints: Vec<AgentEndpoint>,
        settings: HealthSettings,
    ) -> Arc<Self> {
        let by_address = endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| (e.address(), i))
            .collect();
        Arc::new(Self {
            connector,
            endpoints,
            by_address,
            clients: RwLock::new(HashMap::new()),
            agent_locks: Mutex::new(HashMap::new()),
            call_locks: Mutex::new(HashMap::new()),
            settings,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Configured agent addresses, in configuration order.
    pub fn agents(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.address()).collect()
    }

    pub fn endpoint(&self, agent: &str) -> Option<&AgentEndpoint> {
        self.by_address.get(agent).map(|&i| &self.endpoints[i])
    }

    pub fn host_of<'a>(&self, agent: &'a str) -> &'a str {
        crate::config::host_of(agent)
    }

    fn handle(&self, agent: &str) -> Option<Arc<Mutex<Handle>>> {
        self.clients.read().get(agent).cloned()
    }

    fn agent_lock(&self, agent: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.agent_locks
            .lock()
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Serialize protocol work against one agent. The collector and the
    /// discovery engine hold the guard for one unit of work.
    pub async fn acquire(&self, agent: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .call_locks
            .lock()
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// A session for `agent`: the pooled one when it is healthy and recently
    /// used, otherwise a reconnected or freshly created one. Callers must not
    /// retry on error; their own cadence is the retry.
    pub async fn get_session(self: &Arc<Self>, agent: &str) -> Result<Arc<dyn Session>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        if let Some(handle) = self.handle(agent) {
            {
                let mut h = handle.lock();
                if h.is_fresh() {
                    h.record_success();
                    if let Some(session) = h.session.clone() {
                        return Ok(session);
                    }
                }
            }

            tracing::info!(agent, "Session is unhealthy, attempting to reconnect");
            return self.reconnect(agent).await;
        }

        self.create(agent).await
    }

    async fn create(&self, agent: &str) -> Result<Arc<dyn Session>, TransportError> {
        let lock = self.agent_lock(agent);
        let _guard = lock.lock().await;

        if let Some(handle) = self.handle(agent) {
            let h = handle.lock();
            if let Some(session) = h.session.clone() {
                return Ok(session);
            }
        }

        let endpoint = self
            .endpoint(agent)
            .ok_or_else(|| TransportError::UnknownAgent(agent.to_string()))?;

        let session = match self.connector.connect(endpoint).await {
            Ok(s) => s,
            Err(e) => {
                let mut handle = Handle::new(None);
                handle.record_error(&e);
                self.clients
                    .write()
                    .insert(agent.to_string(), Arc::new(Mutex::new(handle)));
                return Err(e);
            }
        };

        let mut handle = Handle::new(Some(session.clone()));
        match self.check_liveness(&session).await {
            Ok(()) => handle.mark_check_ok(),
            Err(e) => {
                tracing::warn!(agent, error = %e, "Initial health check failed");
                handle.healthy = false;
                handle.last_error = Some(e.to_string());
            }
        }

        self.clients
            .write()
            .insert(agent.to_string(), Arc::new(Mutex::new(handle)));
        tracing::debug!(agent, "Created SNMP session");
        Ok(session)
    }

    async fn reconnect(&self, agent: &str) -> Result<Arc<dyn Session>, TransportError> {
        let lock = self.agent_lock(agent);
        let _guard = lock.lock().await;

        let handle = self
            .handle(agent)
            .ok_or_else(|| TransportError::UnknownAgent(agent.to_string()))?;

        // Another caller may have reconnected while we waited.
        let old = {
            let mut h = handle.lock();
            h.reconnect_pending = false;
            if h.is_fresh() {
                if let Some(session) = h.session.clone() {
                    return Ok(session);
                }
            }
            h.session.take()
        };
        if let Some(old) = old {
            old.close().await;
        }

        let endpoint = self
            .endpoint(agent)
            .ok_or_else(|| TransportError::UnknownAgent(agent.to_string()))?;

        let session = match self.connector.connect(endpoint).await {
            Ok(s) => s,
            Err(e) => {
                handle.lock().record_error(&e);
                return Err(e);
            }
        };
        handle.lock().session = Some(session.clone());

        if let Err(e) = self.check_liveness(&session).await {
            let mut h = handle.lock();
            h.healthy = false;
            h.record_error(&e);
            return Err(e);
        }

        handle.lock().mark_check_ok();
        tracing::info!(agent, "Reconnected SNMP session");
        Ok(session)
    }

    async fn check_liveness(&self, session: &Arc<dyn Session>) -> Result<(), TransportError> {
        let oids = [SYS_UPTIME_OID.to_string()];
        match tokio::time::timeout(self.settings.timeout, session.get(&oids)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(self.settings.timeout)),
        }
    }

    /// Report a failed call made with a session from this manager.
    pub fn record_error(&self, agent: &str, err: &TransportError) {
        if let Some(handle) = self.handle(agent) {
            handle.lock().record_error(err);
        }
    }

    pub fn record_success(&self, agent: &str) {
        if let Some(handle) = self.handle(agent) {
            handle.lock().record_success();
        }
    }

    /// Open a session to every configured agent.
    pub async fn connect_all(self: &Arc<Self>) {
        let tasks = self.agents().into_iter().map(|agent| {
            let manager = self.clone();
            async move {
                if let Err(e) = manager.get_session(&agent).await {
                    tracing::warn!(agent = %agent, error = %e, "Initial connection failed");
                }
            }
        });
        futures_util::future::join_all(tasks).await;
    }

    /// Start the periodic liveness loop. Stops on [`close`](Self::close).
    pub fn start_health_check(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.settings.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => {
                        tracing::debug!("Stopping health check loop");
                        return;
                    }
                    _ = ticker.tick() => manager.check_all().await,
                }
            }
        });
    }

    /// Check every session concurrently; wait at most twice the check timeout.
    pub async fn check_all(self: &Arc<Self>) {
        let agents: Vec<String> = self.clients.read().keys().cloned().collect();
        let handles: Vec<_> = agents
            .into_iter()
            .map(|agent| {
                let manager = self.clone();
                tokio::spawn(async move { manager.check_one(&agent).await })
            })
            .collect();

        let wait = futures_util::future::join_all(handles);
        if tokio::time::timeout(self.settings.timeout * 2, wait).await.is_err() {
            tracing::warn!("Health check round timed out, some checks may not have completed");
        }
    }

    async fn check_one(self: &Arc<Self>, agent: &str) {
        let Some(handle) = self.handle(agent) else { return };
        let session = handle.lock().session.clone();

        let result = match session {
            Some(session) => self.check_liveness(&session).await,
            None => Err(TransportError::Closed),
        };

        let schedule_reconnect = {
            let mut h = handle.lock();
            match result {
                Ok(()) => {
                    h.mark_check_ok();
                    false
                }
                Err(e) => {
                    h.last_error = Some(e.to_string());
                    h.last_check = Some(Utc::now());
                    h.retry_count += 1;
                    if h.retry_count >= self.settings.retries {
                        if h.healthy {
                            tracing::warn!(agent, retries = h.retry_count, error = %e, "Session marked unhealthy");
                        }
                        h.healthy = false;
                        !std::mem::replace(&mut h.reconnect_pending, true)
                    } else {
                        false
                    }
                }
            }
        };

        if schedule_reconnect {
            let manager = self.clone();
            let agent = agent.to_string();
            let delay = self.settings.reconnect_delay;
            tokio::spawn(async move {
                tokio::select! {
                    _ = manager.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = manager.reconnect(&agent).await {
                            tracing::warn!(agent = %agent, error = %e, "Reconnect failed");
                        }
                    }
                }
            });
        }
    }

    pub fn is_healthy(&self, agent: &str) -> bool {
        self.handle(agent).map(|h| h.lock().is_fresh()).unwrap_or(false)
    }

    pub fn health_report(&self) -> HealthReport {
        let clients = self.clients.read();
        let mut agents = BTreeMap::new();

        for agent in self.agents().into_iter().chain(clients.keys().cloned()) {
            if agents.contains_key(&agent) {
                continue;
            }
            let entry = match clients.get(&agent) {
                Some(handle) => {
                    let h = handle.lock();
                    AgentHealth {
                        healthy: h.is_fresh(),
                        last_check: h.last_check,
                        last_success: h.last_success,
                        last_error: h.last_error.clone(),
                        retry_count: h.retry_count,
                        error_count: h.error_count,
                        success_count: h.success_count,
                    }
                }
                None => AgentHealth {
                    healthy: false,
                    last_check: None,
                    last_success: None,
                    last_error: Some("not connected".to_string()),
                    retry_count: 0,
                    error_count: 0,
                    success_count: 0,
                },
            };
            agents.insert(agent, entry);
        }

        let healthy = agents.values().filter(|a| a.healthy).count();
        HealthReport {
            total: agents.len(),
            healthy,
            unhealthy: agents.len() - healthy,
            check_time: Utc::now(),
            agents,
        }
    }

    /// Stop the health loop and close every session. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let handles: Vec<(String, Arc<Mutex<Handle>>)> = self.clients.write().drain().collect();
        for (agent, handle) in handles {
            let session = handle.lock().session.take();
            if let Some(session) = session {
                session.close().await;
                tracing::debug!(agent = %agent, "Closed SNMP session");
            }
        }
    }
}
