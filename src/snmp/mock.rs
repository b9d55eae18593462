//! In-memory sessions for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{compare_oids, oid_suffix, Connector, Session, SnmpValue, VarBind};
use crate::config::AgentEndpoint;
use crate::error::TransportError;

#[derive(Default)]
pub struct MockSession {
    table: Mutex<BTreeMap<String, SnmpValue>>,
    /// OIDs whose GET fails the whole request.
    broken: Mutex<HashSet<String>>,
    pub fail_batches: AtomicBool,
    pub fail_all: AtomicBool,
    pub panic_on_get: AtomicBool,
    pub get_calls: AtomicUsize,
    pub walk_calls: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockSession {
    pub fn new(entries: &[(&str, SnmpValue)]) -> Arc<Self> {
        let session = Self::default();
        for (oid, value) in entries {
            session.set(oid, value.clone());
        }
        Arc::new(session)
    }

    pub fn set(&self, oid: &str, value: SnmpValue) {
        self.table.lock().insert(oid.to_string(), value);
    }

    pub fn remove(&self, oid: &str) {
        self.table.lock().remove(oid);
    }

    pub fn break_oid(&self, oid: &str) {
        self.broken.lock().insert(oid.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn get(&self, oids: &[String]) -> Result<Vec<VarBind>, TransportError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_get.load(Ordering::SeqCst) {
            panic!("mock session told to panic");
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(std::time::Duration::from_millis(1)));
        }
        if oids.len() > 1 && self.fail_batches.load(Ordering::SeqCst) {
            return Err(TransportError::ErrorStatus { status: 5, index: 0 });
        }
        let broken = self.broken.lock();
        if let Some(bad) = oids.iter().find(|o| broken.contains(*o)) {
            return Err(TransportError::Encode(format!("invalid OID '{}'", bad)));
        }
        let table = self.table.lock();
        Ok(oids
            .iter()
            .map(|o| {
                VarBind::new(
                    o.clone(),
                    table.get(o).cloned().unwrap_or(SnmpValue::NoSuchInstance),
                )
            })
            .collect())
    }

    async fn walk(&self, root: &str) -> Result<Vec<VarBind>, TransportError> {
        self.walk_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(std::time::Duration::from_millis(1)));
        }
        let mut out: Vec<VarBind> = self
            .table
            .lock()
            .iter()
            .filter(|(oid, _)| oid_suffix(oid, root).is_some())
            .map(|(oid, v)| VarBind::new(oid.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| compare_oids(&a.oid, &b.oid));
        Ok(out)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out registered mock sessions by agent address.
#[derive(Default)]
pub struct MockConnector {
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
    pub refuse: AtomicBool,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, agent: &str, session: Arc<MockSession>) {
        self.sessions.lock().insert(agent.to_string(), session);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Arc<dyn Session>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Io("connection refused".into()));
        }
        let address = endpoint.address();
        let session: Arc<dyn Session> = self
            .sessions
            .lock()
            .get(&address)
            .cloned()
            .ok_or(TransportError::UnknownAgent(address))?;
        Ok(session)
    }
}
