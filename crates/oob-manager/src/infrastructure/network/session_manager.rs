//! NodeSessionManager: exactly one management session per node.
//!
//! # State machine (for beginners)
//!
//! ```text
//!            create_connection / ensure_session
//! Closed ──────────────► Negotiating ──────────► Open
//!   ▲                        │ any failure          │ transport failure
//!   │                        ▼                      ▼
//!   └──────── destroy ◄── (partial teardown)     Invalid
//!   ▲                                               │
//!   └──────────────────── destroy ──────────────────┘
//! ```
//!
//! The connector sits behind a `tokio::sync::Mutex`, so one
//! encode → send → decode cycle always runs to completion before the next
//! one starts on the same session, whatever the node's concurrency limit.
//! A copy of the state is kept behind a `parking_lot::Mutex` so that
//! [`NodeSessionManager::is_session_valid`] is a plain read, never I/O and
//! never an await.
//!
//! Once a node is deregistered its manager is retired: it is destroyed and
//! refuses to negotiate again, even for a caller that still holds it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use oob_core::protocol::{CipherSuite, CommandKind, PrivilegeLevel, ResponseData};
use oob_core::{ConnectionError, Credentials, ErrorClass, ManagementError, Node, NodeId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::application::context::CommandChannel;
use crate::infrastructure::network::connector::BmcConnector;

/// Builds the connector for one node.  Called once per node, on first use.
pub type ConnectorFactory = Arc<dyn Fn(&Node) -> Box<dyn BmcConnector> + Send + Sync>;

/// Level every session is escalated to.
const SESSION_PRIVILEGE: PrivilegeLevel = PrivilegeLevel::Administrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Negotiating,
    Open,
    /// A transport failure was observed; the next use reopens the session.
    Invalid,
}

/// How sessions are negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Index into the controller's advertised cipher suite list.
    pub cipher_suite_index: usize,
    /// Select a suite from the advertised list instead of using suite 0 directly.
    pub encrypt: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cipher_suite_index: 0,
            encrypt: true,
        }
    }
}

pub struct NodeSessionManager {
    node_id: NodeId,
    credentials: Credentials,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    retired: AtomicBool,
    connector: tokio::sync::Mutex<Box<dyn BmcConnector>>,
}

impl NodeSessionManager {
    pub fn new(
        node_id: NodeId,
        credentials: Credentials,
        settings: SessionSettings,
        connector: Box<dyn BmcConnector>,
    ) -> Self {
        Self {
            node_id,
            credentials,
            settings,
            state: Mutex::new(SessionState::Closed),
            retired: AtomicBool::new(false),
            connector: tokio::sync::Mutex::new(connector),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(node_id = %self.node_id, from = ?*current, to = ?state, "session state");
            *current = state;
        }
    }

    /// Opens the transport, selects the cipher suite, runs the handshake and
    /// escalates privilege.
    ///
    /// # Errors
    ///
    /// Any failure tears down whatever was allocated and leaves the session
    /// `Closed`.  A busy completion code is returned as is, so it stays
    /// `Busy`; everything else is a [`ConnectionError`].  A retired manager
    /// fails with [`ManagementError::Configuration`].
    pub async fn create_connection(&self) -> Result<(), ManagementError> {
        let mut connector = self.connector.lock().await;
        self.open(&mut **connector).await
    }

    /// Local bookkeeping check.  No I/O.
    pub fn is_session_valid(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// `true` only when the session is believed valid *and* the controller
    /// answers a chassis status probe.
    pub async fn is_responsive(&self) -> bool {
        if !self.is_session_valid() {
            return false;
        }
        let mut connector = self.connector.lock().await;
        match connector.exchange(CommandKind::GetChassisStatus).await {
            Ok(ResponseData::ChassisStatus(_)) => true,
            Ok(other) => {
                debug!(node_id = %self.node_id, reply = ?other, "unexpected liveness reply");
                false
            }
            Err(e) => {
                if e.is_connection() {
                    self.set_state(SessionState::Invalid);
                }
                debug!(node_id = %self.node_id, error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Reopens the session when it is not valid; a no-op otherwise.
    pub async fn ensure_session(&self) -> Result<(), ManagementError> {
        let mut connector = self.connector.lock().await;
        if self.is_session_valid() {
            return Ok(());
        }
        self.open(&mut **connector).await
    }

    /// Runs one command on the session, opening it first when needed.
    ///
    /// A transport-level failure marks the session `Invalid`.
    pub async fn execute(&self, command: CommandKind) -> Result<ResponseData, ManagementError> {
        let mut connector = self.connector.lock().await;
        if !self.is_session_valid() {
            self.open(&mut **connector).await?;
        }
        let result = connector.exchange(command).await;
        if let Err(e) = &result {
            if e.is_connection() {
                warn!(node_id = %self.node_id, error = %e, "session invalidated");
                self.set_state(SessionState::Invalid);
            }
        }
        result
    }

    /// Closes the session and the transport, then tears the connector down.
    ///
    /// Every step runs even when an earlier one fails; failures are logged.
    /// Calling this on a closed session does nothing.
    pub async fn destroy(&self) {
        let mut connector = self.connector.lock().await;
        if self.state() == SessionState::Closed {
            debug!(node_id = %self.node_id, "session already closed");
            return;
        }

        if let Err(e) = connector.close_session().await {
            warn!(node_id = %self.node_id, error = %e, "close session failed during teardown");
        }
        connector.close_connection().await;
        connector.tear_down().await;
        self.set_state(SessionState::Closed);
        info!(node_id = %self.node_id, "session destroyed");
    }

    /// Destroys the session and refuses every later attempt to reopen it.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.destroy().await;
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Negotiation with the connector lock held.
    async fn open(&self, connector: &mut dyn BmcConnector) -> Result<(), ManagementError> {
        if self.is_retired() {
            return Err(ManagementError::Configuration(format!(
                "session for node {} has been torn down",
                self.node_id
            )));
        }
        if self.state() == SessionState::Invalid {
            // Start over on a fresh socket.
            connector.close_connection().await;
        }
        self.set_state(SessionState::Negotiating);

        match self.negotiate(connector).await {
            Ok(suite) => {
                self.set_state(SessionState::Open);
                info!(node_id = %self.node_id, cipher_suite = suite.id, "session open");
                Ok(())
            }
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "session negotiation failed");
                if let Err(close) = connector.close_session().await {
                    debug!(node_id = %self.node_id, error = %close, "close session after failed negotiation");
                }
                connector.close_connection().await;
                self.set_state(SessionState::Closed);
                Err(match e.class() {
                    ErrorClass::Fatal => ConnectionError::Negotiation(e.to_string()).into(),
                    ErrorClass::Retryable | ErrorClass::Busy => e,
                })
            }
        }
    }

    async fn negotiate(&self, connector: &mut dyn BmcConnector) -> Result<CipherSuite, ManagementError> {
        connector.connect().await?;

        let caps = connector.channel_auth_capabilities().await?;
        if !caps.ipmi_v20 {
            return Err(ConnectionError::Negotiation(format!(
                "channel {} does not support RMCP+ sessions",
                caps.channel
            ))
            .into());
        }

        let suite = if self.settings.encrypt {
            let suites = connector.cipher_suites().await?;
            *suites
                .get(self.settings.cipher_suite_index)
                .ok_or(ConnectionError::NoCipherSuite {
                    index: self.settings.cipher_suite_index,
                    available: suites.len(),
                })?
        } else {
            CipherSuite::NONE
        };

        connector
            .open_session(suite, SESSION_PRIVILEGE, self.credentials.clone())
            .await?;

        match connector
            .exchange(CommandKind::SetSessionPrivilegeLevel(SESSION_PRIVILEGE))
            .await?
        {
            ResponseData::Privilege(level) if level >= SESSION_PRIVILEGE => Ok(suite),
            other => Err(ConnectionError::Negotiation(format!(
                "privilege escalation answered with {other:?}"
            ))
            .into()),
        }
    }
}

#[async_trait]
impl CommandChannel for NodeSessionManager {
    async fn execute(&self, command: CommandKind) -> Result<ResponseData, ManagementError> {
        NodeSessionManager::execute(self, command).await
    }
}

// ── Session pool ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolState {
    sessions: HashMap<NodeId, Arc<NodeSessionManager>>,
    /// Removed nodes; no manager is created for them until reinstated.
    retired: HashSet<NodeId>,
}

/// Node id → the node's exclusively owned session manager.
pub struct SessionPool {
    settings: SessionSettings,
    factory: ConnectorFactory,
    pool: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(settings: SessionSettings, factory: ConnectorFactory) -> Self {
        Self {
            settings,
            factory,
            pool: Mutex::new(PoolState::default()),
        }
    }

    /// The node's session manager, created on first use.  No I/O happens
    /// until the first command.
    ///
    /// # Errors
    ///
    /// [`ManagementError::Configuration`] when the node has been removed.
    pub fn session_for(&self, node: &Node) -> Result<Arc<NodeSessionManager>, ManagementError> {
        let mut pool = self.pool.lock();
        if pool.retired.contains(node.id()) {
            return Err(ManagementError::Configuration(format!(
                "node {} is deregistered",
                node.id()
            )));
        }
        let session = pool.sessions.entry(node.id().clone()).or_insert_with(|| {
            debug!(node_id = %node.id(), "creating session manager");
            Arc::new(NodeSessionManager::new(
                node.id().clone(),
                node.credentials().clone(),
                self.settings,
                (self.factory)(node),
            ))
        });
        Ok(Arc::clone(session))
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<NodeSessionManager>> {
        self.pool.lock().sessions.get(node_id).cloned()
    }

    /// Takes the node's session manager out of the pool and retires the
    /// node, without any I/O.  The caller retires the returned manager.
    pub fn take(&self, node_id: &NodeId) -> Option<Arc<NodeSessionManager>> {
        let mut pool = self.pool.lock();
        pool.retired.insert(node_id.clone());
        pool.sessions.remove(node_id)
    }

    /// Removes the node's session manager and destroys its session.
    pub async fn remove(&self, node_id: &NodeId) {
        if let Some(session) = self.take(node_id) {
            session.retire().await;
        }
    }

    /// Lets a removed node get a session manager again.
    pub fn reinstate(&self, node_id: &NodeId) {
        self.pool.lock().retired.remove(node_id);
    }

    pub async fn destroy_all(&self) {
        let all: Vec<_> = {
            let mut pool = self.pool.lock();
            let PoolState { sessions, retired } = &mut *pool;
            sessions
                .drain()
                .map(|(node_id, session)| {
                    retired.insert(node_id);
                    session
                })
                .collect()
        };
        for session in all {
            session.retire().await;
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
