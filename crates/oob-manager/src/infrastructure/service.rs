//! ManagementService: the fleet manager wired together.
//!
//! Owns one instance of each application-layer component and the session
//! pool, and exposes the operations the daemon (and any future outer
//! surface) needs:
//!
//! - register / deregister a node,
//! - dispatch a [`BoardRequest`] to a node,
//! - run discovery for one node or the whole fleet,
//! - start the per-node keepalive probes,
//! - shut everything down.
//!
//! # Wiring (for beginners)
//!
//! ```text
//!                 ┌──────────────┐
//!  dispatch ───►  │TaskDispatcher│ ──► ConcurrencyGate (per-node slots)
//!                 └──────┬───────┘
//!                        ▼
//!              BoardServiceRegistry ──► IpmiBoardService ──► SessionPool
//!                                                             │
//!                                                             ▼
//!                                                   NodeSessionManager (UDP)
//! ```
//!
//! Deregistration tears the pieces down in the reverse order: the gate first
//! (so queued callers fail and keepalive stops), then the session, then the
//! plugin instance.  The gate and the session pool both retire the node
//! before the node leaves the registry, so a task that looked the node up
//! just before cannot bring a limiter or a session back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use oob_core::{BoardType, ManagementError, Node, NodeId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::application::board_service::{BoardReply, BoardRequest};
use crate::application::discovery::{DiscoveryConfig, DiscoveryReport, DiscoveryStatusStore, DiscoveryTask};
use crate::application::dispatcher::{DispatchError, RetryPolicy, TaskDispatcher};
use crate::application::gate::{ConcurrencyGate, GateConfig};
use crate::application::manage_nodes::NodeRegistry;
use crate::application::registry::BoardServiceRegistry;
use crate::infrastructure::boards::ipmi_board::{ipmi_factory, ProfileKind};
use crate::infrastructure::network::connector::udp_connector_factory;
use crate::infrastructure::network::session_manager::{ConnectorFactory, SessionPool, SessionSettings};
use crate::infrastructure::storage::config::{AppConfig, ConfigError};

/// Runtime settings of a [`ManagementService`].
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub gate: GateConfig,
    pub session: SessionSettings,
    pub retry: RetryPolicy,
    pub discovery: DiscoveryConfig,
    /// `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
}

impl From<&AppConfig> for ServiceSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            gate: config.gate_config(),
            session: config.session_settings(),
            retry: config.retry_policy(),
            discovery: config.discovery_config(),
            keepalive_interval: config.keepalive_interval(),
        }
    }
}

pub struct ManagementService {
    nodes: Arc<NodeRegistry>,
    gate: Arc<ConcurrencyGate>,
    registry: Arc<BoardServiceRegistry>,
    sessions: Arc<SessionPool>,
    store: Arc<DiscoveryStatusStore>,
    dispatcher: Arc<TaskDispatcher>,
    discovery: DiscoveryTask,
    keepalive_interval: Option<Duration>,
    /// Profile behind each board type's registered factory.
    profiles: Mutex<HashMap<BoardType, ProfileKind>>,
}

impl ManagementService {
    pub fn new(settings: ServiceSettings, connectors: ConnectorFactory) -> Self {
        let nodes = Arc::new(NodeRegistry::new());
        let gate = Arc::new(ConcurrencyGate::new(settings.gate));
        let registry = Arc::new(BoardServiceRegistry::new());
        let sessions = Arc::new(SessionPool::new(settings.session, connectors));
        let store = Arc::new(DiscoveryStatusStore::new());
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&nodes),
            Arc::clone(&registry),
            Arc::clone(&gate),
            settings.retry,
        ));
        let discovery = DiscoveryTask::new(Arc::clone(&dispatcher), Arc::clone(&store), settings.discovery);

        Self {
            nodes,
            gate,
            registry,
            sessions,
            store,
            dispatcher,
            discovery,
            keepalive_interval: settings.keepalive_interval,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a UDP-backed service and registers every configured node.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] for a bad node address and
    /// [`ConfigError::Invalid`] for a node id that appears twice.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let service = Self::new(
            ServiceSettings::from(config),
            udp_connector_factory(config.lan_settings()),
        );
        for entry in &config.nodes {
            let node = entry.to_node(config.session.udp_port)?;
            service
                .register_node(node, entry.profile)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(service)
    }

    // ── Node lifecycle ──────────────────────────────────────────────────────

    /// Registers `node` and, unless its board type already has one, the IPMI
    /// plugin factory built from `profile`.
    ///
    /// # Errors
    ///
    /// [`ManagementError::Configuration`] when the node id is already taken,
    /// or when the node's board type is already served by another profile.
    pub fn register_node(&self, node: Node, profile: ProfileKind) -> Result<Arc<Node>, ManagementError> {
        let board = node.board().clone();
        let mut profiles = self.profiles.lock();
        if let Some(existing) = profiles.get(&board).filter(|existing| **existing != profile) {
            return Err(ManagementError::Configuration(format!(
                "node {} asks for the {profile:?} profile but board {board} is served by the {existing:?} profile",
                node.id()
            )));
        }

        let (node, inserted) = self.nodes.register(node);
        if !inserted {
            return Err(ManagementError::Configuration(format!(
                "node {} is already registered",
                node.id()
            )));
        }
        self.gate.reinstate(node.id());
        self.sessions.reinstate(node.id());
        self.registry.evict(node.id());

        if !profiles.contains_key(&board) {
            let factory = ipmi_factory(profile.build(board.clone()), Arc::clone(&self.sessions));
            self.registry.register(board.clone(), factory, false);
            profiles.insert(board.clone(), profile);
            debug!(board = %board, profile = ?profile, "registered IPMI board service");
        }
        info!(node_id = %node.id(), address = %node.address(), board = %board, "node registered");
        Ok(node)
    }

    /// Removes the node and releases everything held for it.
    ///
    /// Returns `false` when the node was not registered.
    pub async fn deregister_node(&self, node_id: &NodeId) -> bool {
        if self.nodes.get(node_id).is_none() {
            return false;
        }
        self.gate.deregister(node_id);
        let session = self.sessions.take(node_id);
        self.registry.evict(node_id);
        self.store.remove(node_id);
        let removed = self.nodes.remove(node_id).is_some();

        if let Some(session) = session {
            session.retire().await;
        }
        if removed {
            info!(node_id = %node_id, "node deregistered");
        }
        removed
    }

    // ── Operations ──────────────────────────────────────────────────────────

    pub async fn dispatch(&self, node_id: &NodeId, request: BoardRequest) -> Result<BoardReply, DispatchError> {
        self.dispatcher.dispatch(node_id, request).await
    }

    /// Runs discovery for one node.
    ///
    /// # Errors
    ///
    /// [`ManagementError::Configuration`] when the node is not registered.
    pub async fn discover(&self, node_id: &NodeId) -> Result<DiscoveryReport, ManagementError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ManagementError::Configuration(format!("node {node_id} is not registered")))?;
        Ok(self.discovery.run(node).await)
    }

    /// Runs discovery for every registered node concurrently.
    ///
    /// Reports are in node id order: [`NodeRegistry::all`] sorts by id and
    /// `join_all` keeps its input order.
    pub async fn discover_all(&self) -> Vec<DiscoveryReport> {
        let runs = self.nodes.all().into_iter().map(|node| self.discovery.run(node));
        join_all(runs).await
    }

    /// Schedules a liveness probe on every registered node.
    ///
    /// Returns how many nodes got a probe; zero when keepalive is disabled.
    pub fn start_keepalive(&self) -> usize {
        let Some(period) = self.keepalive_interval else {
            debug!("keepalive disabled");
            return 0;
        };

        let mut scheduled = 0;
        for node in self.nodes.all() {
            let node_id = node.id().clone();
            let gate = Arc::clone(&self.gate);
            let sessions = Arc::clone(&self.sessions);
            let job_node = node_id.clone();
            let result = self.gate.scheduler(&node_id).schedule_periodic(period, move || {
                let gate = Arc::clone(&gate);
                let sessions = Arc::clone(&sessions);
                let node_id = job_node.clone();
                async move { keepalive_probe(&gate, &sessions, &node_id).await }
            });
            match result {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(node_id = %node_id, error = %e, "keepalive not scheduled"),
            }
        }
        info!(nodes = scheduled, period = ?period, "keepalive started");
        scheduled
    }

    /// Stops every scheduler and closes every session.
    pub async fn shutdown(&self) {
        self.gate.shutdown();
        self.sessions.destroy_all().await;
        info!("management service shut down");
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<BoardServiceRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<DiscoveryStatusStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }
}

/// One keepalive tick.  Never queues behind real work: a node with no free
/// slot is skipped until the next tick.
async fn keepalive_probe(gate: &ConcurrencyGate, sessions: &SessionPool, node_id: &NodeId) {
    let Some(session) = sessions.get(node_id) else {
        return;
    };
    if !session.is_session_valid() {
        return;
    }
    let Ok(slot) = gate.try_acquire(node_id) else {
        debug!(node_id = %node_id, "node busy, keepalive skipped");
        return;
    };
    if session.is_responsive().await {
        debug!(node_id = %node_id, "keepalive ok");
    } else {
        warn!(node_id = %node_id, state = ?session.state(), "keepalive probe unanswered");
    }
    gate.release(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::board_service::BoardService;
    use crate::infrastructure::boards::scripted::{ScriptStep, ScriptedBoardService};
    use crate::infrastructure::network::connector::LanSettings;
    use oob_core::{Credentials, DiscoveryStatus, Operation};

    fn node(id: &str) -> Node {
        Node::new(
            NodeId::from(id),
            "127.0.0.1:623".parse().unwrap(),
            Credentials::new("admin", "admin"),
            BoardType::new("acme", "r1"),
        )
    }

    fn service(keepalive: Option<Duration>) -> ManagementService {
        let settings = ServiceSettings {
            keepalive_interval: keepalive,
            ..ServiceSettings::default()
        };
        ManagementService::new(settings, udp_connector_factory(LanSettings::default()))
    }

    #[test]
    fn test_register_node_installs_board_factory_once() {
        // Arrange
        let svc = service(None);

        // Act
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();
        svc.register_node(node("N2"), ProfileKind::Reference).unwrap();

        // Assert
        assert_eq!(svc.nodes().len(), 2);
        assert_eq!(svc.registry().registered_boards(), vec![BoardType::new("acme", "r1")]);
    }

    #[test]
    fn test_register_node_rejects_conflicting_profile_for_board() {
        // Arrange
        let svc = service(None);
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();

        // Act
        let err = svc.register_node(node("N2"), ProfileKind::Reduced).unwrap_err();

        // Assert
        assert!(matches!(err, ManagementError::Configuration(_)));
        assert!(svc.nodes().get(&NodeId::from("N2")).is_none());
        let n1 = svc.nodes().get(&NodeId::from("N1")).unwrap();
        let plugin = svc.registry().resolve(&n1).unwrap();
        assert!(plugin.supports(Operation::BootOptions), "N1 keeps the reference profile");
    }

    #[test]
    fn test_register_node_rejects_duplicate_id() {
        let svc = service(None);
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();

        let err = svc.register_node(node("N1"), ProfileKind::Reference).unwrap_err();

        assert!(matches!(err, ManagementError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_pinned_plugin() {
        // Arrange
        let svc = service(None);
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();
        let plugin = Arc::new(ScriptedBoardService::new(BoardType::new("acme", "r1")).with_powered(false));
        svc.registry().override_for_node(NodeId::from("N1"), plugin.clone());

        // Act
        let reply = svc.dispatch(&NodeId::from("N1"), BoardRequest::PowerStatus).await.unwrap();

        // Assert
        assert_eq!(reply, BoardReply::PowerStatus(false));
        assert_eq!(plugin.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_all_records_a_status_per_node() {
        // Arrange
        let svc = service(None);
        for id in ["N1", "N2"] {
            svc.register_node(node(id), ProfileKind::Reference).unwrap();
        }
        let healthy = Arc::new(ScriptedBoardService::new(BoardType::new("acme", "r1")));
        let broken = Arc::new(
            ScriptedBoardService::new(BoardType::new("acme", "r1")).with_fallback(ScriptStep::FailFatal),
        );
        svc.registry().override_for_node(NodeId::from("N1"), healthy);
        svc.registry().override_for_node(NodeId::from("N2"), broken);

        // Act
        let reports = svc.discover_all().await;

        // Assert
        assert_eq!(reports.len(), 2);
        assert_eq!(svc.store().get(&NodeId::from("N1")), Some(DiscoveryStatus::Success));
        assert_eq!(svc.store().get(&NodeId::from("N2")), Some(DiscoveryStatus::Failure));
    }

    #[tokio::test]
    async fn test_discover_unknown_node_is_configuration_error() {
        let svc = service(None);

        let err = svc.discover(&NodeId::from("ghost")).await.unwrap_err();

        assert!(matches!(err, ManagementError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_deregister_releases_everything_for_the_node() {
        // Arrange
        let svc = service(Some(Duration::from_secs(60)));
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();
        svc.registry()
            .override_for_node(NodeId::from("N1"), Arc::new(ScriptedBoardService::new(BoardType::new("acme", "r1"))));
        svc.discover(&NodeId::from("N1")).await.unwrap();
        assert_eq!(svc.start_keepalive(), 1);
        let scheduler = svc.gate().scheduler(&NodeId::from("N1"));

        // Act
        let removed = svc.deregister_node(&NodeId::from("N1")).await;

        // Assert
        assert!(removed);
        assert!(svc.nodes().is_empty());
        assert!(svc.store().get(&NodeId::from("N1")).is_none());
        assert!(!svc.gate().is_registered(&NodeId::from("N1")));
        assert!(scheduler.is_shut_down());
        let err = svc.dispatch(&NodeId::from("N1"), BoardRequest::PowerStatus).await.unwrap_err();
        assert!(matches!(err.source, ManagementError::Configuration(_)));
        assert!(!svc.deregister_node(&NodeId::from("N1")).await);
    }

    #[tokio::test]
    async fn test_keepalive_disabled_schedules_nothing() {
        let svc = service(None);
        svc.register_node(node("N1"), ProfileKind::Reference).unwrap();

        assert_eq!(svc.start_keepalive(), 0);
        assert_eq!(svc.gate().scheduler(&NodeId::from("N1")).active_jobs(), 0);
    }
}
