//! DiscoveryTask: the bounded first-contact probe run after a node boots.
//!
//! The probe is a power-status query dispatched through the
//! [`TaskDispatcher`] with a single-attempt policy; the discovery loop owns
//! the retries itself:
//!
//! ```text
//! attempts = 0
//! while attempts < max_attempts:
//!     if attempts > 0: wait reattempt_wait
//!     probe ok   → discoverable = true, powered = <reported>, stop
//!     probe fail → discoverable = false, attempts += 1
//! record Success | Failure          (exactly once, on every exit path)
//! ```
//!
//! The terminal status is written by a drop guard, so it lands in the
//! [`DiscoveryStatusStore`] even if the probe panics or the discovery future
//! is cancelled.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use oob_core::{DiscoveryStatus, Node, NodeId, Operation};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::application::dispatcher::{RetryPolicy, TaskDispatcher};

// ── Status store ──────────────────────────────────────────────────────────────

/// Node id → last terminal discovery status.
///
/// Owned by the management service and handed to discovery by `Arc`; each
/// discovery run is the single writer for its node.
#[derive(Default)]
pub struct DiscoveryStatusStore {
    statuses: RwLock<HashMap<NodeId, DiscoveryStatus>>,
    writes: AtomicU64,
}

impl DiscoveryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node_id: &NodeId, status: DiscoveryStatus) {
        self.statuses.write().insert(node_id.clone(), status);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, node_id: &NodeId) -> Option<DiscoveryStatus> {
        self.statuses.read().get(node_id).copied()
    }

    /// All statuses, sorted by node id.
    pub fn snapshot(&self) -> Vec<(NodeId, DiscoveryStatus)> {
        let mut all: Vec<_> = self
            .statuses
            .read()
            .iter()
            .map(|(id, status)| (id.clone(), *status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.statuses.write().remove(node_id);
    }

    /// Total number of `record` calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }
}

// ── Discovery loop ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub max_attempts: u32,
    /// Wait between two probes.  No wait precedes the first probe.
    pub reattempt_wait: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reattempt_wait: Duration::from_secs(5),
        }
    }
}

/// Summary of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub node_id: NodeId,
    pub status: DiscoveryStatus,
    /// Failed probes.  Zero when the first probe succeeded.
    pub failed_attempts: u32,
    pub discoverable: bool,
    pub powered: bool,
}

/// Writes the terminal status when the run ends, however it ends.
struct StatusRecorder<'a> {
    store: &'a DiscoveryStatusStore,
    node_id: &'a NodeId,
    status: DiscoveryStatus,
}

impl Drop for StatusRecorder<'_> {
    fn drop(&mut self) {
        self.store.record(self.node_id, self.status);
    }
}

pub struct DiscoveryTask {
    dispatcher: Arc<TaskDispatcher>,
    store: Arc<DiscoveryStatusStore>,
    config: DiscoveryConfig,
}

impl DiscoveryTask {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        store: Arc<DiscoveryStatusStore>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            config,
        }
    }

    pub fn config(&self) -> DiscoveryConfig {
        self.config
    }

    /// Probes `node` until it answers or the attempt budget is spent.
    pub async fn run(&self, node: Arc<Node>) -> DiscoveryReport {
        let node_id = node.id().clone();
        let mut recorder = StatusRecorder {
            store: &self.store,
            node_id: &node_id,
            status: DiscoveryStatus::Failure,
        };

        let scheduler = self.dispatcher.gate().scheduler(&node_id);
        let mut failed_attempts = 0u32;

        while failed_attempts < self.config.max_attempts {
            if failed_attempts != 0 {
                if let Err(e) = scheduler.backoff(self.config.reattempt_wait).await {
                    warn!(node_id = %node_id, error = %e, "discovery interrupted");
                    break;
                }
            }

            match self.probe(&node_id).await {
                Ok(powered) => {
                    node.set_powered(powered);
                    node.set_discoverable(true);
                    recorder.status = DiscoveryStatus::Success;
                    info!(node_id = %node_id, powered, attempt = failed_attempts + 1, "node discovered");
                    break;
                }
                Err(reason) => {
                    node.set_discoverable(false);
                    failed_attempts += 1;
                    warn!(
                        node_id = %node_id,
                        attempt = failed_attempts,
                        max_attempts = self.config.max_attempts,
                        reason = %reason,
                        "discovery probe failed"
                    );
                }
            }
        }

        let status = recorder.status;
        drop(recorder);

        DiscoveryReport {
            node_id,
            status,
            failed_attempts,
            discoverable: node.is_discoverable(),
            powered: node.is_powered(),
        }
    }

    /// One power-status probe.  Panics inside the plugin count as failures.
    async fn probe(&self, node_id: &NodeId) -> Result<bool, String> {
        let policy = RetryPolicy::single_attempt();
        let probe = self
            .dispatcher
            .execute_with_policy(node_id, Operation::PowerStatus, &policy, |service, ctx| {
                Box::pin(async move { service.power_status(&ctx).await })
            });

        match AssertUnwindSafe(probe).catch_unwind().await {
            Ok(Ok(powered)) => Ok(powered),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_panic) => Err("probe panicked".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::board_service::BoardService;
    use crate::application::context::NodeContext;
    use crate::application::gate::{ConcurrencyGate, GateConfig};
    use crate::application::manage_nodes::NodeRegistry;
    use crate::application::registry::BoardServiceRegistry;
    use async_trait::async_trait;
    use oob_core::{BoardType, ConnectionError, Credentials, ManagementError};
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` probes, then reports `powered`.
    struct Probe {
        board: BoardType,
        failures: u32,
        powered: bool,
        panics: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BoardService for Probe {
        fn board_type(&self) -> &BoardType {
            &self.board
        }

        fn supported_operations(&self) -> &[Operation] {
            &[Operation::PowerStatus]
        }

        async fn power_status(&self, _ctx: &NodeContext) -> Result<bool, ManagementError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("vendor plugin bug");
            }
            if call < self.failures {
                return Err(ConnectionError::Timeout {
                    address: "127.0.0.1:623".into(),
                    attempts: 1,
                }
                .into());
            }
            Ok(self.powered)
        }
    }

    fn probe(failures: u32, powered: bool, panics: bool) -> Arc<Probe> {
        Arc::new(Probe {
            board: BoardType::new("acme", "m1"),
            failures,
            powered,
            panics,
            calls: AtomicU32::new(0),
        })
    }

    fn setup(service: Arc<Probe>, max_attempts: u32) -> (DiscoveryTask, Arc<DiscoveryStatusStore>, Arc<Node>) {
        let nodes = Arc::new(NodeRegistry::new());
        let (node, _) = nodes.register(Node::new(
            NodeId::from("N1"),
            "127.0.0.1:623".parse().unwrap(),
            Credentials::new("admin", "admin"),
            BoardType::new("acme", "m1"),
        ));
        let registry = Arc::new(BoardServiceRegistry::new());
        registry.override_for_node(node.id().clone(), service);
        let dispatcher = Arc::new(TaskDispatcher::new(
            nodes,
            registry,
            Arc::new(ConcurrencyGate::new(GateConfig::default())),
            RetryPolicy::default(),
        ));
        let store = Arc::new(DiscoveryStatusStore::new());
        let task = DiscoveryTask::new(
            dispatcher,
            Arc::clone(&store),
            DiscoveryConfig {
                max_attempts,
                reattempt_wait: Duration::from_secs(5),
            },
        );
        (task, store, node)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_probe_makes_exactly_max_attempts() {
        // Arrange
        let service = probe(u32::MAX, false, false);
        let (task, store, node) = setup(Arc::clone(&service), 3);
        let start = tokio::time::Instant::now();

        // Act
        let report = task.run(Arc::clone(&node)).await;

        // Assert
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed_attempts, 3);
        assert!(!node.is_discoverable());
        assert_eq!(store.get(node.id()), Some(DiscoveryStatus::Failure));
        assert_eq!(store.write_count(), 1, "terminal status written exactly once");
        assert!(start.elapsed() >= Duration::from_secs(10), "two waits between three probes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures_marks_discoverable_and_powered() {
        // Arrange
        let service = probe(1, true, false);
        let (task, store, node) = setup(Arc::clone(&service), 3);

        // Act
        let report = task.run(Arc::clone(&node)).await;

        // Assert
        assert_eq!(report.status, DiscoveryStatus::Success);
        assert_eq!(report.failed_attempts, 1);
        assert!(node.is_discoverable());
        assert!(node.is_powered());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_probe_still_records_failure_once() {
        let service = probe(0, false, true);
        let (task, store, node) = setup(Arc::clone(&service), 2);

        let report = task.run(Arc::clone(&node)).await;

        assert_eq!(report.status, DiscoveryStatus::Failure);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.snapshot(), vec![(NodeId::from("N1"), DiscoveryStatus::Failure)]);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_still_records_failure() {
        // Arrange
        let service = probe(u32::MAX, false, false);
        let (task, store, node) = setup(service, 10);

        // Act: give up while the loop waits between probes.
        let outcome = tokio::time::timeout(Duration::from_secs(1), task.run(Arc::clone(&node))).await;

        // Assert
        assert!(outcome.is_err());
        assert_eq!(store.get(node.id()), Some(DiscoveryStatus::Failure));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_zero_attempts_records_failure_without_probing() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let service = probe(0, true, false);
        let (task, store, node) = setup(Arc::clone(&service), 0);

        let report = rt.block_on(task.run(node));

        assert_eq!(report.status, DiscoveryStatus::Failure);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.write_count(), 1);
    }
}
