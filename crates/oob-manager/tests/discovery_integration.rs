//! Integration tests for node discovery.
//!
//! # Purpose
//!
//! Discovery probes a node's power status up to `max_attempts` times, waiting
//! `reattempt_wait` between probes, and records exactly one terminal status.
//! These tests verify:
//!
//! - A node that answers on a later probe is `Success`, with its power state
//!   copied onto the node.
//! - A node that never answers is `Failure` after exactly `max_attempts`
//!   probes, and is not discoverable.
//! - A probe that panics counts as a failed probe and does not take the
//!   manager down.
//! - Deregistering a node cuts a pending reattempt wait short.
//!
//! Plugins are in-memory and the clock is paused.

use std::sync::Arc;
use std::time::Duration;

use oob_core::{BoardType, Credentials, DiscoveryStatus, Node, NodeId};
use oob_manager::application::board_service::BoardService;
use oob_manager::application::discovery::DiscoveryConfig;
use oob_manager::infrastructure::boards::ipmi_board::ProfileKind;
use oob_manager::infrastructure::boards::scripted::{ScriptStep, ScriptedBoardService};
use oob_manager::infrastructure::network::connector::{udp_connector_factory, LanSettings};
use oob_manager::infrastructure::service::{ManagementService, ServiceSettings};

const WAIT: Duration = Duration::from_secs(5);

fn board() -> BoardType {
    BoardType::new("acme", "r1")
}

fn service(nodes: &[(&str, Arc<ScriptedBoardService>)]) -> Arc<ManagementService> {
    let settings = ServiceSettings {
        discovery: DiscoveryConfig {
            max_attempts: 3,
            reattempt_wait: WAIT,
        },
        ..ServiceSettings::default()
    };
    let svc = ManagementService::new(settings, udp_connector_factory(LanSettings::default()));
    for (id, plugin) in nodes {
        let node = Node::new(
            NodeId::from(*id),
            "127.0.0.1:623".parse().unwrap(),
            Credentials::new("admin", "admin"),
            board(),
        );
        svc.register_node(node, ProfileKind::Reference).unwrap();
        svc.registry().override_for_node(NodeId::from(*id), Arc::clone(plugin) as Arc<dyn BoardService>);
    }
    Arc::new(svc)
}

// ── Success paths ─────────────────────────────────────────────────────────────

/// Two failed probes, then an answer: success on the third probe after two
/// reattempt waits.
#[tokio::test(start_paused = true)]
async fn test_node_answering_on_third_probe_is_discovered() {
    // Arrange
    let plugin = Arc::new(
        ScriptedBoardService::new(board())
            .with_powered(false)
            .with_script([ScriptStep::FailConnection, ScriptStep::FailConnection]),
    );
    let svc = service(&[("N1", Arc::clone(&plugin))]);
    let started = tokio::time::Instant::now();

    // Act
    let report = svc.discover(&NodeId::from("N1")).await.unwrap();

    // Assert
    assert_eq!(report.status, DiscoveryStatus::Success);
    assert_eq!(report.failed_attempts, 2);
    assert!(report.discoverable);
    assert!(!report.powered);
    assert_eq!(plugin.call_count(), 3);
    assert!(started.elapsed() >= WAIT * 2);

    let node = svc.nodes().get(&NodeId::from("N1")).unwrap();
    assert!(node.is_discoverable());
    assert!(!node.is_powered());
    assert_eq!(svc.store().get(&NodeId::from("N1")), Some(DiscoveryStatus::Success));
}

/// The first probe answers: no wait at all.
#[tokio::test(start_paused = true)]
async fn test_first_probe_success_does_not_wait() {
    let plugin = Arc::new(ScriptedBoardService::new(board()));
    let svc = service(&[("N1", plugin)]);
    let started = tokio::time::Instant::now();

    let report = svc.discover(&NodeId::from("N1")).await.unwrap();

    assert_eq!(report.status, DiscoveryStatus::Success);
    assert_eq!(report.failed_attempts, 0);
    assert!(report.powered);
    assert!(started.elapsed() < WAIT);
}

// ── Failure paths ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silent_node_fails_after_exactly_max_attempts() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_fallback(ScriptStep::FailConnection));
    let svc = service(&[("N1", Arc::clone(&plugin))]);

    // Act
    let report = svc.discover(&NodeId::from("N1")).await.unwrap();

    // Assert
    assert_eq!(report.status, DiscoveryStatus::Failure);
    assert_eq!(report.failed_attempts, 3);
    assert!(!report.discoverable);
    assert_eq!(plugin.call_count(), 3);
    assert_eq!(svc.store().get(&NodeId::from("N1")), Some(DiscoveryStatus::Failure));
}

/// A busy answer is a failed probe like any other; discovery does not
/// treat it as success and keeps within its own budget.
#[tokio::test(start_paused = true)]
async fn test_busy_probe_counts_as_failed_attempt() {
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_script([ScriptStep::FailBusy]));
    let svc = service(&[("N1", Arc::clone(&plugin))]);

    let report = svc.discover(&NodeId::from("N1")).await.unwrap();

    assert_eq!(report.status, DiscoveryStatus::Success);
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(plugin.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_probe_is_a_failure_not_a_crash() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_fallback(ScriptStep::Panic));
    let healthy = Arc::new(ScriptedBoardService::new(board()));
    let svc = service(&[("N1", plugin), ("N2", healthy)]);

    // Act
    let reports = svc.discover_all().await;

    // Assert
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].node_id, NodeId::from("N1"));
    assert_eq!(reports[0].status, DiscoveryStatus::Failure);
    assert_eq!(reports[0].failed_attempts, 3);
    assert_eq!(reports[1].status, DiscoveryStatus::Success);
    // The panicking probe released its slot each time.
    assert_eq!(svc.gate().in_flight(&NodeId::from("N1")), 0);
}

// ── Deregistration ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_deregistration_interrupts_reattempt_wait() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_fallback(ScriptStep::FailConnection));
    let svc = service(&[("N1", Arc::clone(&plugin))]);
    let run = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move { svc.discover(&NodeId::from("N1")).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    let started = tokio::time::Instant::now();

    // Act
    assert!(svc.deregister_node(&NodeId::from("N1")).await);
    let report = run.await.unwrap().unwrap();

    // Assert
    assert_eq!(report.status, DiscoveryStatus::Failure);
    assert_eq!(report.failed_attempts, 1);
    assert_eq!(plugin.call_count(), 1);
    assert!(started.elapsed() < WAIT);
}
