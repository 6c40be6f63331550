//! Integration tests for task dispatch under the per-node concurrency gate.
//!
//! # Purpose
//!
//! These tests drive [`ManagementService::dispatch`] with in-memory plugins
//! pinned to each node, so they observe the gate and the retry loop without
//! any network I/O.  They verify:
//!
//! - At most K operations run on one node at a time, however many callers
//!   arrive together.
//! - With no queue room, a second caller fails as busy instead of waiting.
//! - Busy and fatal failures are never retried; connection failures are,
//!   within the attempt budget.
//!
//! All tests run on a paused clock, so plugin delays and backoff waits take
//! no wall time.

use std::sync::Arc;
use std::time::Duration;

use oob_core::{BoardType, Credentials, ErrorClass, ManagementError, Node, NodeId, Operation};
use oob_manager::application::board_service::{BoardReply, BoardRequest, PowerOperation};
use oob_manager::application::dispatcher::RetryPolicy;
use oob_manager::application::gate::GateConfig;
use oob_manager::infrastructure::boards::ipmi_board::ProfileKind;
use oob_manager::infrastructure::boards::scripted::{ScriptStep, ScriptedBoardService};
use oob_manager::infrastructure::network::connector::{udp_connector_factory, LanSettings};
use oob_manager::infrastructure::service::{ManagementService, ServiceSettings};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn board() -> BoardType {
    BoardType::new("acme", "r1")
}

fn settings(max_concurrent: usize, max_queue_depth: usize) -> ServiceSettings {
    ServiceSettings {
        gate: GateConfig {
            max_concurrent,
            max_queue_depth,
            queue_timeout: Duration::from_secs(60),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
        },
        ..ServiceSettings::default()
    }
}

/// A service with node `N1` served by `plugin`.
fn service_with(settings: ServiceSettings, plugin: Arc<ScriptedBoardService>) -> Arc<ManagementService> {
    let svc = ManagementService::new(settings, udp_connector_factory(LanSettings::default()));
    let node = Node::new(
        NodeId::from("N1"),
        "127.0.0.1:623".parse().unwrap(),
        Credentials::new("admin", "admin"),
        board(),
    );
    svc.register_node(node, ProfileKind::Reference).unwrap();
    svc.registry().override_for_node(NodeId::from("N1"), plugin);
    Arc::new(svc)
}

fn n1() -> NodeId {
    NodeId::from("N1")
}

// ── Concurrency bound ─────────────────────────────────────────────────────────

/// Eight simultaneous callers against K = 2: everyone completes, never more
/// than two at once.
#[tokio::test(start_paused = true)]
async fn test_simultaneous_callers_never_exceed_node_limit() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_delay(Duration::from_millis(50)));
    let svc = service_with(settings(2, 16), Arc::clone(&plugin));

    // Act
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.dispatch(&n1(), BoardRequest::PowerStatus).await })
        })
        .collect();
    let mut replies = Vec::new();
    for handle in handles {
        replies.push(handle.await.unwrap());
    }

    // Assert
    assert!(replies.iter().all(|r| matches!(r, Ok(BoardReply::PowerStatus(true)))));
    assert_eq!(plugin.call_count(), 8);
    assert_eq!(plugin.peak_in_flight(), 2);
    assert!(svc.gate().peak_in_flight(&n1()) <= 2);
    assert_eq!(svc.gate().in_flight(&n1()), 0);
}

/// K = 1 and no queue room: while one operation runs, a second caller is
/// told the node is busy right away.
#[tokio::test(start_paused = true)]
async fn test_second_caller_is_busy_when_queue_is_full() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_delay(Duration::from_secs(1)));
    let svc = service_with(settings(1, 0), Arc::clone(&plugin));
    let first = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move {
            svc.dispatch(&n1(), BoardRequest::PowerOperation(PowerOperation::PowerDown))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(svc.gate().in_flight(&n1()), 1);

    // Act
    let err = svc.dispatch(&n1(), BoardRequest::PowerStatus).await.unwrap_err();

    // Assert
    assert!(err.is_busy());
    assert_eq!(err.attempts, 1);
    assert!(matches!(err.source, ManagementError::ResourceBusy { .. }));
    assert_eq!(first.await.unwrap().unwrap(), BoardReply::Done);
    assert!(!plugin.is_powered());
}

/// With queue room, the second caller waits and then runs.
#[tokio::test(start_paused = true)]
async fn test_second_caller_queues_and_runs_after_first() {
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_delay(Duration::from_millis(200)));
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));
    let first = {
        let svc = Arc::clone(&svc);
        tokio::spawn(async move { svc.dispatch(&n1(), BoardRequest::PowerStatus).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = svc.dispatch(&n1(), BoardRequest::SelInfo).await;

    assert!(first.await.unwrap().is_ok());
    assert!(matches!(second, Ok(BoardReply::SelInfo(_))));
    assert_eq!(plugin.peak_in_flight(), 1);
}

// ── Retry classification ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_busy_answer_is_never_retried() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_script([ScriptStep::FailBusy]));
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));

    // Act
    let err = svc.dispatch(&n1(), BoardRequest::PowerStatus).await.unwrap_err();

    // Assert
    assert_eq!(err.class, ErrorClass::Busy);
    assert_eq!(err.attempts, 1);
    assert_eq!(plugin.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_is_never_retried() {
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_script([ScriptStep::FailFatal]));
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));

    let err = svc.dispatch(&n1(), BoardRequest::DeviceInfo).await.unwrap_err();

    assert_eq!(err.class, ErrorClass::Fatal);
    assert_eq!(plugin.call_count(), 1);
}

/// Two connection failures then success: three attempts, numbered 1..=3,
/// all under the same task id.
#[tokio::test(start_paused = true)]
async fn test_connection_failures_are_retried_within_budget() {
    // Arrange
    let plugin = Arc::new(
        ScriptedBoardService::new(board())
            .with_script([ScriptStep::FailConnection, ScriptStep::FailConnection]),
    );
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));
    let started = tokio::time::Instant::now();

    // Act
    let reply = svc.dispatch(&n1(), BoardRequest::PowerStatus).await;

    // Assert
    assert!(reply.is_ok());
    let calls = plugin.calls();
    assert_eq!(calls.iter().map(|c| c.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(calls.iter().all(|c| c.task_id == calls[0].task_id));
    // 100 ms then 200 ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_reports_retryable_class() {
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_fallback(ScriptStep::FailConnection));
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));

    let err = svc.dispatch(&n1(), BoardRequest::PowerStatus).await.unwrap_err();

    assert_eq!(err.class, ErrorClass::Retryable);
    assert_eq!(err.attempts, 3);
    assert_eq!(plugin.call_count(), 3);
}

#[tokio::test]
async fn test_unsupported_operation_never_reaches_plugin() {
    // Arrange
    let plugin = Arc::new(ScriptedBoardService::new(board()).with_operations(&[Operation::PowerStatus]));
    let svc = service_with(settings(1, 4), Arc::clone(&plugin));

    // Act
    let err = svc.dispatch(&n1(), BoardRequest::BootOptions).await.unwrap_err();

    // Assert
    assert!(matches!(
        err.source,
        ManagementError::OperationNotSupported {
            operation: Operation::BootOptions,
            ..
        }
    ));
    assert_eq!(plugin.call_count(), 0);
}
