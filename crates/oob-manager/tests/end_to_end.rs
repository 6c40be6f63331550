//! End-to-end tests over loopback UDP.
//!
//! # Purpose
//!
//! Each test starts a [`SimulatedBmc`] on `127.0.0.1:<ephemeral>` and points a
//! fully wired [`ManagementService`] at it: real UDP sockets, real session
//! negotiation, the IPMI board plugin, the gate and the dispatcher.  They
//! verify:
//!
//! - Discovery opens a session and reports the controller's power state.
//! - Power operations reach the controller and change its state.
//! - A "node busy" answer surfaces as a busy failure after one attempt.
//! - Rejected credentials make discovery fail without retrying forever.
//! - Deregistration closes the session on the controller.
//! - A dispatch issued while deregistration waits on the controller opens no
//!   new session and leaves no gate behind.
//!
//! ```text
//! ManagementService ──UDP──► SimulatedBmc
//!   (RMCP+ session, LAN messages)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use oob_core::{BoardType, Credentials, DiscoveryStatus, ErrorClass, ManagementError, Node, NodeId};
use oob_manager::application::board_service::{BoardReply, BoardRequest, PowerOperation};
use oob_manager::application::discovery::DiscoveryConfig;
use oob_manager::application::dispatcher::RetryPolicy;
use oob_manager::infrastructure::boards::ipmi_board::ProfileKind;
use oob_manager::infrastructure::network::connector::{udp_connector_factory, LanSettings};
use oob_manager::infrastructure::network::emulator::SimulatedBmc;
use oob_manager::infrastructure::network::session_manager::SessionState;
use oob_manager::infrastructure::service::{ManagementService, ServiceSettings};
use tokio::task::JoinHandle;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Fixture {
    bmc: Arc<SimulatedBmc>,
    server: JoinHandle<()>,
    service: ManagementService,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn node_id() -> NodeId {
    NodeId::from("rack1-n01")
}

async fn fixture(bmc: SimulatedBmc) -> Fixture {
    let bmc = Arc::new(bmc);
    let (address, server): (SocketAddr, _) = Arc::clone(&bmc).bind().await.expect("bind loopback");

    let settings = ServiceSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(100),
        },
        discovery: DiscoveryConfig {
            max_attempts: 2,
            reattempt_wait: Duration::from_millis(20),
        },
        ..ServiceSettings::default()
    };
    let lan = LanSettings {
        response_timeout: Duration::from_millis(200),
        retransmits: 2,
    };
    let service = ManagementService::new(settings, udp_connector_factory(lan));
    let node = Node::new(
        node_id(),
        address,
        Credentials::new("admin", "admin"),
        BoardType::new("acme", "r740"),
    );
    service
        .register_node(node, ProfileKind::Reference)
        .expect("register node");

    Fixture {
        bmc,
        server,
        service,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_discovery_opens_session_and_reads_power_state() {
    // Arrange
    let bmc = SimulatedBmc::new();
    bmc.set_powered(false);
    let fx = fixture(bmc).await;

    // Act
    let report = fx.service.discover(&node_id()).await.unwrap();

    // Assert
    assert_eq!(report.status, DiscoveryStatus::Success);
    assert_eq!(report.failed_attempts, 0);
    assert!(report.discoverable);
    assert!(!report.powered);
    assert!(fx.bmc.is_session_open());
    let session = fx.service.sessions().get(&node_id()).expect("session created");
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_power_operations_reach_the_controller() {
    // Arrange
    let fx = fixture(SimulatedBmc::new()).await;
    assert!(fx.bmc.is_powered());

    // Act
    let down = fx
        .service
        .dispatch(&node_id(), BoardRequest::PowerOperation(PowerOperation::PowerDown))
        .await
        .unwrap();
    let status = fx.service.dispatch(&node_id(), BoardRequest::PowerStatus).await.unwrap();

    // Assert
    assert_eq!(down, BoardReply::Done);
    assert_eq!(status, BoardReply::PowerStatus(false));
    assert!(!fx.bmc.is_powered());
}

#[tokio::test]
async fn test_controller_busy_is_reported_after_one_attempt() {
    // Arrange
    let fx = fixture(SimulatedBmc::new()).await;
    fx.service.dispatch(&node_id(), BoardRequest::PowerStatus).await.unwrap();
    fx.bmc.answer_busy(1);

    // Act
    let err = fx
        .service
        .dispatch(&node_id(), BoardRequest::PowerStatus)
        .await
        .unwrap_err();

    // Assert
    assert_eq!(err.class, ErrorClass::Busy);
    assert_eq!(err.attempts, 1);
    // The session survives a busy answer.
    let session = fx.service.sessions().get(&node_id()).unwrap();
    assert!(session.is_session_valid());
}

#[tokio::test]
async fn test_lost_datagram_is_retransmitted() {
    let fx = fixture(SimulatedBmc::new()).await;
    fx.service.dispatch(&node_id(), BoardRequest::PowerStatus).await.unwrap();
    fx.bmc.drop_next(1);

    let reply = fx.service.dispatch(&node_id(), BoardRequest::AcpiPowerState).await;

    assert!(matches!(reply, Ok(BoardReply::AcpiPowerState(_))));
}

#[tokio::test]
async fn test_rejected_credentials_fail_discovery() {
    // Arrange
    let bmc = SimulatedBmc::new();
    bmc.reject_credentials(true);
    let fx = fixture(bmc).await;

    // Act
    let report = fx.service.discover(&node_id()).await.unwrap();

    // Assert
    assert_eq!(report.status, DiscoveryStatus::Failure);
    assert_eq!(report.failed_attempts, 2);
    assert!(!report.discoverable);
    assert!(!fx.bmc.is_session_open());
}

#[tokio::test]
async fn test_deregistration_closes_controller_session() {
    // Arrange
    let fx = fixture(SimulatedBmc::new()).await;
    fx.service.discover(&node_id()).await.unwrap();
    assert!(fx.bmc.is_session_open());

    // Act
    assert!(fx.service.deregister_node(&node_id()).await);

    // Assert
    assert!(!fx.bmc.is_session_open());
    assert!(fx.service.sessions().get(&node_id()).is_none());
    assert!(fx.service.nodes().is_empty());
}

#[tokio::test]
async fn test_dispatch_during_slow_deregistration_opens_no_session() {
    // Arrange: Close Session and both retransmits go unanswered, so
    // deregistration spends about 600 ms waiting on the controller.
    let fx = Arc::new(fixture(SimulatedBmc::new()).await);
    fx.service.discover(&node_id()).await.unwrap();
    let session_id = fx.bmc.last_session_id();
    fx.bmc.drop_next(3);
    let deregistration = {
        let fx = Arc::clone(&fx);
        tokio::spawn(async move { fx.service.deregister_node(&node_id()).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Act
    let err = fx
        .service
        .dispatch(&node_id(), BoardRequest::PowerStatus)
        .await
        .unwrap_err();
    assert!(deregistration.await.unwrap());

    // Assert
    assert!(matches!(err.source, ManagementError::Configuration(_)));
    assert_eq!(err.attempts, 1);
    assert!(!fx.service.gate().is_registered(&node_id()));
    assert!(fx.service.sessions().get(&node_id()).is_none());
    assert_eq!(fx.bmc.last_session_id(), session_id, "no session was opened after deregistration");
}
