//! ScriptedBoardService: a board plugin that plays back a script.
//!
//! Each plugin call pops the next [`ScriptStep`] (or uses the fallback step
//! once the script is exhausted), optionally sleeps, and then succeeds or
//! fails the way the step says.  Every call is recorded together with the
//! attempt number from its [`OperationContext`], and the plugin tracks how
//! many calls were executing at once.
//!
//! Used by the dispatcher and discovery tests, and by the daemon's
//! `--dry-run` mode, where it stands in for real hardware.
//!
//! [`OperationContext`]: crate::application::context::OperationContext

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oob_core::domain::hardware::{
    ChassisIdentifyOptions, EthernetController, Operation, SensorEvent, SensorFilter,
};
use oob_core::protocol::{
    AcpiPowerState, BootDevice, BootOptions, CompletionCode, DeviceId, ProtocolError, SelInfo,
    SelfTestResult,
};
use oob_core::{BoardType, ConnectionError, ManagementError};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::application::board_service::{not_supported, BoardService, PowerOperation};
use crate::application::context::NodeContext;

/// What one plugin call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStep {
    Succeed,
    /// Fails with a transport timeout (retryable).
    FailConnection,
    /// Fails with the controller's "node busy" completion code.
    FailBusy,
    /// Fails with a plugin-level operation error.
    FailFatal,
    Panic,
}

/// One observed plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub attempt: u32,
    pub task_id: Uuid,
}

/// Decrements the in-flight counter on every exit path.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedBoardService {
    board: BoardType,
    operations: Vec<Operation>,
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    delay: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    powered: AtomicBool,
    boot: Mutex<BootOptions>,
}

impl ScriptedBoardService {
    /// A plugin supporting every operation that always succeeds.
    pub fn new(board: BoardType) -> Self {
        Self {
            board,
            operations: Operation::ALL.to_vec(),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptStep::Succeed,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            powered: AtomicBool::new(true),
            boot: Mutex::new(BootOptions {
                valid: false,
                persistent: false,
                efi: false,
                device: BootDevice::NoOverride,
            }),
        }
    }

    pub fn with_operations(mut self, operations: &[Operation]) -> Self {
        self.operations = operations.to_vec();
        self
    }

    /// Steps played back in order, one per call.
    pub fn with_script(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Step used once the script is exhausted.
    pub fn with_fallback(mut self, step: ScriptStep) -> Self {
        self.fallback = step;
        self
    }

    /// Time every call spends "on the wire".
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_powered(self, powered: bool) -> Self {
        self.powered.store(powered, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls that were executing at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    /// Records the call, waits, and applies the next step.
    async fn step(&self, ctx: &NodeContext, operation: Operation) -> Result<(), ManagementError> {
        if !self.supports(operation) {
            return Err(not_supported(&self.board, operation));
        }
        self.calls.lock().push(RecordedCall {
            operation,
            attempt: ctx.operation.attempt,
            task_id: ctx.operation.task_id,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().pop_front().unwrap_or(self.fallback);
        match step {
            ScriptStep::Succeed => Ok(()),
            ScriptStep::FailConnection => Err(ConnectionError::Timeout {
                address: ctx.node.address().to_string(),
                attempts: 1,
            }
            .into()),
            ScriptStep::FailBusy => Err(ProtocolError::Completion {
                command: "scripted",
                code: CompletionCode::NodeBusy,
            }
            .into()),
            ScriptStep::FailFatal => Err(ManagementError::Operation {
                node_id: ctx.node.id().clone(),
                message: format!("scripted failure of {operation}"),
            }),
            ScriptStep::Panic => panic!("scripted panic during {operation}"),
        }
    }
}

#[async_trait]
impl BoardService for ScriptedBoardService {
    fn board_type(&self) -> &BoardType {
        &self.board
    }

    fn supported_operations(&self) -> &[Operation] {
        &self.operations
    }

    async fn power_status(&self, ctx: &NodeContext) -> Result<bool, ManagementError> {
        self.step(ctx, Operation::PowerStatus).await?;
        Ok(self.is_powered())
    }

    async fn power_operation(
        &self,
        ctx: &NodeContext,
        operation: PowerOperation,
    ) -> Result<(), ManagementError> {
        self.step(ctx, Operation::PowerOperation).await?;
        match operation {
            PowerOperation::PowerDown | PowerOperation::SoftShutdown => {
                self.powered.store(false, Ordering::SeqCst)
            }
            PowerOperation::PowerUp | PowerOperation::PowerCycle | PowerOperation::HardReset => {
                self.powered.store(true, Ordering::SeqCst)
            }
            PowerOperation::ColdResetController => {}
        }
        Ok(())
    }

    async fn acpi_power_state(&self, ctx: &NodeContext) -> Result<AcpiPowerState, ManagementError> {
        self.step(ctx, Operation::AcpiPowerState).await?;
        Ok(AcpiPowerState {
            system_state: if self.is_powered() { 0x00 } else { 0x05 },
            device_state: 0x00,
        })
    }

    async fn sensor_readings(
        &self,
        ctx: &NodeContext,
        _filter: &SensorFilter,
    ) -> Result<Vec<SensorEvent>, ManagementError> {
        self.step(ctx, Operation::SensorReadings).await?;
        Ok(Vec::new())
    }

    async fn boot_options(&self, ctx: &NodeContext) -> Result<BootOptions, ManagementError> {
        self.step(ctx, Operation::BootOptions).await?;
        Ok(*self.boot.lock())
    }

    async fn set_boot_options(
        &self,
        ctx: &NodeContext,
        options: BootOptions,
    ) -> Result<(), ManagementError> {
        self.step(ctx, Operation::SetBootOptions).await?;
        *self.boot.lock() = options;
        Ok(())
    }

    async fn ethernet_controllers(
        &self,
        ctx: &NodeContext,
    ) -> Result<Vec<EthernetController>, ManagementError> {
        self.step(ctx, Operation::EthernetControllers).await?;
        Ok(vec![EthernetController {
            channel: 1,
            mac_address: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        }])
    }

    async fn self_test(&self, ctx: &NodeContext) -> Result<SelfTestResult, ManagementError> {
        self.step(ctx, Operation::SelfTest).await?;
        Ok(SelfTestResult {
            code: 0x55,
            detail: 0x00,
        })
    }

    async fn chassis_identify(
        &self,
        ctx: &NodeContext,
        _options: ChassisIdentifyOptions,
    ) -> Result<(), ManagementError> {
        self.step(ctx, Operation::ChassisIdentify).await
    }

    async fn sel_info(&self, ctx: &NodeContext) -> Result<SelInfo, ManagementError> {
        self.step(ctx, Operation::SelInfo).await?;
        Ok(SelInfo {
            version: 0x51,
            entries: 0,
            free_bytes: 0xFFFF,
            last_addition: 0,
            last_erase: 0,
            operation_support: 0,
        })
    }

    async fn device_info(&self, ctx: &NodeContext) -> Result<DeviceId, ManagementError> {
        self.step(ctx, Operation::DeviceInfo).await?;
        Ok(DeviceId {
            device_id: 0x20,
            device_revision: 1,
            firmware_major: 1,
            firmware_minor: 0x00,
            ipmi_version: 0x02,
            manufacturer_id: 0,
            product_id: 0,
        })
    }

    async fn is_host_available(&self, ctx: &NodeContext) -> Result<bool, ManagementError> {
        self.step(ctx, Operation::HostAvailability).await?;
        Ok(self.is_powered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::OperationContext;
    use oob_core::{Credentials, ErrorClass, Node, NodeId};
    use std::sync::Arc;

    fn ctx(attempt: u32) -> NodeContext {
        let node = Arc::new(Node::new(
            NodeId::from("N1"),
            "10.0.0.1:623".parse().unwrap(),
            Credentials::new("admin", "admin"),
            BoardType::new("acme", "m1"),
        ));
        let mut operation = OperationContext::new(Uuid::new_v4(), Operation::PowerStatus);
        operation.attempt = attempt;
        NodeContext::new(node, operation)
    }

    #[tokio::test]
    async fn test_script_plays_in_order_then_falls_back() {
        // Arrange
        let board = ScriptedBoardService::new(BoardType::new("acme", "m1"))
            .with_script([ScriptStep::FailConnection, ScriptStep::FailBusy])
            .with_fallback(ScriptStep::Succeed);

        // Act
        let first = board.power_status(&ctx(1)).await;
        let second = board.power_status(&ctx(2)).await;
        let third = board.power_status(&ctx(3)).await;

        // Assert
        assert_eq!(first.unwrap_err().class(), ErrorClass::Retryable);
        assert_eq!(second.unwrap_err().class(), ErrorClass::Busy);
        assert!(third.unwrap());
        let attempts: Vec<u32> = board.calls().iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_power_operations_update_reported_state() {
        let board = ScriptedBoardService::new(BoardType::new("acme", "m1"));

        board
            .power_operation(&ctx(1), PowerOperation::PowerDown)
            .await
            .unwrap();

        assert!(!board.power_status(&ctx(1)).await.unwrap());
        assert_eq!(
            board.acpi_power_state(&ctx(1)).await.unwrap().system_state,
            0x05
        );
    }

    #[tokio::test]
    async fn test_unsupported_operation_is_not_recorded() {
        let board = ScriptedBoardService::new(BoardType::new("acme", "m1"))
            .with_operations(&[Operation::PowerStatus]);

        let err = board.sel_info(&ctx(1)).await.unwrap_err();

        assert!(matches!(err, ManagementError::OperationNotSupported { .. }));
        assert_eq!(board.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_in_flight_counts_overlapping_calls() {
        // Arrange
        let board = ScriptedBoardService::new(BoardType::new("acme", "m1"))
            .with_delay(Duration::from_millis(100));
        let ctx = ctx(1);

        // Act
        let (a, b) = tokio::join!(board.power_status(&ctx), board.power_status(&ctx));

        // Assert
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(board.peak_in_flight(), 2);
    }
}
