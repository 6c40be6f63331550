//! The uniform capability contract implemented by every vendor board plugin.
//!
//! # Capability sets instead of inheritance (for beginners)
//!
//! Boards differ in what they can do: some expose boot options and sensors,
//! some only power control.  Rather than a class hierarchy, every plugin
//! implements the single [`BoardService`] trait and *declares* what it
//! supports through [`BoardService::supported_operations`].  Methods a plugin
//! does not override fall back to a default body returning
//! `OperationNotSupported`, and the dispatcher checks `supports()` before it
//! ever calls into the plugin.
//!
//! Failure contract for plugin methods:
//!
//! - `ResourceBusy` – transient; surfaced as-is, never retried by the plugin.
//! - `Operation` – fatal; wraps whatever the plugin could not recover from.
//! - `OperationNotSupported` – the capability is absent for this board type.
//! - `Connection` – the session failed underneath; the dispatcher retries.

use async_trait::async_trait;
use oob_core::domain::hardware::{
    ChassisIdentifyOptions, EthernetController, Operation, SensorEvent, SensorFilter,
};
use oob_core::protocol::{
    AcpiPowerState, BootOptions, DeviceId, PowerAction, SelInfo, SelfTestResult,
};
use oob_core::{BoardType, ManagementError};
use serde::{Deserialize, Serialize};

use crate::application::context::NodeContext;

/// Power actions a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerOperation {
    PowerUp,
    PowerDown,
    PowerCycle,
    HardReset,
    SoftShutdown,
    /// Restarts the management controller itself, not the host.
    ColdResetController,
}

impl PowerOperation {
    /// The chassis control action for host-level operations.
    pub fn chassis_action(self) -> Option<PowerAction> {
        match self {
            PowerOperation::PowerUp => Some(PowerAction::PowerUp),
            PowerOperation::PowerDown => Some(PowerAction::PowerDown),
            PowerOperation::PowerCycle => Some(PowerAction::PowerCycle),
            PowerOperation::HardReset => Some(PowerAction::HardReset),
            PowerOperation::SoftShutdown => Some(PowerAction::SoftShutdown),
            PowerOperation::ColdResetController => None,
        }
    }
}

/// Builds the `OperationNotSupported` error for `operation` on `board`.
pub fn not_supported(board: &BoardType, operation: Operation) -> ManagementError {
    ManagementError::OperationNotSupported {
        operation,
        board: board.clone(),
    }
}

/// Vendor plugin contract.  One instance serves one node.
#[async_trait]
pub trait BoardService: Send + Sync {
    /// Board identity this plugin was built for.
    fn board_type(&self) -> &BoardType;

    /// Every operation this plugin implements.
    fn supported_operations(&self) -> &[Operation];

    fn supports(&self, operation: Operation) -> bool {
        self.supported_operations().contains(&operation)
    }

    /// `true` when the host is powered on.
    async fn power_status(&self, _ctx: &NodeContext) -> Result<bool, ManagementError> {
        Err(not_supported(self.board_type(), Operation::PowerStatus))
    }

    async fn power_operation(
        &self,
        _ctx: &NodeContext,
        _operation: PowerOperation,
    ) -> Result<(), ManagementError> {
        Err(not_supported(self.board_type(), Operation::PowerOperation))
    }

    async fn acpi_power_state(&self, _ctx: &NodeContext) -> Result<AcpiPowerState, ManagementError> {
        Err(not_supported(self.board_type(), Operation::AcpiPowerState))
    }

    async fn sensor_readings(
        &self,
        _ctx: &NodeContext,
        _filter: &SensorFilter,
    ) -> Result<Vec<SensorEvent>, ManagementError> {
        Err(not_supported(self.board_type(), Operation::SensorReadings))
    }

    async fn boot_options(&self, _ctx: &NodeContext) -> Result<BootOptions, ManagementError> {
        Err(not_supported(self.board_type(), Operation::BootOptions))
    }

    async fn set_boot_options(
        &self,
        _ctx: &NodeContext,
        _options: BootOptions,
    ) -> Result<(), ManagementError> {
        Err(not_supported(self.board_type(), Operation::SetBootOptions))
    }

    async fn ethernet_controllers(
        &self,
        _ctx: &NodeContext,
    ) -> Result<Vec<EthernetController>, ManagementError> {
        Err(not_supported(self.board_type(), Operation::EthernetControllers))
    }

    async fn self_test(&self, _ctx: &NodeContext) -> Result<SelfTestResult, ManagementError> {
        Err(not_supported(self.board_type(), Operation::SelfTest))
    }

    async fn chassis_identify(
        &self,
        _ctx: &NodeContext,
        _options: ChassisIdentifyOptions,
    ) -> Result<(), ManagementError> {
        Err(not_supported(self.board_type(), Operation::ChassisIdentify))
    }

    async fn sel_info(&self, _ctx: &NodeContext) -> Result<SelInfo, ManagementError> {
        Err(not_supported(self.board_type(), Operation::SelInfo))
    }

    async fn device_info(&self, _ctx: &NodeContext) -> Result<DeviceId, ManagementError> {
        Err(not_supported(self.board_type(), Operation::DeviceInfo))
    }

    /// `true` when the host operating system is up (powered and in S0).
    async fn is_host_available(&self, _ctx: &NodeContext) -> Result<bool, ManagementError> {
        Err(not_supported(self.board_type(), Operation::HostAvailability))
    }
}

// ── Typed request / reply ─────────────────────────────────────────────────────

/// One plugin call expressed as data, so callers outside Rust code (CLI,
/// future REST surface) can name an operation without a closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardRequest {
    PowerStatus,
    PowerOperation(PowerOperation),
    AcpiPowerState,
    SensorReadings(SensorFilter),
    BootOptions,
    SetBootOptions(BootOptions),
    EthernetControllers,
    SelfTest,
    ChassisIdentify(ChassisIdentifyOptions),
    SelInfo,
    DeviceInfo,
    HostAvailability,
}

impl BoardRequest {
    pub fn operation(&self) -> Operation {
        match self {
            BoardRequest::PowerStatus => Operation::PowerStatus,
            BoardRequest::PowerOperation(_) => Operation::PowerOperation,
            BoardRequest::AcpiPowerState => Operation::AcpiPowerState,
            BoardRequest::SensorReadings(_) => Operation::SensorReadings,
            BoardRequest::BootOptions => Operation::BootOptions,
            BoardRequest::SetBootOptions(_) => Operation::SetBootOptions,
            BoardRequest::EthernetControllers => Operation::EthernetControllers,
            BoardRequest::SelfTest => Operation::SelfTest,
            BoardRequest::ChassisIdentify(_) => Operation::ChassisIdentify,
            BoardRequest::SelInfo => Operation::SelInfo,
            BoardRequest::DeviceInfo => Operation::DeviceInfo,
            BoardRequest::HostAvailability => Operation::HostAvailability,
        }
    }

    /// Invokes the matching plugin method.
    pub async fn invoke(
        &self,
        service: &dyn BoardService,
        ctx: &NodeContext,
    ) -> Result<BoardReply, ManagementError> {
        Ok(match self {
            BoardRequest::PowerStatus => BoardReply::PowerStatus(service.power_status(ctx).await?),
            BoardRequest::PowerOperation(op) => {
                service.power_operation(ctx, *op).await?;
                BoardReply::Done
            }
            BoardRequest::AcpiPowerState => {
                BoardReply::AcpiPowerState(service.acpi_power_state(ctx).await?)
            }
            BoardRequest::SensorReadings(filter) => {
                BoardReply::Sensors(service.sensor_readings(ctx, filter).await?)
            }
            BoardRequest::BootOptions => BoardReply::BootOptions(service.boot_options(ctx).await?),
            BoardRequest::SetBootOptions(options) => {
                service.set_boot_options(ctx, *options).await?;
                BoardReply::Done
            }
            BoardRequest::EthernetControllers => {
                BoardReply::EthernetControllers(service.ethernet_controllers(ctx).await?)
            }
            BoardRequest::SelfTest => BoardReply::SelfTest(service.self_test(ctx).await?),
            BoardRequest::ChassisIdentify(options) => {
                service.chassis_identify(ctx, *options).await?;
                BoardReply::Done
            }
            BoardRequest::SelInfo => BoardReply::SelInfo(service.sel_info(ctx).await?),
            BoardRequest::DeviceInfo => BoardReply::DeviceInfo(service.device_info(ctx).await?),
            BoardRequest::HostAvailability => {
                BoardReply::HostAvailable(service.is_host_available(ctx).await?)
            }
        })
    }
}

/// Result of a [`BoardRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BoardReply {
    PowerStatus(bool),
    AcpiPowerState(AcpiPowerState),
    Sensors(Vec<SensorEvent>),
    BootOptions(BootOptions),
    EthernetControllers(Vec<EthernetController>),
    SelfTest(SelfTestResult),
    SelInfo(SelInfo),
    DeviceInfo(DeviceId),
    HostAvailable(bool),
    /// The operation has no payload to return.
    Done,
}
