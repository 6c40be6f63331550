//! IpmiBoardService: the production board plugin.
//!
//! Every capability is a short sequence of commands issued through the
//! node's [`CommandChannel`] (its session manager in production).  What a
//! given board actually offers is described by a [`BoardProfile`]:
//! which operations it supports, which sensors it carries and which LAN
//! channels it exposes.  Two profiles are built in:
//!
//! | Profile            | Boot options | Sensors | LAN channels |
//! |--------------------|--------------|---------|--------------|
//! | `reference_server` | yes          | 5       | 1, 2         |
//! | `reduced`          | no           | none    | 1            |

use std::sync::Arc;

use async_trait::async_trait;
use oob_core::domain::hardware::{
    ChassisIdentifyOptions, EntityId, EthernetController, Operation, SensorDescriptor, SensorEvent,
    SensorFilter, SensorType,
};
use oob_core::protocol::{
    AcpiPowerState, BootOptions, CommandKind, DeviceId, ResponseData, SelInfo, SelfTestResult,
};
use oob_core::{BoardType, ManagementError, Node};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::board_service::{not_supported, BoardService, PowerOperation};
use crate::application::context::{CommandChannel, NodeContext};
use crate::application::registry::BoardServiceFactory;
use crate::infrastructure::network::session_manager::SessionPool;

/// ACPI system state S0/G0 ("working").
const ACPI_WORKING: u8 = 0x00;

// ── Profiles ──────────────────────────────────────────────────────────────────

/// Which built-in profile a configured node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    Reference,
    Reduced,
}

impl ProfileKind {
    pub fn build(self, board: BoardType) -> BoardProfile {
        match self {
            ProfileKind::Reference => BoardProfile::reference_server(board),
            ProfileKind::Reduced => BoardProfile::reduced(board),
        }
    }
}

/// What one board model offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardProfile {
    pub board: BoardType,
    pub operations: Vec<Operation>,
    pub sensors: Vec<SensorDescriptor>,
    pub lan_channels: Vec<u8>,
}

impl BoardProfile {
    /// A full-featured server board: every operation, five sensors, two
    /// management LAN channels.
    pub fn reference_server(board: BoardType) -> Self {
        Self {
            board,
            operations: Operation::ALL.to_vec(),
            sensors: vec![
                sensor(0x01, "CPU1 Temp", SensorType::Temperature, EntityId::Processor),
                sensor(0x02, "Inlet Temp", SensorType::Temperature, EntityId::SystemBoard),
                sensor(0x10, "P12V", SensorType::Voltage, EntityId::SystemBoard),
                sensor(0x30, "FAN1", SensorType::Fan, EntityId::Fan),
                sensor(0x40, "PSU1 Status", SensorType::PowerSupply, EntityId::PowerSupply),
            ],
            lan_channels: vec![1, 2],
        }
    }

    /// A minimal board without boot-option or sensor support.
    pub fn reduced(board: BoardType) -> Self {
        Self {
            board,
            operations: Operation::ALL
                .into_iter()
                .filter(|op| {
                    !matches!(
                        op,
                        Operation::BootOptions | Operation::SetBootOptions | Operation::SensorReadings
                    )
                })
                .collect(),
            sensors: Vec::new(),
            lan_channels: vec![1],
        }
    }
}

fn sensor(number: u8, name: &str, sensor_type: SensorType, entity: EntityId) -> SensorDescriptor {
    SensorDescriptor {
        number,
        name: name.to_string(),
        sensor_type,
        entity,
    }
}

// ── Plugin ────────────────────────────────────────────────────────────────────

pub struct IpmiBoardService {
    profile: BoardProfile,
    channel: Arc<dyn CommandChannel>,
}

impl IpmiBoardService {
    pub fn new(profile: BoardProfile, channel: Arc<dyn CommandChannel>) -> Self {
        Self { profile, channel }
    }

    pub fn profile(&self) -> &BoardProfile {
        &self.profile
    }

    fn require(&self, operation: Operation) -> Result<(), ManagementError> {
        if self.supports(operation) {
            Ok(())
        } else {
            Err(not_supported(&self.profile.board, operation))
        }
    }

    async fn run(&self, ctx: &NodeContext, command: CommandKind) -> Result<ResponseData, ManagementError> {
        debug!(
            node_id = %ctx.node.id(),
            task_id = %ctx.operation.task_id,
            attempt = ctx.operation.attempt,
            command = command.name(),
            "board command"
        );
        self.channel.execute(command).await
    }

    /// Runs `command` and expects a bare acknowledgement.
    async fn acknowledge(&self, ctx: &NodeContext, command: CommandKind) -> Result<(), ManagementError> {
        let name = command.name();
        match self.run(ctx, command).await? {
            ResponseData::Acknowledged => Ok(()),
            other => Err(unexpected(ctx, name, &other)),
        }
    }

    async fn chassis_power(&self, ctx: &NodeContext) -> Result<bool, ManagementError> {
        match self.run(ctx, CommandKind::GetChassisStatus).await? {
            ResponseData::ChassisStatus(status) => Ok(status.power_on),
            other => Err(unexpected(ctx, "Get Chassis Status", &other)),
        }
    }

    async fn acpi(&self, ctx: &NodeContext) -> Result<AcpiPowerState, ManagementError> {
        match self.run(ctx, CommandKind::GetAcpiPowerState).await? {
            ResponseData::AcpiPowerState(state) => Ok(state),
            other => Err(unexpected(ctx, "Get ACPI Power State", &other)),
        }
    }
}

fn unexpected(ctx: &NodeContext, command: &str, reply: &ResponseData) -> ManagementError {
    ManagementError::Operation {
        node_id: ctx.node.id().clone(),
        message: format!("{command} returned {reply:?}"),
    }
}

#[async_trait]
impl BoardService for IpmiBoardService {
    fn board_type(&self) -> &BoardType {
        &self.profile.board
    }

    fn supported_operations(&self) -> &[Operation] {
        &self.profile.operations
    }

    async fn power_status(&self, ctx: &NodeContext) -> Result<bool, ManagementError> {
        self.require(Operation::PowerStatus)?;
        self.chassis_power(ctx).await
    }

    async fn power_operation(
        &self,
        ctx: &NodeContext,
        operation: PowerOperation,
    ) -> Result<(), ManagementError> {
        self.require(Operation::PowerOperation)?;
        let command = match operation.chassis_action() {
            Some(action) => CommandKind::ChassisControl(action),
            None => CommandKind::ColdReset,
        };
        self.acknowledge(ctx, command).await
    }

    async fn acpi_power_state(&self, ctx: &NodeContext) -> Result<AcpiPowerState, ManagementError> {
        self.require(Operation::AcpiPowerState)?;
        self.acpi(ctx).await
    }

    async fn sensor_readings(
        &self,
        ctx: &NodeContext,
        filter: &SensorFilter,
    ) -> Result<Vec<SensorEvent>, ManagementError> {
        self.require(Operation::SensorReadings)?;
        let mut events = Vec::new();
        for sensor in self.profile.sensors.iter().filter(|s| filter.matches(s)) {
            let command = CommandKind::GetSensorReading {
                sensor_number: sensor.number,
            };
            match self.run(ctx, command).await? {
                ResponseData::SensorReading(reading) => events.push(SensorEvent {
                    sensor: sensor.clone(),
                    raw_reading: reading.raw,
                    available: reading.scanning_enabled && !reading.unavailable,
                }),
                other => return Err(unexpected(ctx, "Get Sensor Reading", &other)),
            }
        }
        Ok(events)
    }

    async fn boot_options(&self, ctx: &NodeContext) -> Result<BootOptions, ManagementError> {
        self.require(Operation::BootOptions)?;
        match self.run(ctx, CommandKind::GetSystemBootOptions).await? {
            ResponseData::BootOptions(options) => Ok(options),
            other => Err(unexpected(ctx, "Get System Boot Options", &other)),
        }
    }

    async fn set_boot_options(
        &self,
        ctx: &NodeContext,
        options: BootOptions,
    ) -> Result<(), ManagementError> {
        self.require(Operation::SetBootOptions)?;
        self.acknowledge(ctx, CommandKind::SetSystemBootOptions(options))
            .await
    }

    async fn ethernet_controllers(
        &self,
        ctx: &NodeContext,
    ) -> Result<Vec<EthernetController>, ManagementError> {
        self.require(Operation::EthernetControllers)?;
        let mut controllers = Vec::with_capacity(self.profile.lan_channels.len());
        for &channel in &self.profile.lan_channels {
            match self.run(ctx, CommandKind::GetLanMacAddress { channel }).await? {
                ResponseData::MacAddress(mac_address) => controllers.push(EthernetController {
                    channel,
                    mac_address,
                }),
                other => return Err(unexpected(ctx, "Get LAN Configuration Parameters", &other)),
            }
        }
        Ok(controllers)
    }

    async fn self_test(&self, ctx: &NodeContext) -> Result<SelfTestResult, ManagementError> {
        self.require(Operation::SelfTest)?;
        match self.run(ctx, CommandKind::GetSelfTestResults).await? {
            ResponseData::SelfTest(result) => Ok(result),
            other => Err(unexpected(ctx, "Get Self Test Results", &other)),
        }
    }

    async fn chassis_identify(
        &self,
        ctx: &NodeContext,
        options: ChassisIdentifyOptions,
    ) -> Result<(), ManagementError> {
        self.require(Operation::ChassisIdentify)?;
        // Interval 0 turns the light off.
        let command = if options.identify {
            CommandKind::ChassisIdentify {
                interval_secs: options.interval_secs,
                force_on: options.force_on,
            }
        } else {
            CommandKind::ChassisIdentify {
                interval_secs: 0,
                force_on: false,
            }
        };
        self.acknowledge(ctx, command).await
    }

    async fn sel_info(&self, ctx: &NodeContext) -> Result<SelInfo, ManagementError> {
        self.require(Operation::SelInfo)?;
        match self.run(ctx, CommandKind::GetSelInfo).await? {
            ResponseData::SelInfo(info) => Ok(info),
            other => Err(unexpected(ctx, "Get SEL Info", &other)),
        }
    }

    async fn device_info(&self, ctx: &NodeContext) -> Result<DeviceId, ManagementError> {
        self.require(Operation::DeviceInfo)?;
        match self.run(ctx, CommandKind::GetDeviceId).await? {
            ResponseData::DeviceId(id) => Ok(id),
            other => Err(unexpected(ctx, "Get Device ID", &other)),
        }
    }

    async fn is_host_available(&self, ctx: &NodeContext) -> Result<bool, ManagementError> {
        self.require(Operation::HostAvailability)?;
        if !self.chassis_power(ctx).await? {
            return Ok(false);
        }
        Ok(self.acpi(ctx).await?.system_state == ACPI_WORKING)
    }
}

/// Registry factory building an [`IpmiBoardService`] on top of the node's
/// pooled session.
pub fn ipmi_factory(profile: BoardProfile, sessions: Arc<SessionPool>) -> BoardServiceFactory {
    Arc::new(move |node: &Arc<Node>| {
        let channel: Arc<dyn CommandChannel> = sessions.session_for(node)?;
        Ok(Arc::new(IpmiBoardService::new(profile.clone(), channel)) as Arc<dyn BoardService>)
    })
}
