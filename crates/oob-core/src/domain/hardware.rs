//! Hardware descriptors shared between board plugins and their callers.
//!
//! These types describe *what* a board reports (sensors, NICs, identify
//! state) independently of the wire commands used to fetch it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every capability a board service plugin can offer.
///
/// Plugins advertise the subset they implement through
/// `supported_operations()`; the dispatcher refuses anything else with
/// `OperationNotSupported` before touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    PowerStatus,
    PowerOperation,
    AcpiPowerState,
    SensorReadings,
    BootOptions,
    SetBootOptions,
    EthernetControllers,
    SelfTest,
    ChassisIdentify,
    SelInfo,
    DeviceInfo,
    HostAvailability,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Operation; 12] = [
        Operation::PowerStatus,
        Operation::PowerOperation,
        Operation::AcpiPowerState,
        Operation::SensorReadings,
        Operation::BootOptions,
        Operation::SetBootOptions,
        Operation::EthernetControllers,
        Operation::SelfTest,
        Operation::ChassisIdentify,
        Operation::SelInfo,
        Operation::DeviceInfo,
        Operation::HostAvailability,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Sensor type codes (IPMI table 42-3, subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    Temperature,
    Voltage,
    Fan,
    Processor,
    PowerSupply,
    Memory,
    Other(u8),
}

impl From<u8> for SensorType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => SensorType::Temperature,
            0x02 => SensorType::Voltage,
            0x04 => SensorType::Fan,
            0x07 => SensorType::Processor,
            0x08 => SensorType::PowerSupply,
            0x0C => SensorType::Memory,
            other => SensorType::Other(other),
        }
    }
}

/// Entity codes identifying the physical component a sensor watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Processor,
    SystemBoard,
    PowerSupply,
    Fan,
    MemoryDevice,
    Other(u8),
}

impl From<u8> for EntityId {
    fn from(value: u8) -> Self {
        match value {
            0x03 => EntityId::Processor,
            0x07 => EntityId::SystemBoard,
            0x0A => EntityId::PowerSupply,
            0x1D => EntityId::Fan,
            0x20 => EntityId::MemoryDevice,
            other => EntityId::Other(other),
        }
    }
}

/// Static description of one sensor on a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub number: u8,
    pub name: String,
    pub sensor_type: SensorType,
    pub entity: EntityId,
}

/// Selects sensors by type and entity.  An empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorFilter {
    pub types: Vec<SensorType>,
    pub entities: Vec<EntityId>,
}

impl SensorFilter {
    pub fn matches(&self, sensor: &SensorDescriptor) -> bool {
        (self.types.is_empty() || self.types.contains(&sensor.sensor_type))
            && (self.entities.is_empty() || self.entities.contains(&sensor.entity))
    }
}

/// One sensor reading, joined with the descriptor it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub sensor: SensorDescriptor,
    /// Raw (unconverted) reading byte.
    pub raw_reading: u8,
    /// `false` when the controller flagged the reading as unavailable.
    pub available: bool,
}

/// A management-LAN network controller reported by the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetController {
    pub channel: u8,
    pub mac_address: [u8; 6],
}

impl EthernetController {
    /// MAC address in the usual colon-separated lowercase hex form.
    pub fn mac_string(&self) -> String {
        self.mac_address
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Options for the chassis identification (blink) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChassisIdentifyOptions {
    /// `false` turns identification off regardless of the other fields.
    pub identify: bool,
    /// Blink duration in seconds; ignored when `force_on` is set.
    pub interval_secs: u8,
    /// Keep the identify light on until explicitly turned off.
    pub force_on: bool,
}

impl Default for ChassisIdentifyOptions {
    fn default() -> Self {
        Self {
            identify: true,
            interval_secs: 15,
            force_on: false,
        }
    }
}
