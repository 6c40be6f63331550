//! Typed commands and responses for the management-controller command family.
//!
//! A [`Command`] is an immutable value object naming one wire exchange: the
//! network function (command category), the opcode, and the request data.
//! [`Command::parse_response`] turns the matching [`LanResponse`] into a typed
//! [`ResponseData`] after checking that the response really belongs to this
//! command and that its completion code reports success.
//!
//! Response fields are read at fixed offsets from the data that follows the
//! completion code; the offsets are documented on each response struct.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Slave address of the baseboard management controller.
pub const BMC_SLAVE_ADDRESS: u8 = 0x20;

/// Software ID used by remote consoles as the requester address.
pub const REMOTE_CONSOLE_ADDRESS: u8 = 0x81;

/// Sequence numbers occupy six bits, so they wrap modulo 64.
pub const SEQUENCE_MODULUS: u8 = 64;

/// Well-known UDP port of the management controller.
pub const DEFAULT_PORT: u16 = 623;

/// Parameter selector for the boot flags in Get/Set System Boot Options.
pub const BOOT_FLAGS_PARAMETER: u8 = 5;

/// Parameter selector for the MAC address in Get LAN Configuration Parameters.
pub const MAC_ADDRESS_PARAMETER: u8 = 5;

/// Cipher-suite records are returned in pages of at most this many bytes.
pub const CIPHER_SUITE_PAGE_SIZE: usize = 16;

// ── Versions, authentication and privilege ────────────────────────────────────

/// Protocol version a command is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpmiVersion {
    V15,
    V20,
}

/// Session authentication type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AuthenticationType {
    None = 0x00,
    Md2 = 0x01,
    Md5 = 0x02,
    Password = 0x04,
    Oem = 0x05,
    /// The enhanced (RMCP+) format; required for version 2.0 sessions.
    RmcpPlus = 0x06,
}

impl TryFrom<u8> for AuthenticationType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AuthenticationType::None),
            0x01 => Ok(AuthenticationType::Md2),
            0x02 => Ok(AuthenticationType::Md5),
            0x04 => Ok(AuthenticationType::Password),
            0x05 => Ok(AuthenticationType::Oem),
            0x06 => Ok(AuthenticationType::RmcpPlus),
            other => Err(ProtocolError::Malformed(format!(
                "unknown authentication type 0x{other:02X}"
            ))),
        }
    }
}

/// Session privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivilegeLevel {
    Callback = 0x01,
    User = 0x02,
    Operator = 0x03,
    Administrator = 0x04,
}

impl TryFrom<u8> for PrivilegeLevel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x0F {
            0x01 => Ok(PrivilegeLevel::Callback),
            0x02 => Ok(PrivilegeLevel::User),
            0x03 => Ok(PrivilegeLevel::Operator),
            0x04 => Ok(PrivilegeLevel::Administrator),
            other => Err(ProtocolError::Malformed(format!(
                "unknown privilege level 0x{other:02X}"
            ))),
        }
    }
}

// ── Network functions ─────────────────────────────────────────────────────────

/// Command category.  Requests use the even code, responses the odd one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkFunction {
    Chassis = 0x00,
    SensorEvent = 0x04,
    Application = 0x06,
    Storage = 0x0A,
    Transport = 0x0C,
}

impl NetworkFunction {
    pub fn request_code(self) -> u8 {
        self as u8
    }

    pub fn response_code(self) -> u8 {
        self as u8 + 1
    }

    /// Maps an even request code back to its network function.
    pub fn from_request_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(NetworkFunction::Chassis),
            0x04 => Some(NetworkFunction::SensorEvent),
            0x06 => Some(NetworkFunction::Application),
            0x0A => Some(NetworkFunction::Storage),
            0x0C => Some(NetworkFunction::Transport),
            _ => None,
        }
    }
}

// ── Completion codes ──────────────────────────────────────────────────────────

/// Per-command status byte returned ahead of the response data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionCode {
    Ok,
    NodeBusy,
    InvalidCommand,
    Timeout,
    RequestDataLengthInvalid,
    ParameterOutOfRange,
    BmcInitializing,
    InsufficientPrivilege,
    NotSupportedInPresentState,
    Unspecified,
    Other(u8),
}

impl CompletionCode {
    pub fn code(self) -> u8 {
        match self {
            CompletionCode::Ok => 0x00,
            CompletionCode::NodeBusy => 0xC0,
            CompletionCode::InvalidCommand => 0xC1,
            CompletionCode::Timeout => 0xC3,
            CompletionCode::RequestDataLengthInvalid => 0xC7,
            CompletionCode::ParameterOutOfRange => 0xC9,
            CompletionCode::BmcInitializing => 0xD2,
            CompletionCode::InsufficientPrivilege => 0xD4,
            CompletionCode::NotSupportedInPresentState => 0xD5,
            CompletionCode::Unspecified => 0xFF,
            CompletionCode::Other(code) => code,
        }
    }

    /// Codes meaning "try again later" rather than "this will never work".
    pub fn is_busy(self) -> bool {
        matches!(self, CompletionCode::NodeBusy | CompletionCode::BmcInitializing)
    }
}

impl From<u8> for CompletionCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => CompletionCode::Ok,
            0xC0 => CompletionCode::NodeBusy,
            0xC1 => CompletionCode::InvalidCommand,
            0xC3 => CompletionCode::Timeout,
            0xC7 => CompletionCode::RequestDataLengthInvalid,
            0xC9 => CompletionCode::ParameterOutOfRange,
            0xD2 => CompletionCode::BmcInitializing,
            0xD4 => CompletionCode::InsufficientPrivilege,
            0xD5 => CompletionCode::NotSupportedInPresentState,
            0xFF => CompletionCode::Unspecified,
            other => CompletionCode::Other(other),
        }
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

// ── Command parameters ────────────────────────────────────────────────────────

/// Chassis control sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PowerAction {
    PowerDown = 0x00,
    PowerUp = 0x01,
    PowerCycle = 0x02,
    HardReset = 0x03,
    SoftShutdown = 0x05,
}

/// One cipher suite advertised by a channel.
///
/// Algorithm numbers: authentication 0 = none, 1 = HMAC-SHA1, 2 = HMAC-MD5;
/// integrity 0 = none; confidentiality 0 = none, 1 = AES-CBC-128.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherSuite {
    pub id: u8,
    pub authentication: u8,
    pub integrity: u8,
    pub confidentiality: u8,
}

impl CipherSuite {
    /// Suite 0: no authentication, integrity or confidentiality.
    pub const NONE: CipherSuite = CipherSuite {
        id: 0,
        authentication: 0,
        integrity: 0,
        confidentiality: 0,
    };

    /// `true` when every algorithm is "none".
    pub fn is_unauthenticated(&self) -> bool {
        self.authentication == 0 && self.integrity == 0 && self.confidentiality == 0
    }
}

/// Boot device selector (boot flags data byte 2, bits 5:2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootDevice {
    NoOverride,
    Pxe,
    Disk,
    DiskSafeMode,
    Diagnostic,
    Cdrom,
    BiosSetup,
    Floppy,
    Other(u8),
}

impl BootDevice {
    pub fn selector(self) -> u8 {
        match self {
            BootDevice::NoOverride => 0x0,
            BootDevice::Pxe => 0x1,
            BootDevice::Disk => 0x2,
            BootDevice::DiskSafeMode => 0x3,
            BootDevice::Diagnostic => 0x4,
            BootDevice::Cdrom => 0x5,
            BootDevice::BiosSetup => 0x6,
            BootDevice::Floppy => 0xF,
            BootDevice::Other(v) => v & 0x0F,
        }
    }

    pub fn from_selector(selector: u8) -> Self {
        match selector & 0x0F {
            0x0 => BootDevice::NoOverride,
            0x1 => BootDevice::Pxe,
            0x2 => BootDevice::Disk,
            0x3 => BootDevice::DiskSafeMode,
            0x4 => BootDevice::Diagnostic,
            0x5 => BootDevice::Cdrom,
            0x6 => BootDevice::BiosSetup,
            0xF => BootDevice::Floppy,
            other => BootDevice::Other(other),
        }
    }
}

/// The boot flags parameter (selector 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootOptions {
    /// Flags are only honoured by the BIOS when this bit is set.
    pub valid: bool,
    /// Apply to all future boots instead of the next one only.
    pub persistent: bool,
    /// Boot in EFI mode instead of legacy mode.
    pub efi: bool,
    pub device: BootDevice,
}

impl BootOptions {
    fn encode(&self) -> [u8; 5] {
        let mut flags1 = 0u8;
        if self.valid {
            flags1 |= 0x80;
        }
        if self.persistent {
            flags1 |= 0x40;
        }
        if self.efi {
            flags1 |= 0x20;
        }
        [flags1, self.device.selector() << 2, 0x00, 0x00, 0x00]
    }

    fn decode(flags1: u8, flags2: u8) -> Self {
        Self {
            valid: flags1 & 0x80 != 0,
            persistent: flags1 & 0x40 != 0,
            efi: flags1 & 0x20 != 0,
            device: BootDevice::from_selector((flags2 >> 2) & 0x0F),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Every command the manager issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    GetChassisStatus,
    ChassisControl(PowerAction),
    ChassisIdentify { interval_secs: u8, force_on: bool },
    GetSystemBootOptions,
    SetSystemBootOptions(BootOptions),
    GetDeviceId,
    ColdReset,
    GetSelfTestResults,
    GetAcpiPowerState,
    GetChannelAuthCapabilities { privilege: PrivilegeLevel },
    GetChannelCipherSuites { list_index: u8 },
    SetSessionPrivilegeLevel(PrivilegeLevel),
    CloseSession { session_id: u32 },
    GetSelInfo,
    GetSensorReading { sensor_number: u8 },
    GetLanMacAddress { channel: u8 },
}

/// Channel number meaning "the channel this request arrived on".
const CURRENT_CHANNEL: u8 = 0x0E;

impl CommandKind {
    pub fn network_function(&self) -> NetworkFunction {
        match self {
            CommandKind::GetChassisStatus
            | CommandKind::ChassisControl(_)
            | CommandKind::ChassisIdentify { .. }
            | CommandKind::GetSystemBootOptions
            | CommandKind::SetSystemBootOptions(_) => NetworkFunction::Chassis,
            CommandKind::GetDeviceId
            | CommandKind::ColdReset
            | CommandKind::GetSelfTestResults
            | CommandKind::GetAcpiPowerState
            | CommandKind::GetChannelAuthCapabilities { .. }
            | CommandKind::GetChannelCipherSuites { .. }
            | CommandKind::SetSessionPrivilegeLevel(_)
            | CommandKind::CloseSession { .. } => NetworkFunction::Application,
            CommandKind::GetSelInfo => NetworkFunction::Storage,
            CommandKind::GetSensorReading { .. } => NetworkFunction::SensorEvent,
            CommandKind::GetLanMacAddress { .. } => NetworkFunction::Transport,
        }
    }

    /// Opcode within the network function.
    pub fn code(&self) -> u8 {
        match self {
            CommandKind::GetChassisStatus => 0x01,
            CommandKind::ChassisControl(_) => 0x02,
            CommandKind::ChassisIdentify { .. } => 0x04,
            CommandKind::SetSystemBootOptions(_) => 0x08,
            CommandKind::GetSystemBootOptions => 0x09,
            CommandKind::GetDeviceId => 0x01,
            CommandKind::ColdReset => 0x02,
            CommandKind::GetSelfTestResults => 0x04,
            CommandKind::GetAcpiPowerState => 0x07,
            CommandKind::GetChannelAuthCapabilities { .. } => 0x38,
            CommandKind::SetSessionPrivilegeLevel(_) => 0x3B,
            CommandKind::CloseSession { .. } => 0x3C,
            CommandKind::GetChannelCipherSuites { .. } => 0x54,
            CommandKind::GetSelInfo => 0x40,
            CommandKind::GetSensorReading { .. } => 0x2D,
            CommandKind::GetLanMacAddress { .. } => 0x02,
        }
    }

    /// Human-readable command name, carried by completion-code errors.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::GetChassisStatus => "Get Chassis Status",
            CommandKind::ChassisControl(_) => "Chassis Control",
            CommandKind::ChassisIdentify { .. } => "Chassis Identify",
            CommandKind::GetSystemBootOptions => "Get System Boot Options",
            CommandKind::SetSystemBootOptions(_) => "Set System Boot Options",
            CommandKind::GetDeviceId => "Get Device ID",
            CommandKind::ColdReset => "Cold Reset",
            CommandKind::GetSelfTestResults => "Get Self Test Results",
            CommandKind::GetAcpiPowerState => "Get ACPI Power State",
            CommandKind::GetChannelAuthCapabilities { .. } => {
                "Get Channel Authentication Capabilities"
            }
            CommandKind::GetChannelCipherSuites { .. } => "Get Channel Cipher Suites",
            CommandKind::SetSessionPrivilegeLevel(_) => "Set Session Privilege Level",
            CommandKind::CloseSession { .. } => "Close Session",
            CommandKind::GetSelInfo => "Get SEL Info",
            CommandKind::GetSensorReading { .. } => "Get Sensor Reading",
            CommandKind::GetLanMacAddress { .. } => "Get LAN Configuration Parameters",
        }
    }

    /// Request data bytes following the opcode.
    pub fn request_data(&self) -> Vec<u8> {
        match self {
            CommandKind::ChassisControl(action) => vec![*action as u8],
            CommandKind::ChassisIdentify {
                interval_secs,
                force_on,
            } => vec![*interval_secs, u8::from(*force_on)],
            CommandKind::GetSystemBootOptions => vec![BOOT_FLAGS_PARAMETER, 0x00, 0x00],
            CommandKind::SetSystemBootOptions(options) => {
                let mut data = vec![BOOT_FLAGS_PARAMETER];
                data.extend_from_slice(&options.encode());
                data
            }
            // Bit 7 asks for the version 2.0 extended capabilities.
            CommandKind::GetChannelAuthCapabilities { privilege } => {
                vec![0x80 | CURRENT_CHANNEL, *privilege as u8]
            }
            // Payload type 0 (IPMI); bit 7 lists algorithms by cipher suite.
            CommandKind::GetChannelCipherSuites { list_index } => {
                vec![CURRENT_CHANNEL, 0x00, 0x80 | (list_index & 0x3F)]
            }
            CommandKind::SetSessionPrivilegeLevel(level) => vec![*level as u8],
            CommandKind::CloseSession { session_id } => session_id.to_le_bytes().to_vec(),
            CommandKind::GetSensorReading { sensor_number } => vec![*sensor_number],
            CommandKind::GetLanMacAddress { channel } => {
                vec![*channel & 0x0F, MAC_ADDRESS_PARAMETER, 0x00, 0x00]
            }
            CommandKind::GetChassisStatus
            | CommandKind::GetDeviceId
            | CommandKind::ColdReset
            | CommandKind::GetSelfTestResults
            | CommandKind::GetAcpiPowerState
            | CommandKind::GetSelInfo => Vec::new(),
        }
    }
}

/// One validated command, ready for encoding.
///
/// Construction fails fast with [`ProtocolError::IncompatibleAuthentication`]
/// when a version 2.0 command is paired with anything other than the
/// enhanced authentication type, so no I/O is ever attempted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    version: IpmiVersion,
    authentication: AuthenticationType,
    kind: CommandKind,
}

impl Command {
    pub fn new(
        version: IpmiVersion,
        authentication: AuthenticationType,
        kind: CommandKind,
    ) -> Result<Self, ProtocolError> {
        if version == IpmiVersion::V20 && authentication != AuthenticationType::RmcpPlus {
            return Err(ProtocolError::IncompatibleAuthentication {
                version,
                authentication,
            });
        }
        Ok(Self {
            version,
            authentication,
            kind,
        })
    }

    pub fn version(&self) -> IpmiVersion {
        self.version
    }

    pub fn authentication(&self) -> AuthenticationType {
        self.authentication
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Validates `response` against this command and extracts its fields.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedResponse`] when the network function or
    ///   opcode does not belong to this command.
    /// - [`ProtocolError::Completion`] carrying the code when it is not `Ok`.
    /// - [`ProtocolError::InsufficientData`] / [`ProtocolError::Malformed`]
    ///   when the data is too short or structurally wrong.
    pub fn parse_response(&self, response: &LanResponse) -> Result<ResponseData, ProtocolError> {
        let netfn = self.kind.network_function();
        if response.network_function != netfn || response.command != self.kind.code() {
            return Err(ProtocolError::UnexpectedResponse {
                expected: (netfn.response_code(), self.kind.code()),
                actual: (response.network_function.response_code(), response.command),
            });
        }
        if response.completion_code != CompletionCode::Ok {
            return Err(ProtocolError::Completion {
                command: self.kind.name(),
                code: response.completion_code,
            });
        }

        let d = response.data.as_slice();
        let parsed = match &self.kind {
            CommandKind::GetChassisStatus => {
                require(d, 3)?;
                ResponseData::ChassisStatus(ChassisStatus {
                    power_on: d[0] & 0x01 != 0,
                    power_overload: d[0] & 0x02 != 0,
                    interlock: d[0] & 0x04 != 0,
                    power_fault: d[0] & 0x08 != 0,
                    restore_policy: (d[0] >> 5) & 0x03,
                    last_power_event: d[1],
                    misc_state: d[2],
                })
            }
            CommandKind::GetAcpiPowerState => {
                require(d, 2)?;
                ResponseData::AcpiPowerState(AcpiPowerState {
                    system_state: d[0],
                    device_state: d[1],
                })
            }
            CommandKind::GetSelfTestResults => {
                require(d, 2)?;
                ResponseData::SelfTest(SelfTestResult {
                    code: d[0],
                    detail: d[1],
                })
            }
            CommandKind::GetDeviceId => {
                require(d, 11)?;
                ResponseData::DeviceId(DeviceId {
                    device_id: d[0],
                    device_revision: d[1] & 0x0F,
                    firmware_major: d[2] & 0x7F,
                    firmware_minor: d[3],
                    ipmi_version: d[4],
                    manufacturer_id: u32::from_le_bytes([d[6], d[7], d[8], 0]),
                    product_id: u16::from_le_bytes([d[9], d[10]]),
                })
            }
            CommandKind::GetChannelAuthCapabilities { .. } => {
                require(d, 8)?;
                ResponseData::ChannelAuthCapabilities(ChannelAuthCapabilities {
                    channel: d[0],
                    auth_type_support: d[1] & 0x3F,
                    ipmi_v20: d[1] & 0x80 != 0 && d[3] & 0x02 != 0,
                })
            }
            CommandKind::GetChannelCipherSuites { .. } => {
                require(d, 1)?;
                ResponseData::CipherSuiteData {
                    channel: d[0],
                    records: d[1..].to_vec(),
                }
            }
            CommandKind::GetSystemBootOptions => {
                require(d, 4)?;
                if d[1] & 0x7F != BOOT_FLAGS_PARAMETER {
                    return Err(ProtocolError::Malformed(format!(
                        "boot options answered parameter {} instead of {}",
                        d[1] & 0x7F,
                        BOOT_FLAGS_PARAMETER
                    )));
                }
                ResponseData::BootOptions(BootOptions::decode(d[2], d[3]))
            }
            CommandKind::GetSelInfo => {
                require(d, 14)?;
                ResponseData::SelInfo(SelInfo {
                    version: d[0],
                    entries: u16::from_le_bytes([d[1], d[2]]),
                    free_bytes: u16::from_le_bytes([d[3], d[4]]),
                    last_addition: u32::from_le_bytes([d[5], d[6], d[7], d[8]]),
                    last_erase: u32::from_le_bytes([d[9], d[10], d[11], d[12]]),
                    operation_support: d[13],
                })
            }
            CommandKind::GetSensorReading { .. } => {
                require(d, 2)?;
                ResponseData::SensorReading(SensorReading {
                    raw: d[0],
                    scanning_enabled: d[1] & 0x40 != 0,
                    unavailable: d[1] & 0x20 != 0,
                })
            }
            CommandKind::GetLanMacAddress { .. } => {
                require(d, 7)?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&d[1..7]);
                ResponseData::MacAddress(mac)
            }
            CommandKind::SetSessionPrivilegeLevel(_) => {
                require(d, 1)?;
                ResponseData::Privilege(PrivilegeLevel::try_from(d[0])?)
            }
            CommandKind::ChassisControl(_)
            | CommandKind::ChassisIdentify { .. }
            | CommandKind::SetSystemBootOptions(_)
            | CommandKind::ColdReset
            | CommandKind::CloseSession { .. } => ResponseData::Acknowledged,
        };
        Ok(parsed)
    }
}

fn require(data: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if data.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A decoded LAN response frame, before command-specific parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanResponse {
    pub network_function: NetworkFunction,
    pub command: u8,
    pub sequence: u8,
    pub completion_code: CompletionCode,
    pub data: Vec<u8>,
}

/// A decoded LAN request frame, as seen by the controller side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanRequest {
    pub network_function: NetworkFunction,
    pub command: u8,
    pub sequence: u8,
    pub data: Vec<u8>,
}

/// Get Chassis Status: `[0]` current power state, `[1]` last power event,
/// `[2]` misc chassis state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChassisStatus {
    pub power_on: bool,
    pub power_overload: bool,
    pub interlock: bool,
    pub power_fault: bool,
    pub restore_policy: u8,
    pub last_power_event: u8,
    pub misc_state: u8,
}

/// Get ACPI Power State: `[0]` system state, `[1]` device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcpiPowerState {
    pub system_state: u8,
    pub device_state: u8,
}

/// Get Self Test Results: `[0]` result code, `[1]` detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfTestResult {
    pub code: u8,
    pub detail: u8,
}

impl SelfTestResult {
    /// 0x55 means "no error", 0x56 "self test not implemented".
    pub fn passed(&self) -> bool {
        self.code == 0x55 || self.code == 0x56
    }
}

/// Get Device ID, fixed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    pub device_id: u8,
    pub device_revision: u8,
    pub firmware_major: u8,
    /// BCD-encoded.
    pub firmware_minor: u8,
    /// BCD-encoded, e.g. 0x51 for 1.5 and 0x02 for 2.0.
    pub ipmi_version: u8,
    pub manufacturer_id: u32,
    pub product_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAuthCapabilities {
    pub channel: u8,
    pub auth_type_support: u8,
    /// Channel supports version 2.0 (RMCP+) sessions.
    pub ipmi_v20: bool,
}

/// Get SEL Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelInfo {
    pub version: u8,
    pub entries: u16,
    pub free_bytes: u16,
    pub last_addition: u32,
    pub last_erase: u32,
    pub operation_support: u8,
}

/// Get Sensor Reading: `[0]` raw reading, `[1]` status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub raw: u8,
    pub scanning_enabled: bool,
    pub unavailable: bool,
}

/// Typed result of [`Command::parse_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    ChassisStatus(ChassisStatus),
    AcpiPowerState(AcpiPowerState),
    SelfTest(SelfTestResult),
    DeviceId(DeviceId),
    ChannelAuthCapabilities(ChannelAuthCapabilities),
    /// One page of cipher-suite record data; see [`parse_cipher_suite_records`].
    CipherSuiteData { channel: u8, records: Vec<u8> },
    BootOptions(BootOptions),
    SelInfo(SelInfo),
    SensorReading(SensorReading),
    MacAddress([u8; 6]),
    Privilege(PrivilegeLevel),
    /// Command carries no response data beyond the completion code.
    Acknowledged,
}

// ── Cipher suite records ──────────────────────────────────────────────────────

const STANDARD_RECORD: u8 = 0xC0;
const OEM_RECORD: u8 = 0xC1;

/// Parses the concatenated record data of every Get Channel Cipher Suites page.
///
/// Each record starts with `0xC0 id` (standard) or `0xC1 id iana[3]` (OEM) and
/// is followed by algorithm bytes tagged in bits 7:6: `00` authentication,
/// `01` integrity, `10` confidentiality.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for a stray byte outside a record,
/// a truncated record, or a record with no authentication algorithm.
pub fn parse_cipher_suite_records(data: &[u8]) -> Result<Vec<CipherSuite>, ProtocolError> {
    let mut suites = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let start = data[i];
        if start != STANDARD_RECORD && start != OEM_RECORD {
            return Err(ProtocolError::Malformed(format!(
                "cipher suite record starts with 0x{start:02X} at offset {i}"
            )));
        }
        let header = if start == OEM_RECORD { 5 } else { 2 };
        if i + header > data.len() {
            return Err(ProtocolError::Malformed(format!(
                "truncated cipher suite record at offset {i}"
            )));
        }
        let id = data[i + 1];
        i += header;

        let mut authentication = None;
        let mut integrity = 0;
        let mut confidentiality = 0;
        while i < data.len() && data[i] >> 6 != 0b11 {
            let algorithm = data[i] & 0x3F;
            match data[i] >> 6 {
                0b00 => authentication = Some(algorithm),
                0b01 => integrity = algorithm,
                _ => confidentiality = algorithm,
            }
            i += 1;
        }

        let authentication = authentication.ok_or_else(|| {
            ProtocolError::Malformed(format!("cipher suite {id} has no authentication algorithm"))
        })?;
        suites.push(CipherSuite {
            id,
            authentication,
            integrity,
            confidentiality,
        });
    }
    Ok(suites)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn v20(kind: CommandKind) -> Command {
        Command::new(IpmiVersion::V20, AuthenticationType::RmcpPlus, kind).expect("valid command")
    }

    fn ok_response(kind: &CommandKind, data: &[u8]) -> LanResponse {
        LanResponse {
            network_function: kind.network_function(),
            command: kind.code(),
            sequence: 0,
            completion_code: CompletionCode::Ok,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_v20_command_with_non_enhanced_auth_fails_at_construction() {
        // Act
        let result = Command::new(
            IpmiVersion::V20,
            AuthenticationType::Md5,
            CommandKind::GetAcpiPowerState,
        );

        // Assert
        assert_eq!(
            result.unwrap_err(),
            ProtocolError::IncompatibleAuthentication {
                version: IpmiVersion::V20,
                authentication: AuthenticationType::Md5,
            }
        );
    }

    #[test]
    fn test_v15_command_accepts_any_auth_type() {
        assert!(Command::new(
            IpmiVersion::V15,
            AuthenticationType::None,
            CommandKind::GetChannelAuthCapabilities {
                privilege: PrivilegeLevel::Administrator
            },
        )
        .is_ok());
    }

    #[test]
    fn test_acpi_power_state_fields_match_raw_offsets() {
        // Arrange
        let cmd = v20(CommandKind::GetAcpiPowerState);
        let response = ok_response(cmd.kind(), &[0x05, 0x03]);

        // Act
        let parsed = cmd.parse_response(&response).expect("parse");

        // Assert
        assert_eq!(
            parsed,
            ResponseData::AcpiPowerState(AcpiPowerState {
                system_state: 0x05,
                device_state: 0x03,
            })
        );
    }

    #[test]
    fn test_non_success_completion_code_is_carried_in_error() {
        // Arrange
        let cmd = v20(CommandKind::GetAcpiPowerState);
        let mut response = ok_response(cmd.kind(), &[]);
        response.completion_code = CompletionCode::from(0xCC);

        // Act
        let err = cmd.parse_response(&response).unwrap_err();

        // Assert
        assert_eq!(err.completion_code(), Some(CompletionCode::Other(0xCC)));
        assert!(!err.is_busy());
    }

    #[test]
    fn test_response_for_other_command_is_rejected() {
        let cmd = v20(CommandKind::GetAcpiPowerState);
        let response = ok_response(&CommandKind::GetChassisStatus, &[0x01, 0x00, 0x00]);
        assert!(matches!(
            cmd.parse_response(&response),
            Err(ProtocolError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_short_response_is_an_error_not_a_partial_result() {
        let cmd = v20(CommandKind::GetAcpiPowerState);
        let response = ok_response(cmd.kind(), &[0x05]);
        assert_eq!(
            cmd.parse_response(&response).unwrap_err(),
            ProtocolError::InsufficientData {
                needed: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_chassis_status_power_bit() {
        let cmd = v20(CommandKind::GetChassisStatus);
        let parsed = cmd
            .parse_response(&ok_response(cmd.kind(), &[0x21, 0x10, 0x00]))
            .expect("parse");
        match parsed {
            ResponseData::ChassisStatus(status) => {
                assert!(status.power_on);
                assert!(!status.power_fault);
                assert_eq!(status.restore_policy, 1);
                assert_eq!(status.last_power_event, 0x10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_set_boot_options_request_layout() {
        // Arrange
        let kind = CommandKind::SetSystemBootOptions(BootOptions {
            valid: true,
            persistent: false,
            efi: true,
            device: BootDevice::Pxe,
        });

        // Act
        let data = kind.request_data();

        // Assert
        assert_eq!(data, vec![0x05, 0xA0, 0x04, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_boot_options_decode_rejects_wrong_parameter() {
        let cmd = v20(CommandKind::GetSystemBootOptions);
        let response = ok_response(cmd.kind(), &[0x01, 0x03, 0x80, 0x04, 0, 0, 0]);
        assert!(matches!(
            cmd.parse_response(&response),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_boot_options_decode() {
        let cmd = v20(CommandKind::GetSystemBootOptions);
        let response = ok_response(cmd.kind(), &[0x01, 0x05, 0xC0, 0x14, 0, 0, 0]);
        assert_eq!(
            cmd.parse_response(&response).expect("parse"),
            ResponseData::BootOptions(BootOptions {
                valid: true,
                persistent: true,
                efi: false,
                device: BootDevice::Cdrom,
            })
        );
    }

    #[test]
    fn test_sensor_reading_unavailable_flag() {
        let cmd = v20(CommandKind::GetSensorReading { sensor_number: 3 });
        let parsed = cmd
            .parse_response(&ok_response(cmd.kind(), &[0x2A, 0x60]))
            .expect("parse");
        assert_eq!(
            parsed,
            ResponseData::SensorReading(SensorReading {
                raw: 0x2A,
                scanning_enabled: true,
                unavailable: true,
            })
        );
    }

    #[test]
    fn test_parse_cipher_suite_records_standard_and_oem() {
        // Arrange – suite 0 (none/none/none), suite 3 (sha1/sha1-96/aes),
        // OEM suite 0x30 with IANA bytes.
        let data = [
            0xC0, 0x00, 0x00, 0x40, 0x80, //
            0xC0, 0x03, 0x01, 0x41, 0x81, //
            0xC1, 0x30, 0x57, 0x01, 0x00, 0x00,
        ];

        // Act
        let suites = parse_cipher_suite_records(&data).expect("parse");

        // Assert
        assert_eq!(suites.len(), 3);
        assert_eq!(suites[0], CipherSuite::NONE);
        assert_eq!(
            suites[1],
            CipherSuite {
                id: 3,
                authentication: 1,
                integrity: 1,
                confidentiality: 1
            }
        );
        assert_eq!(suites[2].id, 0x30);
    }

    #[test]
    fn test_parse_cipher_suite_records_rejects_stray_bytes() {
        assert!(matches!(
            parse_cipher_suite_records(&[0x00, 0xC0, 0x00, 0x00]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_cipher_suite_records(&[0xC0, 0x00, 0x40]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_busy_completion_codes() {
        assert!(CompletionCode::from(0xC0).is_busy());
        assert!(CompletionCode::from(0xD2).is_busy());
        assert!(!CompletionCode::from(0xC1).is_busy());
        assert_eq!(CompletionCode::from(0x42).code(), 0x42);
    }
}
