//! RMCP / RMCP+ session framing and the session-establishment messages.
//!
//! # Layers (for beginners)
//!
//! A UDP datagram sent to a management controller is nested three deep:
//!
//! ```text
//! ┌ RMCP header ──────── 06 00 FF 07 ──────────────────────────────┐
//! │ ┌ session header ─── v1.5 or v2.0 (RMCP+) ─────────────────────┐│
//! │ │ ┌ payload ──────── LAN message, or Open Session / RAKP ─────┐││
//! │ │ └───────────────────────────────────────────────────────────┘││
//! │ └──────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Before a session exists the console speaks version 1.5 with
//! authentication type "none" (used for Get Channel Authentication
//! Capabilities and Get Channel Cipher Suites).  A version 2.0 session is then
//! established with four messages:
//!
//! 1. Open Session Request / Response – agree on the cipher suite and
//!    exchange session IDs.
//! 2. RAKP 1 / RAKP 2 – the console names the user and requested role; the
//!    controller answers with its random number and GUID.
//! 3. RAKP 3 / RAKP 4 – the console proves knowledge of the key; the
//!    controller confirms and the session becomes active.
//!
//! Only unauthenticated, unencrypted payloads are framed here; the
//! authentication-code fields are carried as opaque bytes.

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{AuthenticationType, CipherSuite, PrivilegeLevel};

/// RMCP header: version 6, reserved, no-ack sequence, class IPMI.
pub const RMCP_HEADER: [u8; 4] = [0x06, 0x00, 0xFF, 0x07];

const PAYLOAD_ENCRYPTED: u8 = 0x80;
const PAYLOAD_AUTHENTICATED: u8 = 0x40;

/// RMCP+ payload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Ipmi = 0x00,
    OpenSessionRequest = 0x10,
    OpenSessionResponse = 0x11,
    Rakp1 = 0x12,
    Rakp2 = 0x13,
    Rakp3 = 0x14,
    Rakp4 = 0x15,
}

impl TryFrom<u8> for PayloadType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x3F {
            0x00 => Ok(PayloadType::Ipmi),
            0x10 => Ok(PayloadType::OpenSessionRequest),
            0x11 => Ok(PayloadType::OpenSessionResponse),
            0x12 => Ok(PayloadType::Rakp1),
            0x13 => Ok(PayloadType::Rakp2),
            0x14 => Ok(PayloadType::Rakp3),
            0x15 => Ok(PayloadType::Rakp4),
            other => Err(ProtocolError::UnknownPayloadType(other)),
        }
    }
}

// ── Session packet ────────────────────────────────────────────────────────────

/// Session header variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHeader {
    /// Version 1.5, authentication type "none".
    V15 { session_id: u32, sequence: u32 },
    /// Version 2.0 (RMCP+), unauthenticated and unencrypted.
    V20 {
        payload_type: PayloadType,
        session_id: u32,
        sequence: u32,
    },
}

/// One RMCP datagram: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPacket {
    pub header: SessionHeader,
    pub payload: Vec<u8>,
}

impl SessionPacket {
    /// Pre-session version 1.5 packet (session id and sequence zero).
    pub fn pre_session(payload: Vec<u8>) -> Self {
        Self {
            header: SessionHeader::V15 {
                session_id: 0,
                sequence: 0,
            },
            payload,
        }
    }

    pub fn v20(payload_type: PayloadType, session_id: u32, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            header: SessionHeader::V20 {
                payload_type,
                session_id,
                sequence,
            },
            payload,
        }
    }

    /// Serializes the packet including the RMCP header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when the payload does not fit the
    /// header's length field.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(16 + self.payload.len());
        buf.extend_from_slice(&RMCP_HEADER);
        match self.header {
            SessionHeader::V15 {
                session_id,
                sequence,
            } => {
                let len = u8::try_from(self.payload.len()).map_err(|_| {
                    ProtocolError::Malformed(format!(
                        "v1.5 payload of {} bytes exceeds 255",
                        self.payload.len()
                    ))
                })?;
                buf.push(AuthenticationType::None as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.push(len);
            }
            SessionHeader::V20 {
                payload_type,
                session_id,
                sequence,
            } => {
                let len = u16::try_from(self.payload.len()).map_err(|_| {
                    ProtocolError::Malformed(format!(
                        "v2.0 payload of {} bytes exceeds 65535",
                        self.payload.len()
                    ))
                })?;
                buf.push(AuthenticationType::RmcpPlus as u8);
                buf.push(payload_type as u8);
                buf.extend_from_slice(&session_id.to_le_bytes());
                buf.extend_from_slice(&sequence.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parses one datagram.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::BadRmcpHeader`] when the RMCP header is wrong.
    /// - [`ProtocolError::Malformed`] for authenticated or encrypted
    ///   payloads, which this framing does not carry.
    /// - [`ProtocolError::InsufficientData`] when the datagram is shorter
    ///   than its header claims.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 5)?;
        if bytes[0..4] != RMCP_HEADER {
            return Err(ProtocolError::BadRmcpHeader);
        }
        let auth = AuthenticationType::try_from(bytes[4])?;
        match auth {
            AuthenticationType::None => {
                require(bytes, 14)?;
                let sequence = read_u32_le(bytes, 5);
                let session_id = read_u32_le(bytes, 9);
                let len = bytes[13] as usize;
                require(bytes, 14 + len)?;
                Ok(Self {
                    header: SessionHeader::V15 {
                        session_id,
                        sequence,
                    },
                    payload: bytes[14..14 + len].to_vec(),
                })
            }
            AuthenticationType::RmcpPlus => {
                require(bytes, 16)?;
                let raw_type = bytes[5];
                if raw_type & (PAYLOAD_ENCRYPTED | PAYLOAD_AUTHENTICATED) != 0 {
                    return Err(ProtocolError::Malformed(
                        "authenticated or encrypted payloads are not supported".into(),
                    ));
                }
                let payload_type = PayloadType::try_from(raw_type)?;
                let session_id = read_u32_le(bytes, 6);
                let sequence = read_u32_le(bytes, 10);
                let len = u16::from_le_bytes([bytes[14], bytes[15]]) as usize;
                require(bytes, 16 + len)?;
                Ok(Self {
                    header: SessionHeader::V20 {
                        payload_type,
                        session_id,
                        sequence,
                    },
                    payload: bytes[16..16 + len].to_vec(),
                })
            }
            other => Err(ProtocolError::Malformed(format!(
                "authentication type {other:?} is not supported"
            ))),
        }
    }

    /// Payload type of a version 2.0 packet; v1.5 packets always carry LAN messages.
    pub fn payload_type(&self) -> PayloadType {
        match self.header {
            SessionHeader::V15 { .. } => PayloadType::Ipmi,
            SessionHeader::V20 { payload_type, .. } => payload_type,
        }
    }

    /// Session id carried in the header; zero outside a session.
    pub fn session_id(&self) -> u32 {
        match self.header {
            SessionHeader::V15 { session_id, .. } | SessionHeader::V20 { session_id, .. } => session_id,
        }
    }
}

// ── Open Session ──────────────────────────────────────────────────────────────

/// Open Session Request (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionRequest {
    pub message_tag: u8,
    /// Maximum privilege requested for the session.
    pub privilege: PrivilegeLevel,
    pub console_session_id: u32,
    pub suite: CipherSuite,
}

impl OpenSessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(self.message_tag);
        buf.push(self.privilege as u8);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&self.console_session_id.to_le_bytes());
        push_algorithm(&mut buf, 0x00, self.suite.authentication);
        push_algorithm(&mut buf, 0x01, self.suite.integrity);
        push_algorithm(&mut buf, 0x02, self.suite.confidentiality);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 32)?;
        Ok(Self {
            message_tag: bytes[0],
            privilege: PrivilegeLevel::try_from(bytes[1])?,
            console_session_id: read_u32_le(bytes, 4),
            suite: CipherSuite {
                id: 0,
                authentication: bytes[12] & 0x3F,
                integrity: bytes[20] & 0x3F,
                confidentiality: bytes[28] & 0x3F,
            },
        })
    }
}

/// Open Session Response.  Only the first 8 bytes are present when
/// `status != 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionResponse {
    pub message_tag: u8,
    pub status: u8,
    pub console_session_id: u32,
    pub managed_session_id: u32,
    pub suite: CipherSuite,
}

impl OpenSessionResponse {
    pub fn encode(&self, privilege: PrivilegeLevel) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        buf.push(self.message_tag);
        buf.push(self.status);
        buf.push(privilege as u8);
        buf.push(0x00);
        buf.extend_from_slice(&self.console_session_id.to_le_bytes());
        if self.status != 0 {
            return buf;
        }
        buf.extend_from_slice(&self.managed_session_id.to_le_bytes());
        push_algorithm(&mut buf, 0x00, self.suite.authentication);
        push_algorithm(&mut buf, 0x01, self.suite.integrity);
        push_algorithm(&mut buf, 0x02, self.suite.confidentiality);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 8)?;
        let status = bytes[1];
        if status != 0 {
            return Ok(Self {
                message_tag: bytes[0],
                status,
                console_session_id: read_u32_le(bytes, 4),
                managed_session_id: 0,
                suite: CipherSuite::NONE,
            });
        }
        require(bytes, 36)?;
        Ok(Self {
            message_tag: bytes[0],
            status,
            console_session_id: read_u32_le(bytes, 4),
            managed_session_id: read_u32_le(bytes, 8),
            suite: CipherSuite {
                id: 0,
                authentication: bytes[16] & 0x3F,
                integrity: bytes[24] & 0x3F,
                confidentiality: bytes[32] & 0x3F,
            },
        })
    }
}

// ── RAKP ──────────────────────────────────────────────────────────────────────

/// Maximum user name length accepted in RAKP 1.
pub const MAX_USERNAME_LEN: usize = 16;

/// Role bit 4: look the user up by name only.
const NAME_ONLY_LOOKUP: u8 = 0x10;

/// RAKP Message 1 (console → controller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rakp1 {
    pub message_tag: u8,
    pub managed_session_id: u32,
    pub console_random: [u8; 16],
    pub privilege: PrivilegeLevel,
    pub username: String,
}

impl Rakp1 {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.username.as_bytes();
        if name.len() > MAX_USERNAME_LEN {
            return Err(ProtocolError::Malformed(format!(
                "user name of {} bytes exceeds {MAX_USERNAME_LEN}",
                name.len()
            )));
        }
        let mut buf = Vec::with_capacity(28 + name.len());
        buf.push(self.message_tag);
        buf.extend_from_slice(&[0x00, 0x00, 0x00]);
        buf.extend_from_slice(&self.managed_session_id.to_le_bytes());
        buf.extend_from_slice(&self.console_random);
        buf.push(self.privilege as u8 | NAME_ONLY_LOOKUP);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 28)?;
        let len = bytes[27] as usize;
        require(bytes, 28 + len)?;
        let username = std::str::from_utf8(&bytes[28..28 + len])
            .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8 user name: {e}")))?
            .to_string();
        let mut console_random = [0u8; 16];
        console_random.copy_from_slice(&bytes[8..24]);
        Ok(Self {
            message_tag: bytes[0],
            managed_session_id: read_u32_le(bytes, 4),
            console_random,
            privilege: PrivilegeLevel::try_from(bytes[24])?,
            username,
        })
    }
}

/// RAKP Message 2 (controller → console).  Only tag and status are present
/// when `status != 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rakp2 {
    pub message_tag: u8,
    pub status: u8,
    pub console_session_id: u32,
    pub managed_random: [u8; 16],
    pub managed_guid: [u8; 16],
    /// Key exchange authentication code; empty for authentication "none".
    pub auth_code: Vec<u8>,
}

impl Rakp2 {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40 + self.auth_code.len());
        buf.push(self.message_tag);
        buf.push(self.status);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&self.console_session_id.to_le_bytes());
        if self.status != 0 {
            return buf;
        }
        buf.extend_from_slice(&self.managed_random);
        buf.extend_from_slice(&self.managed_guid);
        buf.extend_from_slice(&self.auth_code);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 2)?;
        let status = bytes[1];
        if status != 0 {
            return Ok(Self {
                message_tag: bytes[0],
                status,
                console_session_id: if bytes.len() >= 8 { read_u32_le(bytes, 4) } else { 0 },
                managed_random: [0; 16],
                managed_guid: [0; 16],
                auth_code: Vec::new(),
            });
        }
        require(bytes, 40)?;
        let mut managed_random = [0u8; 16];
        managed_random.copy_from_slice(&bytes[8..24]);
        let mut managed_guid = [0u8; 16];
        managed_guid.copy_from_slice(&bytes[24..40]);
        Ok(Self {
            message_tag: bytes[0],
            status,
            console_session_id: read_u32_le(bytes, 4),
            managed_random,
            managed_guid,
            auth_code: bytes[40..].to_vec(),
        })
    }
}

/// RAKP Message 3 (console → controller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rakp3 {
    pub message_tag: u8,
    pub status: u8,
    pub managed_session_id: u32,
    pub auth_code: Vec<u8>,
}

impl Rakp3 {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.auth_code.len());
        buf.push(self.message_tag);
        buf.push(self.status);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&self.managed_session_id.to_le_bytes());
        buf.extend_from_slice(&self.auth_code);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 8)?;
        Ok(Self {
            message_tag: bytes[0],
            status: bytes[1],
            managed_session_id: read_u32_le(bytes, 4),
            auth_code: bytes[8..].to_vec(),
        })
    }
}

/// RAKP Message 4 (controller → console).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rakp4 {
    pub message_tag: u8,
    pub status: u8,
    pub console_session_id: u32,
    pub integrity_check: Vec<u8>,
}

impl Rakp4 {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.integrity_check.len());
        buf.push(self.message_tag);
        buf.push(self.status);
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(&self.console_session_id.to_le_bytes());
        buf.extend_from_slice(&self.integrity_check);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        require(bytes, 2)?;
        let status = bytes[1];
        if status != 0 && bytes.len() < 8 {
            return Ok(Self {
                message_tag: bytes[0],
                status,
                console_session_id: 0,
                integrity_check: Vec::new(),
            });
        }
        require(bytes, 8)?;
        Ok(Self {
            message_tag: bytes[0],
            status,
            console_session_id: read_u32_le(bytes, 4),
            integrity_check: bytes[8..].to_vec(),
        })
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Appends one 8-byte algorithm payload: type, 2 reserved, length 8, algorithm, 3 reserved.
fn push_algorithm(buf: &mut Vec<u8>, payload_type: u8, algorithm: u8) {
    buf.extend_from_slice(&[payload_type, 0x00, 0x00, 0x08, algorithm & 0x3F, 0x00, 0x00, 0x00]);
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn require(bytes: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if bytes.len() < needed {
        Err(ProtocolError::InsufficientData {
            needed,
            available: bytes.len(),
        })
    } else {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
