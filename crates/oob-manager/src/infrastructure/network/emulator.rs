//! In-process simulated management controller.
//!
//! [`SimulatedBmc`] answers the same datagrams a real controller does: the
//! pre-session capability queries, Open Session / RAKP 1-4, and every command
//! the board plugins issue.  It keeps just enough state (power, boot flags,
//! session) for the answers to be consistent.
//!
//! It is used two ways:
//!
//! - [`SimulatedBmc::handle`] as a pure datagram → datagrams function, for
//!   unit tests that wire it to a mocked transport;
//! - [`SimulatedBmc::bind`] as a UDP server on loopback, for end-to-end tests.
//!
//! Fault injection knobs: reject credentials, answer "node busy", stay
//! silent, or send a stale (wrong sequence) answer ahead of the real one.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use oob_core::protocol::session::{
    OpenSessionRequest, OpenSessionResponse, PayloadType, Rakp1, Rakp2, Rakp3, Rakp4, SessionHeader,
    SessionPacket,
};
use oob_core::protocol::{
    decode_request, encode_response, CompletionCode, LanRequest, NetworkFunction, ProtocolError,
    CIPHER_SUITE_PAGE_SIZE, SEQUENCE_MODULUS,
};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// RAKP status "unauthorized name".
const UNAUTHORIZED_NAME: u8 = 0x0D;
/// Open Session status "no cipher suite match with proposed security algorithms".
const NO_MATCHING_SUITE: u8 = 0x11;

/// Suite 0 (all "none") followed by suite 3 (HMAC-SHA1, HMAC-SHA1-96, AES-CBC-128).
const ADVERTISED_SUITES: [u8; 10] = [0xC0, 0x00, 0x00, 0x40, 0x80, 0xC0, 0x03, 0x01, 0x41, 0x81];

#[derive(Debug)]
struct BmcState {
    powered: bool,
    boot_flags: [u8; 2],
    console_session_id: u32,
    managed_session_id: Option<u32>,
    next_session_id: u32,
    session_open: bool,
    reject_credentials: bool,
    busy_replies: u32,
    silent_replies: u32,
    stale_first: bool,
    commands: Vec<(NetworkFunction, u8)>,
}

/// A scriptable management controller emulator.
#[derive(Debug)]
pub struct SimulatedBmc {
    state: Mutex<BmcState>,
}

impl Default for SimulatedBmc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBmc {
    /// A powered-on controller that accepts any user.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BmcState {
                powered: true,
                boot_flags: [0x00, 0x00],
                console_session_id: 0,
                managed_session_id: None,
                next_session_id: 0x0200_0001,
                session_open: false,
                reject_credentials: false,
                busy_replies: 0,
                silent_replies: 0,
                stale_first: false,
                commands: Vec::new(),
            }),
        }
    }

    pub fn set_powered(&self, powered: bool) {
        self.state.lock().powered = powered;
    }

    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.state.lock().reject_credentials = reject;
    }

    /// Answers the next `count` commands with "node busy".
    pub fn answer_busy(&self, count: u32) {
        self.state.lock().busy_replies = count;
    }

    /// Ignores the next `count` datagrams.
    pub fn drop_next(&self, count: u32) {
        self.state.lock().silent_replies = count;
    }

    /// Precedes every command answer with one carrying the wrong sequence.
    pub fn send_stale_first(&self, stale: bool) {
        self.state.lock().stale_first = stale;
    }

    pub fn is_session_open(&self) -> bool {
        self.state.lock().session_open
    }

    /// Id of the most recently issued session.
    pub fn last_session_id(&self) -> Option<u32> {
        self.state.lock().managed_session_id
    }

    /// Every command received so far, as `(network function, opcode)`.
    pub fn commands(&self) -> Vec<(NetworkFunction, u8)> {
        self.state.lock().commands.clone()
    }

    /// Datagrams answering `datagram`.  Empty when the datagram is dropped
    /// or cannot be parsed.
    pub fn handle(&self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        if state.silent_replies > 0 {
            state.silent_replies -= 1;
            return Vec::new();
        }

        let packet = match SessionPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "simulated controller ignoring datagram");
                return Vec::new();
            }
        };

        let answers = match packet.payload_type() {
            PayloadType::Ipmi => state.command(&packet),
            PayloadType::OpenSessionRequest => state.open_session(&packet.payload),
            PayloadType::Rakp1 => state.rakp1(&packet.payload),
            PayloadType::Rakp3 => state.rakp3(&packet.payload),
            other => Err(ProtocolError::Malformed(format!(
                "console sent controller payload {other:?}"
            ))),
        };
        answers.unwrap_or_else(|e| {
            debug!(error = %e, "simulated controller rejected datagram");
            Vec::new()
        })
    }

    /// Serves datagrams on `socket` until the task is aborted.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; 1024];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "simulated controller receive failed");
                    continue;
                }
            };
            for answer in self.handle(&buf[..len]) {
                if let Err(e) = socket.send_to(&answer, peer).await {
                    warn!(error = %e, peer = %peer, "simulated controller send failed");
                }
            }
        }
    }

    /// Binds a loopback UDP socket and serves it in the background.
    pub async fn bind(self: Arc<Self>) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let address = socket.local_addr()?;
        let handle = tokio::spawn(self.serve(socket));
        Ok((address, handle))
    }
}

impl BmcState {
    fn command(&mut self, packet: &SessionPacket) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let request = decode_request(&packet.payload)?;
        self.commands.push((request.network_function, request.command));

        let (completion, data) = if self.busy_replies > 0 && !is_session_control(&request) {
            self.busy_replies -= 1;
            (CompletionCode::NodeBusy, Vec::new())
        } else {
            self.answer(&request)
        };

        // Inside a session, answers carry the console's session id.
        let header = match packet.header {
            SessionHeader::V20 {
                payload_type,
                sequence,
                ..
            } => SessionHeader::V20 {
                payload_type,
                session_id: self.console_session_id,
                sequence,
            },
            v15 @ SessionHeader::V15 { .. } => v15,
        };

        let mut answers = Vec::with_capacity(2);
        if self.stale_first {
            let stale = LanRequest {
                sequence: (request.sequence + 1) % SEQUENCE_MODULUS,
                ..request.clone()
            };
            answers.push(wrap(header, encode_response(&stale, completion, &data))?);
        }
        answers.push(wrap(header, encode_response(&request, completion, &data))?);
        Ok(answers)
    }

    fn answer(&mut self, request: &LanRequest) -> (CompletionCode, Vec<u8>) {
        let d = request.data.as_slice();
        let ok = |data: Vec<u8>| (CompletionCode::Ok, data);
        match (request.network_function, request.command) {
            // Get Chassis Status
            (NetworkFunction::Chassis, 0x01) => ok(vec![u8::from(self.powered), 0x00, 0x00]),
            // Chassis Control
            (NetworkFunction::Chassis, 0x02) => match d.first() {
                Some(0x00) | Some(0x05) => {
                    self.powered = false;
                    ok(Vec::new())
                }
                Some(0x01) | Some(0x02) | Some(0x03) => {
                    self.powered = true;
                    ok(Vec::new())
                }
                _ => (CompletionCode::ParameterOutOfRange, Vec::new()),
            },
            // Chassis Identify
            (NetworkFunction::Chassis, 0x04) => ok(Vec::new()),
            // Set / Get System Boot Options
            (NetworkFunction::Chassis, 0x08) if d.len() >= 3 => {
                self.boot_flags = [d[1], d[2]];
                ok(Vec::new())
            }
            (NetworkFunction::Chassis, 0x09) => ok(vec![
                0x01,
                0x05,
                self.boot_flags[0],
                self.boot_flags[1],
                0x00,
                0x00,
                0x00,
            ]),
            // Get Device ID
            (NetworkFunction::Application, 0x01) => ok(vec![
                0x20, 0x01, 0x02, 0x10, 0x02, 0xBF, 0x57, 0x01, 0x00, 0x3E, 0x00,
            ]),
            // Cold Reset
            (NetworkFunction::Application, 0x02) => ok(Vec::new()),
            // Get Self Test Results
            (NetworkFunction::Application, 0x04) => ok(vec![0x55, 0x00]),
            // Get ACPI Power State
            (NetworkFunction::Application, 0x07) => {
                ok(vec![if self.powered { 0x00 } else { 0x05 }, 0x00])
            }
            // Get Channel Authentication Capabilities
            (NetworkFunction::Application, 0x38) => {
                ok(vec![0x01, 0x81, 0x04, 0x02, 0x00, 0x00, 0x00, 0x00])
            }
            // Set Session Privilege Level
            (NetworkFunction::Application, 0x3B) if !d.is_empty() => ok(vec![d[0]]),
            // Close Session
            (NetworkFunction::Application, 0x3C) => {
                self.session_open = false;
                ok(Vec::new())
            }
            // Get Channel Cipher Suites
            (NetworkFunction::Application, 0x54) if d.len() >= 3 => {
                let start = usize::from(d[2] & 0x3F) * CIPHER_SUITE_PAGE_SIZE;
                let end = (start + CIPHER_SUITE_PAGE_SIZE).min(ADVERTISED_SUITES.len());
                let mut data = vec![0x01];
                if start < end {
                    data.extend_from_slice(&ADVERTISED_SUITES[start..end]);
                }
                ok(data)
            }
            // Get SEL Info
            (NetworkFunction::Storage, 0x40) => ok(vec![
                0x51, 0x03, 0x00, 0x00, 0x10, 0x10, 0x20, 0x30, 0x40, 0x00, 0x00, 0x00, 0x00, 0x0F,
            ]),
            // Get Sensor Reading
            (NetworkFunction::SensorEvent, 0x2D) if !d.is_empty() => {
                ok(vec![0x20u8.wrapping_add(d[0]), 0x40])
            }
            // Get LAN Configuration Parameters (MAC address)
            (NetworkFunction::Transport, 0x02) if !d.is_empty() => {
                ok(vec![0x11, 0x00, 0x1B, 0x21, 0x0A, 0x0B, d[0] & 0x0F])
            }
            _ => (CompletionCode::InvalidCommand, Vec::new()),
        }
    }

    fn open_session(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let request = OpenSessionRequest::decode(payload)?;
        self.console_session_id = request.console_session_id;
        let status = if request.suite.is_unauthenticated() {
            0
        } else {
            NO_MATCHING_SUITE
        };
        let managed_session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);
        if status == 0 {
            self.managed_session_id = Some(managed_session_id);
        }
        let response = OpenSessionResponse {
            message_tag: request.message_tag,
            status,
            console_session_id: request.console_session_id,
            managed_session_id,
            suite: request.suite,
        };
        Ok(vec![handshake(
            PayloadType::OpenSessionResponse,
            response.encode(request.privilege),
        )?])
    }

    fn rakp1(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let rakp1 = Rakp1::decode(payload)?;
        let known_session = Some(rakp1.managed_session_id) == self.managed_session_id;
        let status = if self.reject_credentials || !known_session {
            UNAUTHORIZED_NAME
        } else {
            0
        };
        let rakp2 = Rakp2 {
            message_tag: rakp1.message_tag,
            status,
            console_session_id: self.console_session_id,
            managed_random: [0x5A; 16],
            managed_guid: [0xA5; 16],
            auth_code: Vec::new(),
        };
        Ok(vec![handshake(PayloadType::Rakp2, rakp2.encode())?])
    }

    fn rakp3(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let rakp3 = Rakp3::decode(payload)?;
        self.session_open = rakp3.status == 0;
        let rakp4 = Rakp4 {
            message_tag: rakp3.message_tag,
            status: 0,
            console_session_id: self.console_session_id,
            integrity_check: Vec::new(),
        };
        Ok(vec![handshake(PayloadType::Rakp4, rakp4.encode())?])
    }
}

/// Commands that must keep working while the controller reports busy.
fn is_session_control(request: &LanRequest) -> bool {
    request.network_function == NetworkFunction::Application
        && matches!(request.command, 0x38 | 0x3B | 0x3C | 0x54)
}

fn wrap(header: SessionHeader, frame: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    SessionPacket {
        header,
        payload: frame,
    }
    .encode()
}

fn handshake(payload_type: PayloadType, payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    SessionPacket::v20(payload_type, 0, 0, payload).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oob_core::protocol::{
        decode_response, encode_request, AuthenticationType, Command, CommandKind, IpmiVersion,
        ResponseData,
    };

    fn ask(bmc: &SimulatedBmc, kind: CommandKind) -> ResponseData {
        let cmd = Command::new(IpmiVersion::V15, AuthenticationType::None, kind).unwrap();
        let datagram = SessionPacket::pre_session(encode_request(&cmd, 7)).encode().unwrap();
        let answers = bmc.handle(&datagram);
        let packet = SessionPacket::decode(answers.last().expect("answer")).unwrap();
        cmd.parse_response(&decode_response(&packet.payload).unwrap())
            .expect("parse")
    }

    #[test]
    fn test_chassis_control_changes_reported_power() {
        // Arrange
        let bmc = SimulatedBmc::new();

        // Act
        ask(
            &bmc,
            CommandKind::ChassisControl(oob_core::protocol::PowerAction::PowerDown),
        );

        // Assert
        assert!(!bmc.is_powered());
        assert!(matches!(
            ask(&bmc, CommandKind::GetChassisStatus),
            ResponseData::ChassisStatus(s) if !s.power_on
        ));
    }

    #[test]
    fn test_drop_next_swallows_datagrams() {
        let bmc = SimulatedBmc::new();
        bmc.drop_next(1);
        let cmd = Command::new(IpmiVersion::V15, AuthenticationType::None, CommandKind::GetDeviceId)
            .unwrap();
        let datagram = SessionPacket::pre_session(encode_request(&cmd, 0)).encode().unwrap();
        assert!(bmc.handle(&datagram).is_empty());
        assert_eq!(bmc.handle(&datagram).len(), 1);
    }

    #[test]
    fn test_cipher_suite_list_is_parseable() {
        let records = match ask(&SimulatedBmc::new(), CommandKind::GetChannelCipherSuites { list_index: 0 }) {
            ResponseData::CipherSuiteData { records, .. } => records,
            other => panic!("unexpected {other:?}"),
        };
        let suites = oob_core::protocol::parse_cipher_suite_records(&records).expect("parse");
        assert_eq!(suites.len(), 2);
        assert!(suites[0].is_unauthenticated());
        assert!(!suites[1].is_unauthenticated());
    }
}
