//! BmcConnector: the session protocol spoken to one management controller.
//!
//! # Exchange model (for beginners)
//!
//! The protocol runs over UDP, so every request may be lost and every
//! response may arrive late or twice.  [`LanConnector`] therefore:
//!
//! 1. stamps each LAN request with the next 6-bit sequence number,
//! 2. sends it and waits up to `response_timeout` for an answer,
//! 3. discards any datagram that does not decode, that is addressed to a
//!    session other than the open one, or whose sequence number differs from
//!    the outstanding request (a late answer to an earlier retransmission,
//!    for example),
//! 4. retransmits up to `retransmits` times before giving up with
//!    `ConnectionError::Timeout`.
//!
//! Before a session exists, commands travel in version 1.5 packets with
//! authentication type "none".  [`BmcConnector::open_session`] then runs the
//! Open Session / RAKP 1-4 handshake, after which commands travel in RMCP+
//! packets tagged with the controller's session id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oob_core::protocol::session::{
    OpenSessionRequest, OpenSessionResponse, PayloadType, Rakp1, Rakp2, Rakp3, Rakp4, SessionPacket,
};
use oob_core::protocol::{
    decode_response, encode_request, parse_cipher_suite_records, AuthenticationType,
    ChannelAuthCapabilities, CipherSuite, Command, CommandKind, IpmiVersion, PrivilegeLevel,
    ProtocolError, ResponseData, SequenceCounter, CIPHER_SUITE_PAGE_SIZE,
};
use oob_core::{ConnectionError, Credentials, ManagementError, Node};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::infrastructure::network::session_manager::ConnectorFactory;
use crate::infrastructure::network::transport::{Transport, UdpTransport};

/// Cipher suite list indexes are six bits wide.
const MAX_CIPHER_SUITE_PAGES: u8 = 64;

/// Timing of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanSettings {
    /// How long to wait for an answer before retransmitting.
    pub response_timeout: Duration,
    /// Retransmissions after the first send.
    pub retransmits: u32,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            retransmits: 2,
        }
    }
}

/// Protocol operations the session manager drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BmcConnector: Send {
    /// Opens the transport to the controller.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    async fn channel_auth_capabilities(&mut self) -> Result<ChannelAuthCapabilities, ManagementError>;

    /// Every cipher suite the controller advertises, in list order.
    async fn cipher_suites(&mut self) -> Result<Vec<CipherSuite>, ManagementError>;

    /// Runs Open Session and RAKP 1-4.
    async fn open_session(
        &mut self,
        suite: CipherSuite,
        privilege: PrivilegeLevel,
        credentials: Credentials,
    ) -> Result<(), ManagementError>;

    fn is_session_valid(&self) -> bool;

    /// Sends one command and returns its typed, validated response.
    async fn exchange(&mut self, command: CommandKind) -> Result<ResponseData, ManagementError>;

    /// Closes the session on the controller side.  No-op without a session.
    async fn close_session(&mut self) -> Result<(), ManagementError>;

    async fn close_connection(&mut self);

    /// Drops every piece of client-side state.
    async fn tear_down(&mut self);
}

struct ActiveSession {
    managed_session_id: u32,
    console_session_id: u32,
    outbound_sequence: u32,
}

/// [`BmcConnector`] over any [`Transport`].
///
/// Only the "none" cipher suite family is executed; suites that need an
/// authentication, integrity or confidentiality algorithm are refused before
/// any datagram is sent.
pub struct LanConnector<T: Transport> {
    address: SocketAddr,
    settings: LanSettings,
    transport: T,
    sequence: SequenceCounter,
    message_tag: u8,
    session: Option<ActiveSession>,
}

impl<T: Transport> LanConnector<T> {
    pub fn new(address: SocketAddr, settings: LanSettings, transport: T) -> Self {
        Self {
            address,
            settings,
            transport,
            sequence: SequenceCounter::new(),
            message_tag: 0,
            session: None,
        }
    }

    fn next_tag(&mut self) -> u8 {
        self.message_tag = self.message_tag.wrapping_add(1);
        self.message_tag
    }

    fn io_error(&self, source: std::io::Error) -> ManagementError {
        ConnectionError::Io {
            address: self.address.to_string(),
            source,
        }
        .into()
    }

    /// Sends `datagram` until `accept` recognises an answer or the
    /// retransmit budget is spent.
    ///
    /// `accept` returns `None` for datagrams that belong to something else.
    async fn round_trip<R>(
        &self,
        datagram: &[u8],
        mut accept: impl FnMut(SessionPacket) -> Option<Result<R, ProtocolError>> + Send,
    ) -> Result<R, ManagementError> {
        if !self.transport.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }

        let attempts = self.settings.retransmits + 1;
        for attempt in 1..=attempts {
            self.transport
                .send(datagram)
                .await
                .map_err(|e| self.io_error(e))?;
            let deadline = Instant::now() + self.settings.response_timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some(bytes) = self
                    .transport
                    .recv(remaining)
                    .await
                    .map_err(|e| self.io_error(e))?
                else {
                    break;
                };
                let packet = match SessionPacket::decode(&bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(address = %self.address, error = %e, "discarding undecodable datagram");
                        continue;
                    }
                };
                if let Some(result) = accept(packet) {
                    return result.map_err(ManagementError::from);
                }
            }
            debug!(address = %self.address, attempt, attempts, "no answer");
        }

        Err(ConnectionError::Timeout {
            address: self.address.to_string(),
            attempts,
        }
        .into())
    }
}

/// Accepts a handshake reply of type `expected` whose message tag is `tag`.
fn handshake_reply<M>(
    packet: SessionPacket,
    expected: PayloadType,
    tag: u8,
    decode: fn(&[u8]) -> Result<M, ProtocolError>,
    tag_of: fn(&M) -> u8,
) -> Option<Result<M, ProtocolError>> {
    if packet.payload_type() != expected {
        return None;
    }
    match decode(&packet.payload) {
        Ok(message) if tag_of(&message) == tag => Some(Ok(message)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}

fn unexpected(command: &str, data: &ResponseData) -> ManagementError {
    ProtocolError::Malformed(format!("{command} answered with {data:?}")).into()
}

fn random_bytes() -> [u8; 16] {
    Uuid::new_v4().into_bytes()
}

#[async_trait]
impl<T: Transport> BmcConnector for LanConnector<T> {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport
            .connect(self.address)
            .await
            .map_err(|source| ConnectionError::Io {
                address: self.address.to_string(),
                source,
            })
    }

    async fn channel_auth_capabilities(&mut self) -> Result<ChannelAuthCapabilities, ManagementError> {
        let command = CommandKind::GetChannelAuthCapabilities {
            privilege: PrivilegeLevel::Administrator,
        };
        match self.exchange(command).await? {
            ResponseData::ChannelAuthCapabilities(caps) => Ok(caps),
            other => Err(unexpected("Get Channel Authentication Capabilities", &other)),
        }
    }

    async fn cipher_suites(&mut self) -> Result<Vec<CipherSuite>, ManagementError> {
        let mut records = Vec::new();
        for list_index in 0..MAX_CIPHER_SUITE_PAGES {
            match self.exchange(CommandKind::GetChannelCipherSuites { list_index }).await? {
                ResponseData::CipherSuiteData { records: page, .. } => {
                    let last_page = page.len() < CIPHER_SUITE_PAGE_SIZE;
                    records.extend_from_slice(&page);
                    if last_page {
                        break;
                    }
                }
                other => return Err(unexpected("Get Channel Cipher Suites", &other)),
            }
        }
        let suites = parse_cipher_suite_records(&records)?;
        debug!(address = %self.address, count = suites.len(), "cipher suites advertised");
        Ok(suites)
    }

    async fn open_session(
        &mut self,
        suite: CipherSuite,
        privilege: PrivilegeLevel,
        credentials: Credentials,
    ) -> Result<(), ManagementError> {
        if !suite.is_unauthenticated() {
            return Err(ConnectionError::UnsupportedCipherSuite(suite.id).into());
        }

        let seed = random_bytes();
        let console_session_id = u32::from_le_bytes([seed[0], seed[1], seed[2], seed[3]]) | 1;

        // Open Session Request / Response
        let tag = self.next_tag();
        let request = OpenSessionRequest {
            message_tag: tag,
            privilege,
            console_session_id,
            suite,
        };
        let datagram =
            SessionPacket::v20(PayloadType::OpenSessionRequest, 0, 0, request.encode()).encode()?;
        let opened = self
            .round_trip(&datagram, |packet| {
                handshake_reply(
                    packet,
                    PayloadType::OpenSessionResponse,
                    tag,
                    OpenSessionResponse::decode,
                    |m: &OpenSessionResponse| m.message_tag,
                )
            })
            .await?;
        if opened.status != 0 {
            return Err(ConnectionError::Negotiation(format!(
                "open session rejected with status 0x{:02X}",
                opened.status
            ))
            .into());
        }
        if opened.console_session_id != console_session_id {
            return Err(ConnectionError::Negotiation(format!(
                "open session answered for console session 0x{:08X}",
                opened.console_session_id
            ))
            .into());
        }
        let managed_session_id = opened.managed_session_id;

        // RAKP 1 / 2
        let tag = self.next_tag();
        let rakp1 = Rakp1 {
            message_tag: tag,
            managed_session_id,
            console_random: random_bytes(),
            privilege,
            username: credentials.username.clone(),
        };
        let datagram = SessionPacket::v20(PayloadType::Rakp1, 0, 0, rakp1.encode()?).encode()?;
        let rakp2 = self
            .round_trip(&datagram, |packet| {
                handshake_reply(packet, PayloadType::Rakp2, tag, Rakp2::decode, |m: &Rakp2| m.message_tag)
            })
            .await?;
        if rakp2.status != 0 {
            return Err(ConnectionError::Authentication(rakp2.status).into());
        }

        // RAKP 3 / 4.  With suite 0 the key-exchange authentication codes are
        // empty, so the password never goes on the wire.
        let tag = self.next_tag();
        let rakp3 = Rakp3 {
            message_tag: tag,
            status: 0,
            managed_session_id,
            auth_code: Vec::new(),
        };
        let datagram = SessionPacket::v20(PayloadType::Rakp3, 0, 0, rakp3.encode()).encode()?;
        let rakp4 = self
            .round_trip(&datagram, |packet| {
                handshake_reply(packet, PayloadType::Rakp4, tag, Rakp4::decode, |m: &Rakp4| m.message_tag)
            })
            .await?;
        if rakp4.status != 0 {
            return Err(ConnectionError::Authentication(rakp4.status).into());
        }

        self.session = Some(ActiveSession {
            managed_session_id,
            console_session_id,
            outbound_sequence: 0,
        });
        info!(
            address = %self.address,
            user = %credentials.username,
            session_id = format_args!("0x{managed_session_id:08X}"),
            "session established"
        );
        Ok(())
    }

    fn is_session_valid(&self) -> bool {
        self.session.is_some() && self.transport.is_connected()
    }

    async fn exchange(&mut self, kind: CommandKind) -> Result<ResponseData, ManagementError> {
        let (version, authentication) = match self.session {
            Some(_) => (IpmiVersion::V20, AuthenticationType::RmcpPlus),
            None => (IpmiVersion::V15, AuthenticationType::None),
        };
        let command = Command::new(version, authentication, kind)?;
        let sequence = self.sequence.next();
        let frame = encode_request(&command, sequence);

        let packet = match self.session.as_mut() {
            Some(session) => {
                // Session sequence 0 is reserved for pre-session traffic.
                session.outbound_sequence = session.outbound_sequence.wrapping_add(1).max(1);
                SessionPacket::v20(
                    PayloadType::Ipmi,
                    session.managed_session_id,
                    session.outbound_sequence,
                    frame,
                )
            }
            None => SessionPacket::pre_session(frame),
        };
        let datagram = packet.encode()?;
        debug!(
            address = %self.address,
            command = command.kind().name(),
            sequence,
            "sending command"
        );

        let address = self.address;
        // The controller addresses its answers to our console session id.
        let console_session_id = self.session.as_ref().map(|session| session.console_session_id);
        let response = self
            .round_trip(&datagram, move |packet| {
                if packet.payload_type() != PayloadType::Ipmi {
                    return None;
                }
                if let Some(expected) = console_session_id {
                    if packet.session_id() != expected {
                        debug!(
                            address = %address,
                            expected = format_args!("0x{expected:08X}"),
                            actual = format_args!("0x{:08X}", packet.session_id()),
                            "discarding answer for another session"
                        );
                        return None;
                    }
                }
                match decode_response(&packet.payload) {
                    Ok(response) if response.sequence == sequence => Some(Ok(response)),
                    Ok(response) => {
                        debug!(
                            address = %address,
                            expected = sequence,
                            actual = response.sequence,
                            "discarding uncorrelated response"
                        );
                        None
                    }
                    Err(e) => {
                        debug!(address = %address, error = %e, "discarding undecodable frame");
                        None
                    }
                }
            })
            .await?;

        Ok(command.parse_response(&response)?)
    }

    async fn close_session(&mut self) -> Result<(), ManagementError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let session_id = session.managed_session_id;
        debug!(
            address = %self.address,
            console_session_id = format_args!("0x{:08X}", session.console_session_id),
            "closing session"
        );
        let result = self
            .exchange(CommandKind::CloseSession { session_id })
            .await
            .map(|_| ());
        self.session = None;
        result
    }

    async fn close_connection(&mut self) {
        self.session = None;
        self.transport.close().await;
    }

    async fn tear_down(&mut self) {
        self.close_connection().await;
        self.sequence = SequenceCounter::new();
        self.message_tag = 0;
    }
}

/// Builds a UDP-backed [`LanConnector`] for each node.
pub fn udp_connector_factory(settings: LanSettings) -> ConnectorFactory {
    Arc::new(move |node: &Node| {
        Box::new(LanConnector::new(node.address(), settings, UdpTransport::new())) as Box<dyn BmcConnector>
    })
}
