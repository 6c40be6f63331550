//! LAN message codec for the management-controller command family.
//!
//! Request wire format:
//! ```text
//! [rsSA][netFn<<2 | rsLUN][chk1][rqSA][seq<<2 | rqLUN][cmd][data:N][chk2]
//! ```
//! Response wire format:
//! ```text
//! [rqSA][netFn<<2 | rqLUN][chk1][rsSA][seq<<2 | rsLUN][cmd][completion][data:N][chk2]
//! ```
//! `chk1` covers the first two bytes and `chk2` everything between `chk1` and
//! itself.  Both are two's-complement checksums: the covered bytes plus the
//! checksum sum to zero modulo 256.  Response network functions are odd
//! (request code + 1).  The sequence number is six bits wide.

use thiserror::Error;
use tracing::trace;

use crate::protocol::messages::{
    AuthenticationType, Command, CompletionCode, IpmiVersion, LanRequest, LanResponse,
    NetworkFunction, BMC_SLAVE_ADDRESS, REMOTE_CONSOLE_ADDRESS, SEQUENCE_MODULUS,
};

/// Minimum request length: six header bytes plus the trailing checksum.
const MIN_REQUEST_LEN: usize = 7;

/// Minimum response length: request minimum plus the completion code.
const MIN_RESPONSE_LEN: usize = 8;

/// Errors that can occur while building, encoding or decoding messages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A header or body checksum did not verify.
    #[error("{which} checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum {
        which: &'static str,
        expected: u8,
        actual: u8,
    },

    /// A frame with an even (request) network function arrived where a
    /// response was expected.
    #[error("network function 0x{0:02X} is not a response")]
    NotAResponse(u8),

    /// The response belongs to another command.
    #[error(
        "unexpected response: expected netFn/cmd {:02X}/{:02X}, got {:02X}/{:02X}",
        expected.0, expected.1, actual.0, actual.1
    )]
    UnexpectedResponse { expected: (u8, u8), actual: (u8, u8) },

    #[error("unknown network function 0x{0:02X}")]
    UnknownNetworkFunction(u8),

    /// Version 2.0 commands require the enhanced authentication type.
    #[error("protocol version {version:?} cannot be used with authentication type {authentication:?}")]
    IncompatibleAuthentication {
        version: IpmiVersion,
        authentication: AuthenticationType,
    },

    /// The controller answered with a non-success completion code.
    #[error("{command} failed with completion code {code}")]
    Completion {
        command: &'static str,
        code: CompletionCode,
    },

    /// The payload is structurally invalid.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown payload type 0x{0:02X}")]
    UnknownPayloadType(u8),

    /// The datagram does not start with a valid RMCP header.
    #[error("bad RMCP header")]
    BadRmcpHeader,
}

impl ProtocolError {
    /// The controller's completion code, when this error carries one.
    pub fn completion_code(&self) -> Option<CompletionCode> {
        match self {
            ProtocolError::Completion { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `true` when the controller reported a transient busy condition.
    pub fn is_busy(&self) -> bool {
        self.completion_code().is_some_and(CompletionCode::is_busy)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `command` as a LAN request frame.
///
/// `sequence` is reduced modulo 64 before it is placed on the wire, so any
/// counter value may be passed.
///
/// # Examples
///
/// ```rust
/// use oob_core::protocol::{encode_request, Command, CommandKind, IpmiVersion, AuthenticationType};
///
/// let cmd = Command::new(IpmiVersion::V20, AuthenticationType::RmcpPlus, CommandKind::GetChassisStatus).unwrap();
/// let frame = encode_request(&cmd, 65);
/// assert_eq!(frame[4] >> 2, 1);
/// ```
pub fn encode_request(command: &Command, sequence: u8) -> Vec<u8> {
    let kind = command.kind();
    let data = kind.request_data();
    let mut buf = Vec::with_capacity(MIN_REQUEST_LEN + data.len());

    buf.push(BMC_SLAVE_ADDRESS);
    buf.push(kind.network_function().request_code() << 2);
    buf.push(checksum(&buf[0..2]));
    buf.push(REMOTE_CONSOLE_ADDRESS);
    buf.push((sequence % SEQUENCE_MODULUS) << 2);
    buf.push(kind.code());
    buf.extend_from_slice(&data);
    buf.push(checksum(&buf[3..]));
    buf
}

/// Decodes a LAN response frame.
///
/// # Errors
///
/// Returns [`ProtocolError`] when the frame is short, a checksum fails, the
/// network function is not a known response code, or the frame is a request.
pub fn decode_response(bytes: &[u8]) -> Result<LanResponse, ProtocolError> {
    verify_frame(bytes, MIN_RESPONSE_LEN)?;

    let netfn_code = bytes[1] >> 2;
    if netfn_code % 2 == 0 {
        return Err(ProtocolError::NotAResponse(netfn_code));
    }
    let network_function = NetworkFunction::from_request_code(netfn_code - 1)
        .ok_or(ProtocolError::UnknownNetworkFunction(netfn_code))?;

    Ok(LanResponse {
        network_function,
        command: bytes[5],
        sequence: bytes[4] >> 2,
        completion_code: CompletionCode::from(bytes[6]),
        data: bytes[7..bytes.len() - 1].to_vec(),
    })
}

/// Decodes a LAN request frame.  Used by controller emulators.
///
/// # Errors
///
/// Same conditions as [`decode_response`], with the parity check inverted.
pub fn decode_request(bytes: &[u8]) -> Result<LanRequest, ProtocolError> {
    verify_frame(bytes, MIN_REQUEST_LEN)?;

    let netfn_code = bytes[1] >> 2;
    let network_function = NetworkFunction::from_request_code(netfn_code)
        .ok_or(ProtocolError::UnknownNetworkFunction(netfn_code))?;

    Ok(LanRequest {
        network_function,
        command: bytes[5],
        sequence: bytes[4] >> 2,
        data: bytes[6..bytes.len() - 1].to_vec(),
    })
}

/// Builds the response frame answering `request`.  Used by controller emulators.
pub fn encode_response(request: &LanRequest, completion: CompletionCode, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_RESPONSE_LEN + data.len());

    buf.push(REMOTE_CONSOLE_ADDRESS);
    buf.push(request.network_function.response_code() << 2);
    buf.push(checksum(&buf[0..2]));
    buf.push(BMC_SLAVE_ADDRESS);
    buf.push((request.sequence % SEQUENCE_MODULUS) << 2);
    buf.push(request.command);
    buf.push(completion.code());
    buf.extend_from_slice(data);
    buf.push(checksum(&buf[3..]));
    buf
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Two's-complement checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

fn verify_frame(bytes: &[u8], min_len: usize) -> Result<(), ProtocolError> {
    if bytes.len() < min_len {
        return Err(ProtocolError::InsufficientData {
            needed: min_len,
            available: bytes.len(),
        });
    }
    let header = checksum(&bytes[0..2]);
    if header != bytes[2] {
        trace!(expected = header, actual = bytes[2], "header checksum mismatch");
        return Err(ProtocolError::Checksum {
            which: "header",
            expected: header,
            actual: bytes[2],
        });
    }
    let last = bytes.len() - 1;
    let body = checksum(&bytes[3..last]);
    if body != bytes[last] {
        trace!(expected = body, actual = bytes[last], len = bytes.len(), "body checksum mismatch");
        return Err(ProtocolError::Checksum {
            which: "body",
            expected: body,
            actual: bytes[last],
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
