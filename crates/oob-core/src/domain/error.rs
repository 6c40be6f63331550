//! The classified error taxonomy shared by every management operation.
//!
//! # Classification (for readers new to the retry model)
//!
//! Every failure that leaves a board operation ends up as a
//! [`ManagementError`], and every `ManagementError` falls into exactly one
//! [`ErrorClass`]:
//!
//! | Variant                  | Class       | Meaning                                   |
//! |--------------------------|-------------|-------------------------------------------|
//! | `Connection`             | `Retryable` | transport/negotiation/auth failure        |
//! | `Protocol` (busy code)   | `Busy`      | controller answered "node busy"           |
//! | `Protocol` (other code)  | `Fatal`     | completion-code or framing mismatch       |
//! | `ResourceBusy`           | `Busy`      | local concurrency/queue limit exceeded    |
//! | `Configuration`          | `Fatal`     | no plugin for the board, unknown node     |
//! | `OperationNotSupported`  | `Fatal`     | capability absent for this board type     |
//! | `Operation`              | `Fatal`     | plugin-level failure                      |
//!
//! Only `Retryable` errors are retried internally; `Busy` is a signal for the
//! caller to come back later and is never retried by the dispatcher.

use thiserror::Error;

use crate::domain::hardware::Operation;
use crate::domain::node::{BoardType, NodeId};
use crate::protocol::codec::ProtocolError;

/// Transport- and session-level failures.  Always retryable.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A socket operation failed.
    #[error("transport I/O error talking to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// No matching response arrived within the configured retransmits.
    #[error("no response from {address} after {attempts} attempt(s)")]
    Timeout { address: String, attempts: u32 },

    /// The session handshake was refused or returned something unexpected.
    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    /// The controller rejected the credentials (RAKP status code).
    #[error("authentication rejected by controller (status 0x{0:02X})")]
    Authentication(u8),

    /// The configured cipher suite index is outside the advertised list.
    #[error("cipher suite index {index} not advertised ({available} available)")]
    NoCipherSuite { index: usize, available: usize },

    /// The selected suite needs algorithms the connector does not implement.
    #[error("cipher suite {0} requires algorithms this connector does not implement")]
    UnsupportedCipherSuite(u8),

    /// A command was issued while no session is open.
    #[error("no open session")]
    SessionClosed,

    /// A datagram was sent before the transport was connected.
    #[error("transport not connected")]
    NotConnected,
}

/// How the dispatcher must treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry up to the task's attempt budget.
    Retryable,
    /// Surface immediately; the caller may retry later from outside.
    Busy,
    /// Surface immediately; retrying cannot help.
    Fatal,
}

/// Every failure a management operation can surface.
#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A concurrency slot or queue position could not be obtained.
    #[error("resource busy for node {node_id}: {reason}")]
    ResourceBusy { node_id: NodeId, reason: String },

    /// A configuration defect, e.g. no plugin registered for the board type.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation {operation} is not supported by board {board}")]
    OperationNotSupported { operation: Operation, board: BoardType },

    /// A plugin-level failure that retrying will not fix.
    #[error("operation failed on node {node_id}: {message}")]
    Operation { node_id: NodeId, message: String },
}

impl ManagementError {
    /// Shorthand for a [`ManagementError::ResourceBusy`].
    pub fn busy(node_id: &NodeId, reason: impl Into<String>) -> Self {
        ManagementError::ResourceBusy {
            node_id: node_id.clone(),
            reason: reason.into(),
        }
    }

    /// Returns the retry class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ManagementError::Connection(_) => ErrorClass::Retryable,
            ManagementError::ResourceBusy { .. } => ErrorClass::Busy,
            ManagementError::Protocol(e) if e.is_busy() => ErrorClass::Busy,
            ManagementError::Protocol(_)
            | ManagementError::Configuration(_)
            | ManagementError::OperationNotSupported { .. }
            | ManagementError::Operation { .. } => ErrorClass::Fatal,
        }
    }

    /// `true` for transport-level failures that invalidate the session.
    pub fn is_connection(&self) -> bool {
        matches!(self, ManagementError::Connection(_))
    }
}
