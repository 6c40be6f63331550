//! # oob-core
//!
//! Shared library for the out-of-band management stack containing the LAN
//! message codec, RMCP/RMCP+ session framing, node domain entities and the
//! classified error taxonomy.
//!
//! This crate is used by the manager and by controller emulators in tests.
//! It has zero dependencies on sockets, async runtimes, or vendor plugins.
//!
//! # Architecture overview
//!
//! A management controller (BMC) sits on every rack server and answers small
//! request/response datagrams on UDP port 623.  Talking to it involves three
//! layers, each of which lives in a module here:
//!
//! - **`protocol::codec`** – The innermost LAN message: addresses, network
//!   function, command opcode, a 6-bit sequence number, the payload, and two
//!   checksums.  Responses carry a completion code ahead of their payload.
//!
//! - **`protocol::session`** – The envelope around each LAN message: the RMCP
//!   header plus either a pre-session (v1.5) or an RMCP+ (v2.0) session header,
//!   and the Open Session / RAKP messages used to establish a session.
//!
//! - **`protocol::messages`** – Typed commands and the typed results decoded
//!   from fixed offsets of each response payload.
//!
//! - **`domain`** – Nodes, credentials, board identity, hardware descriptors,
//!   and the error taxonomy (`ManagementError` and its `ErrorClass`) that the
//!   manager's retry logic is driven by.

pub mod domain;
pub mod protocol;

pub use domain::error::{ConnectionError, ErrorClass, ManagementError};
pub use domain::node::{BoardType, Credentials, DiscoveryStatus, Node, NodeId};
pub use domain::hardware::Operation;
pub use protocol::codec::{decode_response, encode_request, ProtocolError};
pub use protocol::messages::{Command, CommandKind, LanResponse, ResponseData};
pub use protocol::sequence::SequenceCounter;
