//! Network infrastructure: the datagram transport, the session connector and
//! the per-node session manager.
//!
//! # Sub-modules
//!
//! - **`transport`** – Sends and receives raw datagrams (UDP in production,
//!   mocked in tests).
//!
//! - **`connector`** – Speaks the session protocol over a transport: cipher
//!   suite discovery, Open Session / RAKP, sequence-correlated command
//!   exchange with retransmission, and session close.
//!
//! - **`emulator`** – An in-process management controller used by the
//!   connector tests and the loopback end-to-end tests.
//!
//! - **`session_manager`** – Owns exactly one connector per node and drives
//!   the `Closed → Negotiating → Open → Invalid` state machine on top of it.

pub mod connector;
pub mod emulator;
pub mod session_manager;
pub mod transport;
