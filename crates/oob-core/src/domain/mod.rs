//! Domain layer: nodes, hardware descriptors, and the error taxonomy.
//!
//! Nothing in here performs I/O.  The manager crate builds its session,
//! gating and dispatch logic on top of these types.

pub mod error;
pub mod hardware;
pub mod node;
