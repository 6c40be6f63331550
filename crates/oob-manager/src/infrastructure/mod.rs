//! Infrastructure layer for the fleet manager.
//!
//! Contains the adapters that touch the outside world: UDP transport and the
//! session connector, vendor board plugins, TOML configuration, and the
//! [`service::ManagementService`] that wires them into the application layer.
//!
//! **Dependency rule**: this layer may depend on `application` and `oob_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod boards;
pub mod network;
pub mod service;
pub mod storage;
