//! Managed node identity and mutable discovery state.
//!
//! A [`Node`] is created when an external caller registers a server, is
//! shared (behind an `Arc`) by every task that targets it, and is never
//! destroyed while managed.  Only two fields change after registration –
//! `discoverable` and `powered` – and both are atomics so that tasks can update
//! them through a shared reference.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Stable identifier of a managed node (e.g. `"N1"` or a rack slot label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Username/password pair used to open a controller session.
///
/// `Debug` output redacts the password so credentials never reach the logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Board identity used to pick the vendor plugin for a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardType {
    pub vendor: String,
    pub model: String,
}

impl BoardType {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vendor, self.model)
    }
}

/// Terminal result of one discovery run, as written to the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    Success,
    Failure,
}

/// A rack server managed over its out-of-band controller.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    address: SocketAddr,
    credentials: Credentials,
    board: BoardType,
    discoverable: AtomicBool,
    powered: AtomicBool,
}

impl Node {
    /// Creates a node that is neither discoverable nor known to be powered.
    pub fn new(id: NodeId, address: SocketAddr, credentials: Credentials, board: BoardType) -> Self {
        Self {
            id,
            address,
            credentials,
            board,
            discoverable: AtomicBool::new(false),
            powered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Address of the node's management controller (usually port 623).
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn board(&self) -> &BoardType {
        &self.board
    }

    pub fn is_discoverable(&self) -> bool {
        self.discoverable.load(Ordering::Acquire)
    }

    pub fn set_discoverable(&self, discoverable: bool) {
        self.discoverable.store(discoverable, Ordering::Release);
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::Release);
    }
}
