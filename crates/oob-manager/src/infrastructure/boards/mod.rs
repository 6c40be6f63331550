//! Board service plugins.
//!
//! - **`ipmi_board`** – The production plugin: implements every capability
//!   over the node's management session for a configurable [`ipmi_board::BoardProfile`].
//!
//! - **`scripted`** – A recording, scriptable plugin for tests and dry runs.

pub mod ipmi_board;
pub mod scripted;
