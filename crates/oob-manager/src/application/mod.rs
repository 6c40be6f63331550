//! Application layer use cases for the fleet manager.
//!
//! # What lives here? (for beginners)
//!
//! Everything in this layer coordinates domain objects from `oob_core` and
//! talks to the outside world only through traits (`BoardService`,
//! `CommandChannel`).  Concrete sockets and vendor plugins are injected from
//! the infrastructure layer, so every use case can be unit-tested with
//! in-memory doubles.
//!
//! # Sub-modules
//!
//! - **`board_service`** – The uniform capability contract every vendor
//!   plugin implements, plus the typed request/reply pair the dispatcher uses.
//!
//! - **`context`** – The explicit per-operation context passed to plugins.
//!
//! - **`registry`** – Resolves a node's board type to its plugin instance.
//!
//! - **`gate`** / **`scheduler`** – Per-node bounded concurrency and the
//!   per-node timer host for backoff waits and keepalive jobs.
//!
//! - **`dispatcher`** – Runs one operation as a retryable task under the gate
//!   and classifies its outcome.
//!
//! - **`discovery`** – The bounded first-contact probe and its status store.
//!
//! - **`manage_nodes`** – The in-memory registry of managed nodes.

pub mod board_service;
pub mod context;
pub mod discovery;
pub mod dispatcher;
pub mod gate;
pub mod manage_nodes;
pub mod registry;
pub mod scheduler;
